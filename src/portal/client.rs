use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::clock::{madrid_to_utc, utc_midnight_epoch, MADRID};
use crate::error::BookingError;

const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const NOT_ACCEPTING_REQUESTS: &str =
    "WodBuster is not accepting more requests at this time. Try again in a minute";
const MORE_THAN_ONE_BOX: &str = "User can access more than to boxes";
/// Substring (lowercased) that marks a claim's `ErrorMsg` as a booking
/// penalty rather than a generic failure — the portal's own penalty wording
/// is undocumented upstream (`original_source/wodbooker/booker.py:262-264`
/// admits this case "should be managed in the scraper.py book function but
/// I don't really know what's the API response"), so this matches the
/// Spanish term for the penalty ("penalización"/"penalizado").
const PENALTY_MARKER: &str = "penaliz";

/// The parsed `LoadClass.ashx` response for one day, plus the UTC-midnight
/// epoch it was keyed by (needed again when constructing the claim URL).
pub struct BoxSchedule {
    pub data: Value,
    pub epoch: i64,
}

/// One class the portal reports as already claimed by the logged-in athlete
/// on a given day (`TipoEstado == "Borrable"` in `LoadClass.ashx`'s payload),
/// as returned by [`PortalClient::sync_observed_bookings`].
pub struct ObservedClass {
    pub portal_class_id: String,
    pub class_time: String,
    pub class_name: Option<String>,
    pub class_kind: Option<String>,
}

/// One user's session against the portal. Not `Clone`; the supervisor holds
/// these behind an `Arc` so a single worker owns a client at a time.
pub struct PortalClient {
    user: String,
    password: Option<String>,
    http: Client,
    cookies: RwLock<HashMap<String, String>>,
    logged: RwLock<bool>,
    pub(super) box_meta: RwLock<HashMap<String, super::sse::BoxMeta>>,
}

impl PortalClient {
    pub fn new(user: String, password: Option<String>, cookie_blob: Option<String>) -> Self {
        let cookies = cookie_blob
            .as_deref()
            .and_then(|blob| serde_json::from_str::<HashMap<String, String>>(blob).ok())
            .unwrap_or_default();

        let http = Client::builder()
            .redirect(Policy::none())
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("static TLS config is valid");

        Self {
            user,
            password,
            http,
            cookies: RwLock::new(cookies),
            logged: RwLock::new(false),
            box_meta: RwLock::new(HashMap::new()),
        }
    }

    /// Serialized cookie jar, persisted as the opaque `users.cookie` blob.
    pub fn cookie_blob(&self) -> String {
        serde_json::to_string(&*self.cookies.read().unwrap()).unwrap_or_else(|_| "{}".into())
    }

    pub(super) fn password_error_if_missing(&self) -> Option<BookingError> {
        if self.password.is_none() {
            Some(BookingError::PasswordRequired)
        } else {
            None
        }
    }

    fn cookie_header(&self) -> Option<String> {
        let cookies = self.cookies.read().unwrap();
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    fn absorb_set_cookie(&self, response: &reqwest::Response) {
        let mut jar = self.cookies.write().unwrap();
        for raw in response.headers().get_all("set-cookie") {
            if let Ok(s) = raw.to_str() {
                if let Some((pair, _attrs)) = s.split_once(';') {
                    if let Some((name, value)) = pair.split_once('=') {
                        jar.insert(name.trim().to_string(), value.trim().to_string());
                    }
                }
            }
        }
    }

    fn request(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(cookie) = self.cookie_header() {
            builder = builder.header("cookie", cookie);
        }
        builder
    }

    /// Ensures the session is authenticated, doing nothing if already
    /// `logged`. Reuses a persisted cookie when present, falling back to a
    /// fresh username/password login when the cookie has expired.
    pub async fn login(&self) -> Result<(), BookingError> {
        if *self.logged.read().unwrap() {
            return Ok(());
        }

        if self.cookie_header().is_some() {
            let response = self
                .request(
                    self.http
                        .get("https://wodbuster.com/account/roadtobox.aspx"),
                )
                .send()
                .await
                .map_err(|e| BookingError::Transient(e.to_string()))?;

            let redirects_to_login = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .map(|loc| loc.contains("login"))
                .unwrap_or(false);

            if redirects_to_login {
                self.login_with_credentials().await?;
            } else {
                *self.logged.write().unwrap() = true;
            }
        } else {
            self.login_with_credentials().await?;
        }

        Ok(())
    }

    async fn login_with_credentials(&self) -> Result<(), BookingError> {
        if let Some(err) = self.password_error_if_missing() {
            return Err(err);
        }
        let password = self.password.clone().expect("checked above");

        self.cookies.write().unwrap().clear();

        let login_url = "https://wodbuster.com/account/login.aspx";
        let initial = self
            .http
            .get(login_url)
            .send()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;
        self.absorb_set_cookie(&initial);
        let body = initial
            .text()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;

        let viewstatec = extract_hidden_field(&body, "__VIEWSTATEC")
            .ok_or_else(|| BookingError::UnparseableResponse(NOT_ACCEPTING_REQUESTS.into()))?;
        let eventvalidation = extract_hidden_field(&body, "__EVENTVALIDATION")
            .ok_or_else(|| BookingError::UnparseableResponse(NOT_ACCEPTING_REQUESTS.into()))?;
        let csrftoken = extract_hidden_field(&body, "CSRFToken")
            .ok_or_else(|| BookingError::UnparseableResponse(NOT_ACCEPTING_REQUESTS.into()))?;

        let mut data_login = base_login_fields(&csrftoken, &viewstatec, &eventvalidation);
        data_login.insert(
            "ctl00$ctl00$body$ctl00".into(),
            "ctl00$ctl00$body$ctl00|ctl00$ctl00$body$body$CtlLogin$CtlAceptar".into(),
        );
        data_login.insert("ctl00$ctl00$body$body$CtlLogin$IoTri".into(), "".into());
        data_login.insert("ctl00$ctl00$body$body$CtlLogin$IoTrg".into(), "".into());
        data_login.insert("ctl00$ctl00$body$body$CtlLogin$IoTra".into(), "".into());
        data_login.insert(
            "ctl00$ctl00$body$body$CtlLogin$IoEmail".into(),
            self.user.clone(),
        );
        data_login.insert(
            "ctl00$ctl00$body$body$CtlLogin$IoPassword".into(),
            password,
        );
        data_login.insert("ctl00$ctl00$body$body$CtlLogin$cIoUid".into(), "".into());
        data_login.insert(
            "ctl00$ctl00$body$body$CtlLogin$CtlAceptar".into(),
            "Aceptar\n".into(),
        );

        let login_response = self.login_request(login_url, data_login).await?;
        let login_text = login_response
            .text()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;

        if login_text.contains(r#"class="Warning""#) {
            return Err(BookingError::InvalidCredentials);
        }

        let viewstatec_confirm = lookup_pipe_delimited(&login_text, "__VIEWSTATEC")
            .ok_or_else(|| BookingError::UnparseableResponse(NOT_ACCEPTING_REQUESTS.into()))?;
        let eventvalidation_confirm = lookup_pipe_delimited(&login_text, "__EVENTVALIDATION")
            .ok_or_else(|| BookingError::UnparseableResponse(NOT_ACCEPTING_REQUESTS.into()))?;

        let mut data_confirm =
            base_login_fields(&csrftoken, &viewstatec_confirm, &eventvalidation_confirm);
        data_confirm.insert(
            "ctl00$ctl00$body$ctl00".into(),
            "ctl00$ctl00$body$ctl00|ctl00$ctl00$body$body$CtlConfiar$CtlSeguro".into(),
        );
        data_confirm.insert(
            "ctl00$ctl00$body$body$CtlConfiar$CtlSeguro".into(),
            "Recordar\n".into(),
        );

        self.login_request(login_url, data_confirm).await?;
        *self.logged.write().unwrap() = true;
        Ok(())
    }

    async fn login_request(
        &self,
        url: &str,
        data: HashMap<String, String>,
    ) -> Result<reqwest::Response, BookingError> {
        let response = self
            .request(self.http.post(url).form(&data))
            .send()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;
        self.absorb_set_cookie(&response);

        if response.status() != StatusCode::OK {
            return Err(BookingError::UnparseableResponse(
                NOT_ACCEPTING_REQUESTS.into(),
            ));
        }
        Ok(response)
    }

    /// Loads the portal's `LoadClass.ashx` schedule for `date` at `url`.
    pub async fn get_classes(
        &self,
        url: &str,
        date: NaiveDate,
    ) -> Result<BoxSchedule, BookingError> {
        let epoch = utc_midnight_epoch(date);
        let data = self
            .box_request(&format!(
                "{url}/athlete/handlers/LoadClass.ashx?ticks={epoch}"
            ))
            .await?;
        Ok(BoxSchedule { data, epoch })
    }

    async fn box_request(&self, url: &str) -> Result<Value, BookingError> {
        let response = self
            .request(self.http.get(url))
            .send()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;

        if response.status() == StatusCode::FOUND {
            let redirects_to_login = response
                .headers()
                .get("location")
                .and_then(|v| v.to_str().ok())
                .map(|loc| loc.contains("login"))
                .unwrap_or(false);
            if redirects_to_login {
                return Err(BookingError::InvalidBox);
            }
        }
        if response.status() != StatusCode::OK {
            return Err(BookingError::UnparseableResponse(
                "Invalid response status from WodBuster".into(),
            ));
        }

        response
            .json::<Value>()
            .await
            .map_err(|_| BookingError::UnparseableResponse("WodBuster returned a non JSON response".into()))
    }

    /// Like [`Self::box_request`] but for claim endpoints, which report a
    /// temporary double-submission lock as a 4xx body containing "locked"
    /// rather than as JSON (§4.2 step 4).
    async fn claim_request(&self, url: &str) -> Result<Value, BookingError> {
        let response = self
            .request(self.http.get(url))
            .send()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;

        if response.status().is_client_error() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if body.to_lowercase().contains("locked") {
                return Err(BookingError::BookingLocked);
            }
            return Err(BookingError::UnparseableResponse(format!(
                "unexpected {status} from claim endpoint"
            )));
        }
        if response.status() != StatusCode::OK {
            return Err(BookingError::UnparseableResponse(
                "Invalid response status from WodBuster".into(),
            ));
        }

        response.json::<Value>().await.map_err(|_| {
            BookingError::UnparseableResponse("WodBuster returned a non JSON response".into())
        })
    }

    /// Attempts to claim a seat for `target` at `url`. Returns `Ok(true)`
    /// once the seat is confirmed held (already booked counts as success).
    pub async fn book(&self, url: &str, target: NaiveDateTime) -> Result<bool, BookingError> {
        self.login().await?;

        let schedule = self.get_classes(url, target.date()).await?;
        let hour = target.format("%H:%M:%S").to_string();

        let data = schedule
            .data
            .get("Data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if data.is_empty() {
            let available_at = schedule
                .data
                .get("PrimeraHoraPublicacion")
                .and_then(Value::as_str)
                .and_then(|s| NaiveDateTime::parse_from_str(s, "%m/%d/%Y %H:%M:%S").ok())
                .map(|naive| madrid_to_utc(naive).with_timezone(&MADRID).naive_local());
            return Err(BookingError::BookingWindowNotOpen(available_at));
        }

        for class in &data {
            if class.get("Hora").and_then(Value::as_str) != Some(hour.as_str()) {
                continue;
            }

            let valor = class
                .get("Valores")
                .and_then(Value::as_array)
                .and_then(|v| v.first())
                .ok_or_else(|| BookingError::UnparseableResponse("missing Valores[0]".into()))?;

            let class_status = valor
                .get("TipoEstado")
                .and_then(Value::as_str)
                .unwrap_or_default();

            if class_status == "Borrable" {
                return Ok(true);
            }

            let details = valor
                .get("Valor")
                .ok_or_else(|| BookingError::UnparseableResponse("missing Valor".into()))?;
            let id = details
                .get("Id")
                .ok_or_else(|| BookingError::UnparseableResponse("missing Id".into()))?;
            let seats = details.get("Plazas").and_then(Value::as_i64).unwrap_or(0);
            let taken = details
                .get("AtletasEntrenando")
                .and_then(Value::as_array)
                .map(|a| a.len() as i64)
                .unwrap_or(0);

            if taken >= seats {
                return Err(BookingError::ClassFull);
            }

            let api_path = if class_status == "Cambiable" {
                "Calendario_Mover.ashx"
            } else {
                "Calendario_Inscribir.ashx"
            };
            let claim_url = format!(
                "{url}/athlete/handlers/{api_path}?id={id}&ticks={epoch}",
                epoch = schedule.epoch
            );
            let result = self.claim_request(&claim_url).await?;

            let ok = result
                .get("Res")
                .and_then(|r| r.get("EsCorrecto"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

            return if ok {
                Ok(true)
            } else {
                let msg = result
                    .get("Res")
                    .and_then(|r| r.get("ErrorMsg"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                if msg.to_lowercase().contains(PENALTY_MARKER) {
                    Err(BookingError::BookingPenalty(msg))
                } else {
                    Err(BookingError::BookingFailed(msg))
                }
            };
        }

        Err(BookingError::ClassNotFound)
    }

    /// Reports the classes already claimed by this user on `date` at `url`
    /// (§4.8's `syncObservedBookings`): every slot the portal marks
    /// `Borrable` (cancellable by its owner, i.e. already booked).
    pub async fn sync_observed_bookings(
        &self,
        url: &str,
        date: NaiveDate,
    ) -> Result<Vec<ObservedClass>, BookingError> {
        self.login().await?;
        let schedule = self.get_classes(url, date).await?;
        let data = schedule
            .data
            .get("Data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut observed = Vec::new();
        for class in &data {
            let Some(valor) = class
                .get("Valores")
                .and_then(Value::as_array)
                .and_then(|v| v.first())
            else {
                continue;
            };
            let status = valor.get("TipoEstado").and_then(Value::as_str).unwrap_or_default();
            if status != "Borrable" {
                continue;
            }

            let portal_class_id = valor
                .get("Valor")
                .and_then(|v| v.get("Id"))
                .map(|id| match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            if portal_class_id.is_empty() {
                continue;
            }

            let class_time = class
                .get("Hora")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let class_name = class.get("Nombre").and_then(Value::as_str).map(String::from);
            let class_kind = class.get("Tipo").and_then(Value::as_str).map(String::from);

            observed.push(ObservedClass {
                portal_class_id,
                class_time,
                class_name,
                class_kind,
            });
        }

        Ok(observed)
    }

    /// Resolves the single box a user has access to. Fails if the account
    /// has more than one box (the portal then never redirects away from
    /// `roadtobox.aspx`).
    pub async fn get_box_url(&self) -> Result<String, BookingError> {
        self.login().await?;
        let response = self
            .request(
                self.http
                    .get("https://wodbuster.com/account/roadtobox.aspx"),
            )
            .send()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;

        match response.headers().get("location").and_then(|v| v.to_str().ok()) {
            Some(location) if location.contains("login") => Err(BookingError::InvalidCredentials),
            Some(location) => Ok(location
                .split("/user")
                .next()
                .unwrap_or(location)
                .to_string()),
            None => Err(BookingError::UnparseableResponse(MORE_THAN_ONE_BOX.into())),
        }
    }

    pub(super) fn http(&self) -> &Client {
        &self.http
    }

    pub(super) fn cookie_header_for_sse(&self) -> Option<String> {
        self.cookie_header()
    }
}

fn base_login_fields(
    csrftoken: &str,
    viewstatec: &str,
    eventvalidation: &str,
) -> HashMap<String, String> {
    let mut data = HashMap::new();
    data.insert("CSRFToken".into(), csrftoken.to_string());
    data.insert("__EVENTTARGET".into(), "".into());
    data.insert("__EVENTARGUMENT".into(), "".into());
    data.insert("__VIEWSTATEC".into(), viewstatec.to_string());
    data.insert("__VIEWSTATE".into(), "".into());
    data.insert("__EVENTVALIDATION".into(), eventvalidation.to_string());
    data.insert("__ASYNCPOST".into(), "true".into());
    data
}

/// Scrapes `id="<name>" ... value="<value>"` out of a rendered ASP.NET
/// hidden input, tolerant of attribute order.
fn extract_hidden_field(html: &str, name: &str) -> Option<String> {
    let pattern = format!(
        r#"id=["']{}["'][^>]*\svalue=["']([^"']*)["']|value=["']([^"']*)["'][^>]*\sid=["']{}["']"#,
        regex::escape(name),
        regex::escape(name)
    );
    let re = Regex::new(&pattern).ok()?;
    let caps = re.captures(html)?;
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str().to_string())
}

/// Replicates the original's raw pipe-delimited lookup against an ASP.NET
/// partial-postback response body (`...__VIEWSTATEC|<value>|...`).
fn lookup_pipe_delimited(text: &str, name: &str) -> Option<String> {
    let index = text.find(name)?;
    let rest = &text[index + name.len() + 1..];
    rest.split('|').next().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_hidden_field_finds_value_after_id() {
        let html = r#"<input type="hidden" id="__VIEWSTATEC" value="abc123" />"#;
        assert_eq!(
            extract_hidden_field(html, "__VIEWSTATEC"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn extract_hidden_field_missing_returns_none() {
        let html = r#"<input type="hidden" id="other" value="x" />"#;
        assert_eq!(extract_hidden_field(html, "__VIEWSTATEC"), None);
    }

    #[test]
    fn lookup_pipe_delimited_reads_segment_after_name() {
        let text = "prefix__VIEWSTATEC|deadbeef|suffix";
        assert_eq!(
            lookup_pipe_delimited(text, "__VIEWSTATEC"),
            Some("deadbeef".to_string())
        );
    }

    #[test]
    fn cookie_blob_roundtrips_through_new() {
        let mut jar = HashMap::new();
        jar.insert("sid".to_string(), "xyz".to_string());
        let blob = serde_json::to_string(&jar).unwrap();
        let portal = PortalClient::new("u@example.com".into(), None, Some(blob));
        let restored: HashMap<String, String> =
            serde_json::from_str(&portal.cookie_blob()).unwrap();
        assert_eq!(restored.get("sid"), Some(&"xyz".to_string()));
    }

    #[test]
    fn penalty_marker_matches_case_insensitively() {
        assert!("Tienes una Penalización activa".to_lowercase().contains(PENALTY_MARKER));
        assert!("penalizado hasta el viernes".contains(PENALTY_MARKER));
        assert!(!"la clase ya esta completa".contains(PENALTY_MARKER));
    }
}
