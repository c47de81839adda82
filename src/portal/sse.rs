use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use futures::StreamExt;
use regex::Regex;
use serde_json::{json, Value};

use crate::clock::{utc_midnight_epoch, MADRID};
use crate::error::BookingError;

use super::client::PortalClient;

/// Event names the "changed" room emits that the worker listens for.
pub const BOOKING_HUB_EVENTS: &[&str] = &["changedBooking", "changedPizarra"];

/// `changedBooking` alone — what `BookingPenalty`/`ClassFull` wait on, as
/// opposed to `WAIT_CLASS_LOADED`'s broader `BOOKING_HUB_EVENTS` set.
pub const CHANGED_BOOKING_EVENT: &[&str] = &["changedBooking"];

const FRAME_SEPARATOR: char = '\u{1e}';

#[derive(Debug, Clone)]
pub struct BoxMeta {
    pub name: String,
    pub sse_server: String,
}

impl PortalClient {
    async fn ensure_box_meta(&self, url: &str) -> Result<BoxMeta, BookingError> {
        if let Some(meta) = self.box_meta.read().unwrap().get(url).cloned() {
            return Ok(meta);
        }

        let response = self
            .http()
            .get(format!("{url}/user/"))
            .header(
                "cookie",
                self.cookie_header_for_sse().unwrap_or_default(),
            )
            .send()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;

        let re = Regex::new(r"InitAjax\('([^']*)',\s?'([^']*)'").unwrap();
        let caps = re.captures(&body).ok_or(BookingError::InvalidBox)?;
        let meta = BoxMeta {
            name: caps[1].to_string(),
            sse_server: caps[2].to_string(),
        };

        self.box_meta
            .write()
            .unwrap()
            .insert(url.to_string(), meta.clone());
        Ok(meta)
    }

    async fn negotiate(&self, sse_server: &str) -> Result<String, BookingError> {
        let response = self
            .http()
            .post(format!("{sse_server}/bookinghub/negotiate?negotiateVersion=1"))
            .header("cookie", self.cookie_header_for_sse().unwrap_or_default())
            .send()
            .await
            .map_err(|e| BookingError::Transient(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|_| BookingError::UnparseableResponse("non JSON negotiate response".into()))?;

        body.get("connectionToken")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| BookingError::UnparseableResponse("missing connectionToken".into()))
    }

    async fn send_sse_command(&self, sse_server: &str, token: &str, command: &Value) {
        let payload = format!("{}{}", command.to_string(), FRAME_SEPARATOR);
        let _ = self
            .http()
            .post(format!("{sse_server}/bookinghub?id={token}"))
            .header("cookie", self.cookie_header_for_sse().unwrap_or_default())
            .header("content-type", "text/plain")
            .body(payload)
            .send()
            .await;
    }

    /// Waits until one of `expected_events` is observed on the box's live
    /// event hub for `date`, or `max_datetime` (Madrid-local) passes.
    /// Reconnects transparently when the stream goes quiet, mirroring the
    /// 60-second read timeout the portal's own clients rely on.
    pub async fn wait_until_event(
        &self,
        url: &str,
        date: NaiveDate,
        expected_events: &[&str],
        max_datetime: Option<NaiveDateTime>,
    ) -> Result<bool, BookingError> {
        self.login().await?;

        let max_datetime =
            max_datetime.unwrap_or_else(|| date.and_hms_opt(23, 59, 59).expect("valid time"));
        let meta = self.ensure_box_meta(url).await?;
        let epoch = utc_midnight_epoch(date);

        loop {
            if now_madrid() > max_datetime {
                return Ok(false);
            }

            let token = self.negotiate(&meta.sse_server).await?;

            let stream_response = self
                .http()
                .get(format!("{}/bookinghub?id={}", meta.sse_server, token))
                .header("accept", "text/event-stream")
                .header("cookie", self.cookie_header_for_sse().unwrap_or_default())
                .timeout(Duration::from_secs(65))
                .send()
                .await
                .map_err(|e| BookingError::Transient(e.to_string()))?;

            self.send_sse_command(&meta.sse_server, &token, &json!({"protocol": "json", "version": 1}))
                .await;
            self.send_sse_command(
                &meta.sse_server,
                &token,
                &json!({
                    "arguments": [meta.name, epoch.to_string()],
                    "invocationId": "0",
                    "target": "JoinRoom",
                    "type": 1,
                }),
            )
            .await;

            let mut byte_stream = stream_response.bytes_stream();
            let mut buffer = String::new();

            loop {
                let chunk = tokio::time::timeout(Duration::from_secs(60), byte_stream.next()).await;
                match chunk {
                    Ok(Some(Ok(bytes))) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(idx) = buffer.find(FRAME_SEPARATOR) {
                            let frame = buffer[..idx].to_string();
                            buffer.drain(..=idx);
                            if frame.trim().is_empty() {
                                continue;
                            }
                            if let Ok(parsed) = serde_json::from_str::<Value>(&frame) {
                                if let Some(target) = parsed.get("target").and_then(Value::as_str) {
                                    if expected_events.contains(&target) {
                                        return Ok(true);
                                    }
                                }
                            }
                        }
                    }
                    Ok(Some(Err(_))) | Ok(None) => break, // stream ended, reconnect
                    Err(_) => break,                      // 60s of silence, reconnect
                }

                if now_madrid() > max_datetime {
                    return Ok(false);
                }
            }
        }
    }
}

fn now_madrid() -> NaiveDateTime {
    chrono::Utc::now().with_timezone(&MADRID).naive_local()
}
