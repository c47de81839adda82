//! SMTP mail transport, grounded on `original_source/wodbooker/mailer.py`'s
//! `smtplib` usage, translated to the ecosystem-standard `lettre` async
//! transport.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::AppConfig;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid address: {0}")]
    InvalidAddress(#[from] lettre::address::AddressError),
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] lettre::error::Error),
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// Thin wrapper over an `AsyncSmtpTransport`, built once from `AppConfig` at
/// startup and reused by every worker's `Notifier`.
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl Mailer {
    /// Builds a mailer from `EMAIL_SENDER`/`EMAIL_USER`/`EMAIL_PASSWORD`
    /// (§6). Returns `None` when any of the three is absent — mail is then
    /// silently skipped, matching the original's "no SMTP configured" path.
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        if !config.has_mail_transport() {
            return None;
        }
        let user = config.email_user.clone()?;
        let password = config.email_password.clone()?;
        let sender = config.email_sender.clone()?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp_relay_host(&user))
            .ok()?
            .credentials(Credentials::new(user, password))
            .build();

        Some(Self {
            transport,
            from: sender,
        })
    }

    pub async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.from.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        self.transport.send(message).await?;
        Ok(())
    }
}

/// Derives the SMTP relay host from the sending account's email domain
/// (e.g. `user@gmail.com` → `smtp.gmail.com`), matching the convention the
/// original hardcodes per-provider in `mailer.py`'s config table.
fn smtp_relay_host(user_email: &str) -> String {
    match user_email.split('@').nth(1) {
        Some("gmail.com") => "smtp.gmail.com".to_string(),
        Some("outlook.com") | Some("hotmail.com") => "smtp.office365.com".to_string(),
        Some(domain) => format!("smtp.{domain}"),
        None => "localhost".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_host_known_providers() {
        assert_eq!(smtp_relay_host("me@gmail.com"), "smtp.gmail.com");
        assert_eq!(smtp_relay_host("me@outlook.com"), "smtp.office365.com");
    }

    #[test]
    fn relay_host_falls_back_to_subdomain() {
        assert_eq!(smtp_relay_host("me@example.com"), "smtp.example.com");
    }

    #[test]
    fn mailer_absent_without_full_config() {
        let config = AppConfig {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: "sqlite://:memory:".into(),
            secure_cookies: true,
            global_booking_interval_ms: 500,
            priority_users_emails: Default::default(),
            booking_whitelist_emails: Default::default(),
            vapid_public_key: None,
            vapid_private_key: None,
            vapid_claim_email: None,
            email_sender: Some("a@example.com".into()),
            email_user: None,
            email_password: None,
            external_host: None,
        };
        assert!(Mailer::from_config(&config).is_none());
    }
}
