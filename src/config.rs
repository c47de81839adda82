use std::collections::HashSet;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind address (e.g. "0.0.0.0:8080")
    pub listen_addr: String,

    /// SQLite database URL
    pub database_url: String,

    /// Set Secure flag on session cookies (env: SECURE_COOKIES, default: true).
    pub secure_cookies: bool,

    /// Minimum interval between any two seat-claim submissions process-wide
    /// (env: GLOBAL_BOOKING_INTERVAL_MS, default 500).
    pub global_booking_interval_ms: u64,

    /// Emails exempt from the extra 1s pre-book delay (env: PRIORITY_USERS_EMAILS,
    /// space-separated).
    pub priority_users_emails: HashSet<String>,

    /// When non-empty, only these emails' workers are allowed to run
    /// (env: BOOKING_WHITELIST_EMAILS, space-separated).
    pub booking_whitelist_emails: HashSet<String>,

    /// VAPID keypair and claim email for Web Push (env: VAPID_PUBLIC_KEY,
    /// VAPID_PRIVATE_KEY, VAPID_CLAIM_EMAIL).
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub vapid_claim_email: Option<String>,

    /// SMTP mail transport (env: EMAIL_SENDER, EMAIL_USER, EMAIL_PASSWORD,
    /// WODBOOKER_HOST — the external hostname used in templated links).
    pub email_sender: Option<String>,
    pub email_user: Option<String>,
    pub email_password: Option<String>,
    pub external_host: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./booking-agent.db".into()),
            secure_cookies: std::env::var("SECURE_COOKIES")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            global_booking_interval_ms: std::env::var("GLOBAL_BOOKING_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            priority_users_emails: parse_email_set("PRIORITY_USERS_EMAILS"),
            booking_whitelist_emails: parse_email_set("BOOKING_WHITELIST_EMAILS"),
            vapid_public_key: std::env::var("VAPID_PUBLIC_KEY").ok(),
            vapid_private_key: std::env::var("VAPID_PRIVATE_KEY").ok(),
            vapid_claim_email: std::env::var("VAPID_CLAIM_EMAIL").ok(),
            email_sender: std::env::var("EMAIL_SENDER").ok(),
            email_user: std::env::var("EMAIL_USER").ok(),
            email_password: std::env::var("EMAIL_PASSWORD").ok(),
            external_host: std::env::var("WODBOOKER_HOST").ok(),
        })
    }

    /// True if the whitelist is configured and `email` is not on it.
    pub fn is_whitelist_rejected(&self, email: &str) -> bool {
        !self.booking_whitelist_emails.is_empty()
            && !self.booking_whitelist_emails.contains(email)
    }

    pub fn is_priority_user(&self, email: &str) -> bool {
        self.priority_users_emails.contains(email)
    }

    pub fn has_vapid_keys(&self) -> bool {
        self.vapid_public_key.is_some() && self.vapid_private_key.is_some()
    }

    pub fn has_mail_transport(&self) -> bool {
        self.email_sender.is_some() && self.email_user.is_some() && self.email_password.is_some()
    }
}

fn parse_email_set(var: &str) -> HashSet<String> {
    std::env::var(var)
        .unwrap_or_default()
        .split_whitespace()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: "sqlite://:memory:".into(),
            secure_cookies: true,
            global_booking_interval_ms: 500,
            priority_users_emails: HashSet::new(),
            booking_whitelist_emails: HashSet::new(),
            vapid_public_key: None,
            vapid_private_key: None,
            vapid_claim_email: None,
            email_sender: None,
            email_user: None,
            email_password: None,
            external_host: None,
        }
    }

    #[test]
    fn whitelist_empty_never_rejects() {
        let cfg = base_config();
        assert!(!cfg.is_whitelist_rejected("anyone@example.com"));
    }

    #[test]
    fn whitelist_rejects_unlisted_email() {
        let cfg = AppConfig {
            booking_whitelist_emails: ["alice@example.com".to_string()].into(),
            ..base_config()
        };
        assert!(cfg.is_whitelist_rejected("bob@example.com"));
        assert!(!cfg.is_whitelist_rejected("alice@example.com"));
    }

    #[test]
    fn priority_user_lookup() {
        let cfg = AppConfig {
            priority_users_emails: ["vip@example.com".to_string()].into(),
            ..base_config()
        };
        assert!(cfg.is_priority_user("vip@example.com"));
        assert!(!cfg.is_priority_user("other@example.com"));
    }

    #[test]
    fn has_vapid_keys_requires_both() {
        let cfg = AppConfig {
            vapid_public_key: Some("pub".into()),
            ..base_config()
        };
        assert!(!cfg.has_vapid_keys());

        let cfg = AppConfig {
            vapid_public_key: Some("pub".into()),
            vapid_private_key: Some("priv".into()),
            ..base_config()
        };
        assert!(cfg.has_vapid_keys());
    }

    #[test]
    fn has_mail_transport_requires_all_three() {
        let cfg = AppConfig {
            email_sender: Some("a@example.com".into()),
            email_user: Some("user".into()),
            ..base_config()
        };
        assert!(!cfg.has_mail_transport());

        let cfg = AppConfig {
            email_sender: Some("a@example.com".into()),
            email_user: Some("user".into()),
            email_password: Some("pw".into()),
            ..base_config()
        };
        assert!(cfg.has_mail_transport());
    }
}
