//! Process-wide claim-submission throttle (SPEC_FULL.md §4.3), grounded on
//! `original_source/wodbooker/booker.py`'s `_GLOBAL_BOOKING_LOCK` /
//! `GLOBAL_BOOKING_INTERVAL` and the priority-user 1-second pre-book delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::AppConfig;

const PRIORITY_SKIP_DELAY: Duration = Duration::from_secs(1);

/// Serializes every claim submission across all workers to at least
/// `GLOBAL_BOOKING_INTERVAL` apart, and adds an extra pre-book delay for
/// non-priority users so priority accounts reach the portal first.
#[derive(Clone)]
pub struct RateLimiter {
    last_claim: Arc<Mutex<Option<Instant>>>,
    config: Arc<AppConfig>,
}

impl RateLimiter {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            last_claim: Arc::new(Mutex::new(None)),
            config,
        }
    }

    /// Blocks until it is this caller's turn to submit a claim. Priority
    /// users (SPEC_FULL.md §4.3) skip the extra pre-book delay but still
    /// respect the shared minimum interval.
    pub async fn wait_for_turn(&self, email: &str) {
        if !self.config.is_priority_user(email) {
            tokio::time::sleep(PRIORITY_SKIP_DELAY).await;
        }

        let interval = Duration::from_millis(self.config.global_booking_interval_ms);
        let mut last_claim = self.last_claim.lock().await;
        let now = Instant::now();
        if let Some(previous) = *last_claim {
            let elapsed = now.duration_since(previous);
            if elapsed < interval {
                tokio::time::sleep(interval - elapsed).await;
            }
        }
        *last_claim = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_priority(emails: &[&str]) -> Arc<AppConfig> {
        Arc::new(AppConfig {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: "sqlite://:memory:".into(),
            secure_cookies: true,
            global_booking_interval_ms: 500,
            priority_users_emails: emails.iter().map(|s| s.to_string()).collect(),
            booking_whitelist_emails: Default::default(),
            vapid_public_key: None,
            vapid_private_key: None,
            vapid_claim_email: None,
            email_sender: None,
            email_user: None,
            email_password: None,
            external_host: None,
        })
    }

    #[tokio::test]
    async fn serializes_concurrent_claims_by_interval() {
        let limiter = RateLimiter::new(config_with_priority(&["a@example.com", "b@example.com"]));
        let start = Instant::now();
        limiter.wait_for_turn("a@example.com").await;
        limiter.wait_for_turn("b@example.com").await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn non_priority_user_incurs_extra_delay() {
        let limiter = RateLimiter::new(config_with_priority(&[]));
        let start = Instant::now();
        limiter.wait_for_turn("nobody@example.com").await;
        assert!(start.elapsed() >= PRIORITY_SKIP_DELAY);
    }
}
