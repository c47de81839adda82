//! HTTP client for the booking portal (SPEC_FULL.md §4.2), grounded on
//! `original_source/wodbooker/scraper.py`. Each [`PortalClient`] owns one
//! user's cookie state; the supervisor keeps one instance alive per user for
//! the lifetime of their active reservations.

mod client;
mod sse;

pub use client::{BoxSchedule, ObservedClass, PortalClient};
pub use sse::{BOOKING_HUB_EVENTS, CHANGED_BOOKING_EVENT};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BookingError;

    #[test]
    fn new_client_starts_with_no_cookies() {
        let portal = PortalClient::new("user@example.com".into(), None, None);
        assert_eq!(portal.cookie_blob(), "{}");
    }

    #[test]
    fn login_without_cookie_or_password_requires_password() {
        let portal = PortalClient::new("user@example.com".into(), None, None);
        assert!(matches!(
            portal.password_error_if_missing(),
            Some(BookingError::PasswordRequired)
        ));
    }
}
