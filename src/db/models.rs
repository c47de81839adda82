use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassKind {
    Regular,
    Event,
}

impl ClassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassKind::Regular => "regular",
            ClassKind::Event => "event",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "event" => ClassKind::Event,
            _ => ClassKind::Regular,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    /// Opaque cookie blob. The core never parses it except to look for the
    /// `.WBAuth` cookie name when deciding to force a relogin.
    pub cookie: Option<String>,
    pub force_login: bool,
    pub athlete_id: Option<String>,
    pub mail_success: bool,
    pub mail_failure: bool,
    pub push_success: bool,
    pub push_failure: bool,
    pub push_remind_60: bool,
    pub push_remind_30: bool,
    pub push_remind_15: bool,
    pub push_enabled: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReservationRow {
    pub id: String,
    pub user_id: String,
    pub dow: i64,
    pub local_time: String,
    pub url: String,
    pub window_open_offset_days: i64,
    pub window_open_local_time: String,
    pub class_kind: String,
    pub last_booked_date: Option<NaiveDate>,
    pub booked_at: Option<NaiveDateTime>,
    pub is_active: bool,
    pub booking_attempts: i64,
    pub skip_current_week: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Typed view over [`ReservationRow`] with `local_time`/`window_open_local_time`
/// parsed into `NaiveTime`. The worker operates on this; the row type only
/// exists at the sqlx boundary.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub dow: u32,
    pub local_time: NaiveTime,
    pub url: String,
    pub window_open_offset_days: i64,
    pub window_open_local_time: NaiveTime,
    pub class_kind: ClassKind,
    pub last_booked_date: Option<NaiveDate>,
    pub booked_at: Option<NaiveDateTime>,
    pub is_active: bool,
    pub booking_attempts: i64,
    pub skip_current_week: bool,
}

impl From<ReservationRow> for Reservation {
    fn from(r: ReservationRow) -> Self {
        Reservation {
            id: r.id,
            user_id: r.user_id,
            dow: r.dow as u32,
            local_time: NaiveTime::parse_from_str(&r.local_time, "%H:%M:%S")
                .unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap()),
            url: r.url,
            window_open_offset_days: r.window_open_offset_days,
            window_open_local_time: NaiveTime::parse_from_str(
                &r.window_open_local_time,
                "%H:%M:%S",
            )
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap()),
            class_kind: ClassKind::from_str(&r.class_kind),
            last_booked_date: r.last_booked_date,
            booked_at: r.booked_at,
            is_active: r.is_active,
            booking_attempts: r.booking_attempts,
            skip_current_week: r.skip_current_week,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: String,
    pub reservation_id: String,
    pub timestamp: NaiveDateTime,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PortalBooking {
    pub id: String,
    pub user_id: String,
    pub portal_class_id: String,
    pub class_date: NaiveDate,
    pub class_time: String,
    pub class_name: Option<String>,
    pub class_kind: Option<String>,
    pub description: Option<String>,
    pub box_url: String,
    pub fetched_at: NaiveDateTime,
    pub is_cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PushSubscription {
    pub id: String,
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationSent {
    pub id: String,
    pub portal_booking_id: String,
    pub reminder_minutes: i64,
    pub sent_at: NaiveDateTime,
}
