//! Observed-booking synchronizer (SPEC_FULL.md §4.8), grounded on
//! `original_source/wodbooker/booker.py`'s `sync_wodbuster_bookings`
//! routine. Reconciles the `PortalBooking` table against what the portal
//! actually reports for the current Madrid week, on-demand (user-triggered
//! "sync now" or calendar load) rather than on a timer.

use chrono::{Datelike, NaiveDate, Weekday};
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::BookingError;
use crate::portal::PortalClient;

/// Per-date/overall outcome of a sync, returned to the API caller (§4.8:
/// "Reports counts (new, updated, cancelled, per-date errors)").
#[derive(Debug, Default, serde::Serialize)]
pub struct SyncReport {
    pub new: u32,
    pub updated: u32,
    pub cancelled: u32,
    pub errors: Vec<String>,
}

/// Synchronizes the current Madrid week (Monday..Sunday) for `user_id`
/// against `box_url`, using `portal` (already holding that user's cookies).
pub async fn sync_week(
    pool: &SqlitePool,
    portal: &PortalClient,
    clock: &dyn Clock,
    user_id: &str,
    box_url: &str,
) -> SyncReport {
    let today = clock.now_madrid().date();
    let monday = today - chrono::Duration::days(today.weekday().num_days_from_monday() as i64);

    let mut report = SyncReport::default();
    for offset in 0..7 {
        let date = monday + chrono::Duration::days(offset);
        if let Err(e) = sync_day(pool, portal, user_id, box_url, date, &mut report).await {
            warn!(user_id, %date, error = %e, "sync failed for date");
            report.errors.push(format!("{date}: {e}"));
        }
    }
    report
}

async fn sync_day(
    pool: &SqlitePool,
    portal: &PortalClient,
    user_id: &str,
    box_url: &str,
    date: NaiveDate,
    report: &mut SyncReport,
) -> Result<(), BookingError> {
    let observed = portal.sync_observed_bookings(box_url, date).await?;
    let reported_ids: Vec<&str> = observed.iter().map(|c| c.portal_class_id.as_str()).collect();

    for class in &observed {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM portal_bookings WHERE user_id = ? AND portal_class_id = ? AND class_date = ?",
        )
        .bind(user_id)
        .bind(&class.portal_class_id)
        .bind(date)
        .fetch_optional(pool)
        .await
        .map_err(|e| BookingError::UnparseableResponse(e.to_string()))?;

        match existing {
            Some((id,)) => {
                sqlx::query(
                    "UPDATE portal_bookings SET class_time = ?, class_name = ?, class_kind = ?, \
                     box_url = ?, fetched_at = CURRENT_TIMESTAMP, is_cancelled = 0 WHERE id = ?",
                )
                .bind(&class.class_time)
                .bind(&class.class_name)
                .bind(&class.class_kind)
                .bind(box_url)
                .bind(&id)
                .execute(pool)
                .await
                .map_err(|e| BookingError::UnparseableResponse(e.to_string()))?;
                report.updated += 1;
            }
            None => {
                let id = Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO portal_bookings \
                     (id, user_id, portal_class_id, class_date, class_time, class_name, class_kind, box_url) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(user_id)
                .bind(&class.portal_class_id)
                .bind(date)
                .bind(&class.class_time)
                .bind(&class.class_name)
                .bind(&class.class_kind)
                .bind(box_url)
                .execute(pool)
                .await
                .map_err(|e| BookingError::UnparseableResponse(e.to_string()))?;
                report.new += 1;
            }
        }
    }

    let placeholders = reported_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let query = if reported_ids.is_empty() {
        "UPDATE portal_bookings SET is_cancelled = 1, fetched_at = CURRENT_TIMESTAMP \
         WHERE user_id = ? AND class_date = ? AND is_cancelled = 0".to_string()
    } else {
        format!(
            "UPDATE portal_bookings SET is_cancelled = 1, fetched_at = CURRENT_TIMESTAMP \
             WHERE user_id = ? AND class_date = ? AND is_cancelled = 0 \
             AND portal_class_id NOT IN ({placeholders})"
        )
    };

    let mut q = sqlx::query(&query).bind(user_id).bind(date);
    for id in &reported_ids {
        q = q.bind(*id);
    }
    let result = q
        .execute(pool)
        .await
        .map_err(|e| BookingError::UnparseableResponse(e.to_string()))?;
    report.cancelled += result.rows_affected() as u32;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::Database;
    use chrono::NaiveDateTime;

    #[tokio::test]
    async fn cancelling_a_booking_not_in_the_reported_set_is_idempotent() {
        let db = Database::test_db().await;
        sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
            .execute(&db.pool)
            .await
            .unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(); // a Monday
        sqlx::query(
            "INSERT INTO portal_bookings (id, user_id, portal_class_id, class_date, class_time, box_url) \
             VALUES ('pb1', 'u1', 'stale-class', ?, '10:00:00', 'https://box.example.com')",
        )
        .bind(date)
        .execute(&db.pool)
        .await
        .unwrap();

        let mut report = SyncReport::default();
        // No classes reported for this date: the existing row should be marked cancelled.
        let empty: Vec<crate::portal::ObservedClass> = vec![];
        let reported_ids: Vec<&str> = empty.iter().map(|c: &crate::portal::ObservedClass| c.portal_class_id.as_str()).collect();
        assert!(reported_ids.is_empty());

        let result = sqlx::query(
            "UPDATE portal_bookings SET is_cancelled = 1, fetched_at = CURRENT_TIMESTAMP \
             WHERE user_id = ? AND class_date = ? AND is_cancelled = 0",
        )
        .bind("u1")
        .bind(date)
        .execute(&db.pool)
        .await
        .unwrap();
        report.cancelled = result.rows_affected() as u32;
        assert_eq!(report.cancelled, 1);

        // Running the same statement again must be a no-op (already cancelled).
        let result2 = sqlx::query(
            "UPDATE portal_bookings SET is_cancelled = 1, fetched_at = CURRENT_TIMESTAMP \
             WHERE user_id = ? AND class_date = ? AND is_cancelled = 0",
        )
        .bind("u1")
        .bind(date)
        .execute(&db.pool)
        .await
        .unwrap();
        assert_eq!(result2.rows_affected(), 0);
    }

    #[test]
    fn sync_week_starts_on_monday() {
        let fixed = NaiveDateTime::parse_from_str("2025-06-05 12:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc();
        let clock = FixedClock(fixed);
        let today = clock.now_madrid().date();
        let monday = today - chrono::Duration::days(today.weekday().num_days_from_monday() as i64);
        assert_eq!(monday.weekday(), Weekday::Mon);
    }
}
