//! Reminder scanner (SPEC_FULL.md §4.6), grounded on
//! `original_source/wodbooker/notification_scheduler.py`. A single
//! long-running task wakes every 60 seconds, fires the 60/30/15-minute
//! pre-class push reminders exactly once per booking, then sweeps its own
//! 7-day-old `NotificationSent` rows — on its own cadence, not the daily
//! Event sweeper's (SPEC_FULL.md §4.9).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDateTime, NaiveTime};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::models::PushSubscription;

use super::push;

const SCAN_INTERVAL: StdDuration = StdDuration::from_secs(60);
const REMINDER_OFFSETS: [i64; 3] = [60, 30, 15];
const MATCH_TOLERANCE: Duration = Duration::minutes(1);
const SENT_RETENTION_DAYS: i64 = 7;

#[derive(sqlx::FromRow)]
struct Candidate {
    portal_booking_id: String,
    user_id: String,
    class_date: chrono::NaiveDate,
    class_time: String,
    class_name: Option<String>,
    box_url: String,
}

/// Spawns the reminder scanner as a detached task. Intended to be called
/// once at startup alongside the retention sweeper.
pub fn spawn(pool: SqlitePool, config: Arc<AppConfig>, clock: Arc<dyn Clock>) {
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        loop {
            interval.tick().await;
            scan_once(&pool, &config, &http, clock.as_ref()).await;
        }
    });
}

async fn scan_once(pool: &SqlitePool, config: &AppConfig, http: &reqwest::Client, clock: &dyn Clock) {
    let now = clock.now_madrid();

    for minutes in REMINDER_OFFSETS {
        if let Err(e) = scan_offset(pool, config, http, now, minutes).await {
            warn!(minutes, error = %e, "reminder scan failed for offset");
        }
    }

    match sqlx::query(
        "DELETE FROM notifications_sent WHERE sent_at < datetime('now', ? || ' days')",
    )
    .bind(-SENT_RETENTION_DAYS)
    .execute(pool)
    .await
    {
        Ok(result) if result.rows_affected() > 0 => {
            info!(deleted = result.rows_affected(), "swept old notifications_sent rows");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to sweep notifications_sent"),
    }
}

async fn scan_offset(
    pool: &SqlitePool,
    config: &AppConfig,
    http: &reqwest::Client,
    now: NaiveDateTime,
    minutes: i64,
) -> anyhow::Result<()> {
    let column = match minutes {
        60 => "push_remind_60",
        30 => "push_remind_30",
        15 => "push_remind_15",
        _ => unreachable!("REMINDER_OFFSETS only contains 60/30/15"),
    };

    let query = format!(
        "SELECT pb.id as portal_booking_id, pb.user_id, pb.class_date, pb.class_time, \
         pb.class_name, pb.box_url \
         FROM portal_bookings pb JOIN users u ON u.id = pb.user_id \
         WHERE pb.is_cancelled = 0 AND u.push_enabled = 1 AND u.{column} = 1 \
         AND NOT EXISTS (SELECT 1 FROM notifications_sent ns \
             WHERE ns.portal_booking_id = pb.id AND ns.reminder_minutes = ?)"
    );

    let candidates: Vec<Candidate> = sqlx::query_as(&query).bind(minutes).fetch_all(pool).await?;

    for candidate in candidates {
        let Some(class_time) = NaiveTime::parse_from_str(&candidate.class_time, "%H:%M:%S").ok()
        else {
            continue;
        };
        let class_datetime = candidate.class_date.and_time(class_time);
        let fires_at = class_datetime - Duration::minutes(minutes);

        if (fires_at - now).abs() > MATCH_TOLERANCE {
            continue;
        }

        let title = "Recordatorio de clase";
        let label = candidate.class_name.as_deref().unwrap_or("tu clase");
        let body = format!(
            "{label} empieza en {minutes} minutos ({box})",
            box = candidate.box_url
        );

        let subscriptions: Vec<PushSubscription> = sqlx::query_as(
            "SELECT id, user_id, endpoint, p256dh, auth, created_at FROM push_subscriptions WHERE user_id = ?",
        )
        .bind(&candidate.user_id)
        .fetch_all(pool)
        .await?;

        let mut any_sent = false;
        for sub in subscriptions {
            let data = serde_json::json!({ "portalBookingId": candidate.portal_booking_id });
            match push::send(http, config, &sub, title, &body, data).await {
                Ok(()) => any_sent = true,
                Err(push::PushError::Gone) => {
                    let _ = sqlx::query("DELETE FROM push_subscriptions WHERE id = ?")
                        .bind(&sub.id)
                        .execute(pool)
                        .await;
                }
                Err(push::PushError::NotConfigured) => {}
                Err(e) => warn!(endpoint = %sub.endpoint, error = %e, "reminder push failed"),
            }
        }

        if any_sent {
            let id = Uuid::new_v4().to_string();
            let _ = sqlx::query(
                "INSERT OR IGNORE INTO notifications_sent (id, portal_booking_id, reminder_minutes) VALUES (?, ?, ?)",
            )
            .bind(&id)
            .bind(&candidate.portal_booking_id)
            .bind(minutes)
            .execute(pool)
            .await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::Database;
    use chrono::{NaiveDate, Utc};

    fn test_config() -> AppConfig {
        AppConfig {
            listen_addr: "0.0.0.0:8080".into(),
            database_url: "sqlite://:memory:".into(),
            secure_cookies: true,
            global_booking_interval_ms: 500,
            priority_users_emails: Default::default(),
            booking_whitelist_emails: Default::default(),
            vapid_public_key: None,
            vapid_private_key: None,
            vapid_claim_email: None,
            email_sender: None,
            email_user: None,
            email_password: None,
            external_host: None,
        }
    }

    async fn seed_user(pool: &SqlitePool, id: &str) {
        sqlx::query(
            "INSERT INTO users (id, email, push_enabled, push_remind_60) VALUES (?, ?, 1, 1)",
        )
        .bind(id)
        .bind(format!("{id}@example.com"))
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn scan_skips_booking_with_no_subscriptions() {
        let db = Database::test_db().await;
        seed_user(&db.pool, "u1").await;
        let class_date = NaiveDate::from_ymd_opt(2025, 7, 10).unwrap();
        sqlx::query(
            "INSERT INTO portal_bookings (id, user_id, portal_class_id, class_date, class_time, box_url) \
             VALUES ('pb1', 'u1', 'c1', ?, '10:00:00', 'https://box.example.com')",
        )
        .bind(class_date)
        .execute(&db.pool)
        .await
        .unwrap();

        let clock = FixedClock(Utc::now());
        // A scan with no push subscriptions registered must not panic and
        // must not record a NotificationSent row (nothing was actually sent).
        scan_once(&db.pool, &test_config(), &reqwest::Client::new(), &clock).await;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notifications_sent")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
