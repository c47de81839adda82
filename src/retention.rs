//! Event log retention sweeper (SPEC_FULL.md §4.9), grounded on the
//! teacher's hourly session-cleanup `tokio::spawn` + `interval` pattern in
//! `proxy/src/main.rs` (no original-source counterpart exists; this sweep
//! is not present in the upstream Python project). For every Reservation,
//! drops Events older than 15 days while always keeping the single most
//! recent row, so a paused reservation's event log never goes fully empty.

use std::time::Duration as StdDuration;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};

const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(24 * 60 * 60);
const RETENTION_DAYS: i64 = 15;

/// Spawns the sweeper as a detached task, ticking once every 24 hours.
pub fn spawn(pool: SqlitePool) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweep_once(&pool).await;
        }
    });
}

/// Runs one sweep across every reservation, committing after each one so a
/// failure on one reservation's events doesn't block the rest.
pub async fn sweep_once(pool: &SqlitePool) {
    let cutoff = Utc::now().naive_utc() - chrono::Duration::days(RETENTION_DAYS);

    let reservation_ids: Vec<(String,)> = match sqlx::query_as("SELECT id FROM reservations")
        .fetch_all(pool)
        .await
    {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "retention sweep: failed to list reservations");
            return;
        }
    };

    let mut total_deleted = 0u64;
    for (reservation_id,) in reservation_ids {
        match sweep_reservation(pool, &reservation_id, cutoff).await {
            Ok(deleted) => total_deleted += deleted,
            Err(e) => warn!(reservation_id, error = %e, "retention sweep failed for reservation"),
        }
    }

    if total_deleted > 0 {
        info!(deleted = total_deleted, "retention sweep complete");
    }
}

async fn sweep_reservation(
    pool: &SqlitePool,
    reservation_id: &str,
    cutoff: chrono::NaiveDateTime,
) -> Result<u64, sqlx::Error> {
    // Keep the single most recent row for this reservation regardless of
    // age; delete every other row older than the cutoff.
    let most_recent: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM events WHERE reservation_id = ? ORDER BY timestamp DESC, rowid DESC LIMIT 1",
    )
    .bind(reservation_id)
    .fetch_optional(pool)
    .await?;

    let result = match most_recent {
        Some((keep_id,)) => {
            sqlx::query(
                "DELETE FROM events WHERE reservation_id = ? AND timestamp < ? AND id != ?",
            )
            .bind(reservation_id)
            .bind(cutoff)
            .bind(&keep_id)
            .execute(pool)
            .await?
        }
        None => return Ok(0),
    };

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Duration;

    async fn seed_reservation(pool: &SqlitePool, id: &str) {
        sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
            .execute(pool)
            .await
            .ok();
        sqlx::query(
            "INSERT INTO reservations (id, user_id, dow, local_time, url, window_open_local_time) \
             VALUES (?, 'u1', 0, '10:00:00', 'https://example.com', '07:00:00')",
        )
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_event(pool: &SqlitePool, reservation_id: &str, age_days: i64, message: &str) {
        let timestamp = Utc::now().naive_utc() - Duration::days(age_days);
        sqlx::query("INSERT INTO events (id, reservation_id, timestamp, message) VALUES (?, ?, ?, ?)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(reservation_id)
            .bind(timestamp)
            .bind(message)
            .execute(pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn old_events_are_dropped_but_the_newest_is_always_kept() {
        let db = Database::test_db().await;
        seed_reservation(&db.pool, "r1").await;
        insert_event(&db.pool, "r1", 30, "old event").await;
        insert_event(&db.pool, "r1", 20, "another old event").await;
        insert_event(&db.pool, "r1", 1, "recent event").await;

        sweep_once(&db.pool).await;

        let remaining: Vec<(String,)> = sqlx::query_as("SELECT message FROM events WHERE reservation_id = 'r1'")
            .fetch_all(&db.pool)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, "recent event");
    }

    #[tokio::test]
    async fn single_old_event_is_kept_when_it_is_the_only_one() {
        let db = Database::test_db().await;
        seed_reservation(&db.pool, "r1").await;
        insert_event(&db.pool, "r1", 100, "only event").await;

        sweep_once(&db.pool).await;

        let remaining: Vec<(String,)> = sqlx::query_as("SELECT message FROM events WHERE reservation_id = 'r1'")
            .fetch_all(&db.pool)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
