//! Worker lifecycle (SPEC_FULL.md §4.7), grounded on
//! `original_source/wodbooker/booker.py`'s module-level
//! `start_booking_loop`/`stop_booking_loop`/`is_booking_running` registry,
//! generalized from "one active reservation" to "one live `tokio::task` per
//! active Reservation row", threading the registry through an explicit
//! value rather than ambient statics (SPEC_FULL.md §9's "global mutable
//! state" design note).

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use chrono::{NaiveDate, NaiveDateTime};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::models::{Reservation, ReservationRow};
use crate::events;
use crate::notify::Notifier;
use crate::portal::PortalClient;
use crate::rate_limit::RateLimiter;
use crate::worker::{self, WorkerContext};

const RESERVATION_COLUMNS: &str = "id, user_id, dow, local_time, url, window_open_offset_days, \
     window_open_local_time, class_kind, last_booked_date, booked_at, is_active, \
     booking_attempts, skip_current_week, created_at, updated_at";

/// Joined projection of a Reservation row with its owning user's login
/// material. `sqlx::query_as` can't nest an already-`FromRow` struct inside
/// a tuple, so the join gets its own flat row type instead.
#[derive(sqlx::FromRow)]
struct ReservationWithUser {
    id: String,
    user_id: String,
    dow: i64,
    local_time: String,
    url: String,
    window_open_offset_days: i64,
    window_open_local_time: String,
    class_kind: String,
    last_booked_date: Option<NaiveDate>,
    booked_at: Option<NaiveDateTime>,
    is_active: bool,
    booking_attempts: i64,
    skip_current_week: bool,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    email: String,
    cookie: Option<String>,
}

impl From<ReservationWithUser> for ReservationRow {
    fn from(r: ReservationWithUser) -> Self {
        ReservationRow {
            id: r.id,
            user_id: r.user_id,
            dow: r.dow,
            local_time: r.local_time,
            url: r.url,
            window_open_offset_days: r.window_open_offset_days,
            window_open_local_time: r.window_open_local_time,
            class_kind: r.class_kind,
            last_booked_date: r.last_booked_date,
            booked_at: r.booked_at,
            is_active: r.is_active,
            booking_attempts: r.booking_attempts,
            skip_current_week: r.skip_current_week,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Owns the registry of running workers. One [`Supervisor`] per process;
/// cloning it shares the same registry (cheap `Arc` clone), matching how
/// `AppState` hands the same scheduler/gate instance to every handler.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    pool: SqlitePool,
    config: Arc<AppConfig>,
    rate_limiter: RateLimiter,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(pool: SqlitePool, config: Arc<AppConfig>, clock: Arc<dyn Clock>) -> Self {
        let rate_limiter = RateLimiter::new(config.clone());
        let notifier = Arc::new(Notifier::new(pool.clone(), config.clone()));
        Self {
            inner: Arc::new(Inner {
                pool,
                config,
                rate_limiter,
                notifier,
                clock,
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts one worker for every currently-active Reservation (§4.7's
    /// process-start hook).
    pub async fn start_all_active(&self) {
        let rows: Vec<ReservationRow> = match sqlx::query_as(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM reservations WHERE is_active = 1"
        ))
        .fetch_all(&self.inner.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to load active reservations at startup");
                return;
            }
        };

        info!(count = rows.len(), "starting workers for active reservations");
        for row in rows {
            self.start(&row.id).await;
        }
    }

    /// Starts a worker for `reservation_id` unless one is already running,
    /// the reservation is inactive, or the user is rejected by a configured
    /// whitelist (§4.3's "configuration" error category — a no-op that
    /// records one Event and returns).
    pub async fn start(&self, reservation_id: &str) {
        if self.inner.handles.lock().await.contains_key(reservation_id) {
            return;
        }

        let Some((reservation, email, cookie)) = self.load(reservation_id).await else {
            warn!(reservation_id, "cannot start worker: reservation not found");
            return;
        };

        if !reservation.is_active {
            return;
        }

        if self.inner.config.is_whitelist_rejected(&email) {
            let _ = events::append(
                &self.inner.pool,
                reservation_id,
                "Reserva no iniciada: el usuario no está en la lista blanca de reservas",
            )
            .await;
            return;
        }

        let portal = Arc::new(PortalClient::new(email.clone(), None, cookie));
        let ctx = WorkerContext {
            pool: self.inner.pool.clone(),
            portal,
            rate_limiter: self.inner.rate_limiter.clone(),
            notifier: self.inner.notifier.clone(),
            clock: self.inner.clock.clone(),
        };

        let reservation_id_owned = reservation_id.to_string();
        let handle = tokio::spawn(async move {
            worker::run(ctx, reservation, email).await;
        });

        self.inner
            .handles
            .lock()
            .await
            .insert(reservation_id_owned, handle);
    }

    /// Stops a running worker, if any. Safe to call when none is running.
    /// Cancellation is a hard `JoinHandle::abort` rather than a cooperative
    /// signal: every worker step is persisted before the next suspension
    /// point (§5), so an aborted task leaves no partial, unrecoverable
    /// state, and a stop immediately followed by a start is safe (§5).
    pub async fn stop(&self, reservation_id: &str) {
        if let Some(handle) = self.inner.handles.lock().await.remove(reservation_id) {
            handle.abort();
        }
    }

    /// Restarts a worker after its Reservation row changed (§4.7's update
    /// hook): stop the old task, then start fresh from the updated row.
    pub async fn restart(&self, reservation_id: &str) {
        self.stop(reservation_id).await;
        self.start(reservation_id).await;
    }

    /// Stops a worker and records the PAUSED event (§4.7's deactivate hook).
    pub async fn deactivate(&self, reservation_id: &str) {
        self.stop(reservation_id).await;
        let _ = events::append(
            &self.inner.pool,
            reservation_id,
            crate::events::messages::paused(),
        )
        .await;
    }

    /// Stops a worker ahead of the Reservation row (and its cascaded Events)
    /// being deleted from the store (§4.7's delete hook).
    pub async fn before_delete(&self, reservation_id: &str) {
        self.stop(reservation_id).await;
    }

    pub async fn is_running(&self, reservation_id: &str) -> bool {
        self.inner.handles.lock().await.contains_key(reservation_id)
    }

    async fn load(&self, reservation_id: &str) -> Option<(Reservation, String, Option<String>)> {
        let row: ReservationWithUser = sqlx::query_as(
            "SELECT r.id, r.user_id, r.dow, r.local_time, r.url, r.window_open_offset_days, \
             r.window_open_local_time, r.class_kind, r.last_booked_date, r.booked_at, \
             r.is_active, r.booking_attempts, r.skip_current_week, r.created_at, r.updated_at, \
             u.email, u.cookie \
             FROM reservations r JOIN users u ON u.id = r.user_id WHERE r.id = ?",
        )
        .bind(reservation_id)
        .fetch_optional(&self.inner.pool)
        .await
        .ok()??;

        let email = row.email.clone();
        let cookie = row.cookie.clone();
        Some((Reservation::from(ReservationRow::from(row)), email, cookie))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::Database;

    fn test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
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
        })
    }

    async fn seed(pool: &SqlitePool) -> String {
        sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
            .execute(pool)
            .await
            .unwrap();
        let id = "r1".to_string();
        sqlx::query(
            "INSERT INTO reservations (id, user_id, dow, local_time, url, window_open_local_time, is_active) \
             VALUES (?, 'u1', 0, '10:00:00', 'https://example.com', '07:00:00', 1)",
        )
        .bind(&id)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    #[tokio::test]
    async fn starting_an_inactive_reservation_is_a_noop() {
        let db = Database::test_db().await;
        sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO reservations (id, user_id, dow, local_time, url, window_open_local_time, is_active) \
             VALUES ('r1', 'u1', 0, '10:00:00', 'https://example.com', '07:00:00', 0)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let supervisor = Supervisor::new(db.pool.clone(), test_config(), Arc::new(SystemClock));
        supervisor.start("r1").await;
        assert!(!supervisor.is_running("r1").await);
    }

    #[tokio::test]
    async fn whitelist_rejection_records_event_and_never_runs() {
        let db = Database::test_db().await;
        let id = seed(&db.pool).await;

        let mut config = (*test_config()).clone();
        config.booking_whitelist_emails = ["someone-else@example.com".to_string()].into();

        let supervisor = Supervisor::new(db.pool.clone(), Arc::new(config), Arc::new(SystemClock));
        supervisor.start(&id).await;

        assert!(!supervisor.is_running(&id).await);
        let events = events::list_for_reservation(&db.pool, &id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn stop_on_unknown_reservation_is_harmless() {
        let db = Database::test_db().await;
        let supervisor = Supervisor::new(db.pool.clone(), test_config(), Arc::new(SystemClock));
        supervisor.stop("does-not-exist").await;
    }

    #[tokio::test]
    async fn double_start_does_not_spawn_a_second_worker() {
        let db = Database::test_db().await;
        let id = seed(&db.pool).await;
        let supervisor = Supervisor::new(db.pool.clone(), test_config(), Arc::new(SystemClock));

        supervisor.start(&id).await;
        assert!(supervisor.is_running(&id).await);
        supervisor.start(&id).await; // second call should be a no-op, not replace the handle

        supervisor.stop(&id).await;
        assert!(!supervisor.is_running(&id).await);
    }
}
