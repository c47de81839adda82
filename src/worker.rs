//! The booking worker state machine (SPEC_FULL.md §4.5), grounded on
//! `original_source/wodbooker/booker.py`'s `Booker.run` and its `_Waiter`
//! hierarchy. One [`run`] call owns a reservation for its entire active
//! lifetime; the supervisor spawns and cancels these as a `tokio::task`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use rand::Rng;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::clock::{target_datetime, window_open_datetime, Clock};
use crate::db::models::Reservation;
use crate::error::BookingError;
use crate::events::{self, messages};
use crate::notify::Notifier;
use crate::portal::{PortalClient, BOOKING_HUB_EVENTS, CHANGED_BOOKING_EVENT};
use crate::rate_limit::RateLimiter;

/// Error budget before the worker gives up entirely (SPEC_FULL.md §4.5's
/// "too many errors" terminal state).
const MAX_ERRORS: u32 = 500;
/// ClassNotFound retries before the worker gives up on this week and rolls
/// the target forward by 7 days.
const MAX_CLASS_NOT_FOUND_ATTEMPTS: u32 = 20;
const CLASS_NOT_FOUND_RETRY_DELAY: Duration = Duration::from_secs(1);
const BOOKING_LOCKED_RETRY_DELAY: Duration = Duration::from_millis(200);
const BOOKING_PENALTY_DELAY: Duration = Duration::from_secs(10);

/// What to do after a failed claim attempt, decided by the failure table in
/// SPEC_FULL.md §4.5 / §7.
enum Waiter {
    /// Sleep until a fixed instant, then re-evaluate the target date.
    Until(NaiveDateTime),
    /// Block on a live portal event before re-evaluating.
    ForEvent {
        url: String,
        date: NaiveDate,
        events: &'static [&'static str],
        deadline: Option<NaiveDateTime>,
    },
    /// Nothing to wait for; loop immediately.
    None,
}

pub struct WorkerContext {
    pub pool: SqlitePool,
    pub portal: Arc<PortalClient>,
    pub rate_limiter: RateLimiter,
    pub notifier: Arc<Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Runs the booking loop for one reservation until it is deactivated, a
/// fatal error occurs, or the error budget (`MAX_ERRORS`) is exhausted.
/// Cancel-safe: the caller drives cancellation by dropping the `JoinHandle`
/// this runs under, per `tokio::select!`'s usual cooperative cancellation.
pub async fn run(ctx: WorkerContext, mut reservation: Reservation, user_email: String) {
    let mut errors: u32 = 0;
    let mut class_full_notified = false;
    // The target the worker was waiting for as of the previous iteration, and
    // whether that wait was an actual Waiter (Until/ForEvent) rather than a
    // fall-through (SPEC_FULL.md §4.5 step 1).
    let mut waiting_target: Option<NaiveDateTime> = None;
    let mut waiter_was_active = false;

    'outer: while errors < MAX_ERRORS {
        if !is_active(&ctx.pool, &reservation.id).await {
            info!(reservation_id = %reservation.id, "reservation deactivated, stopping worker");
            return;
        }

        let now = ctx.clock.now_madrid();
        let natural_target = target_datetime(
            now,
            reservation.last_booked_date,
            reservation.dow,
            reservation.local_time,
        );

        let mut target = natural_target;
        if let Some(prev) = waiting_target {
            if prev != natural_target {
                if waiter_was_active {
                    let msg = messages::class_waiting_over(
                        &prev.format("%d/%m/%Y").to_string(),
                        &natural_target.format("%d/%m/%Y").to_string(),
                    );
                    let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
                }
            } else if reservation.skip_current_week {
                target = natural_target + chrono::Duration::days(7);
            }
        }
        if Some(target) != waiting_target {
            reservation.skip_current_week = false;
        }
        waiting_target = Some(target);
        waiter_was_active = false;

        let window_open = window_open_datetime(
            target,
            reservation.window_open_offset_days,
            reservation.window_open_local_time,
        );

        if window_open > ctx.clock.now_madrid() {
            let label = messages::target_label(reservation.dow, reservation.local_time);
            let msg = messages::wait_until_booking_open(
                &window_open.format("%d/%m/%Y a las %H:%M:%S").to_string(),
                &label,
            );
            let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
            sleep_until(window_open, &ctx.clock).await;
        }

        ctx.rate_limiter.wait_for_turn(&user_email).await;
        let jitter = Duration::from_millis(rand::rng().random_range(1..=1000));
        tokio::time::sleep(jitter).await;

        let attempt = attempt_claim(&ctx, &reservation, target).await;

        match attempt {
            Ok(true) => {
                let label = target.format("%d/%m/%Y").to_string();
                let msg = messages::booking_completed(&label);
                let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
                let after_error = errors > 0 || class_full_notified;
                ctx.notifier
                    .booking_succeeded(&user_email, &msg, after_error)
                    .await;

                reservation.last_booked_date = Some(target.date());
                reservation.booked_at = Some(ctx.clock.now_utc().naive_utc());
                reservation.skip_current_week = false;
                reservation.booking_attempts = 0;
                class_full_notified = false;
                errors = 0;
                persist_progress(&ctx.pool, &reservation).await;
                persist_cookie(&ctx.pool, &reservation.user_id, &ctx.portal.cookie_blob()).await;
            }
            Ok(false) => unreachable!("attempt_claim never returns Ok(false)"),
            Err(err) => {
                let waiter = handle_error(
                    &ctx,
                    &mut reservation,
                    &mut errors,
                    &mut class_full_notified,
                    target,
                    &err,
                    &user_email,
                )
                .await;

                if err.is_fatal() {
                    persist_progress(&ctx.pool, &reservation).await;
                    break 'outer;
                }

                match waiter {
                    Waiter::Until(when) => {
                        waiter_was_active = true;
                        sleep_until(when, &ctx.clock).await;
                    }
                    Waiter::ForEvent {
                        url,
                        date,
                        events: expected,
                        deadline,
                    } => {
                        waiter_was_active = true;
                        let _ = ctx
                            .portal
                            .wait_until_event(&url, date, expected, deadline)
                            .await;
                    }
                    Waiter::None => {}
                }
            }
        }

        persist_progress(&ctx.pool, &reservation).await;
    }

    if errors >= MAX_ERRORS {
        warn!(reservation_id = %reservation.id, "error budget exhausted, stopping worker");
        let _ = events::append(&ctx.pool, &reservation.id, messages::too_many_errors()).await;
    }
}

async fn attempt_claim(
    ctx: &WorkerContext,
    reservation: &Reservation,
    target: NaiveDateTime,
) -> Result<bool, BookingError> {
    loop {
        match ctx.portal.book(&reservation.url, target).await {
            Ok(ok) => return Ok(ok),
            Err(BookingError::BookingLocked) => {
                tokio::time::sleep(BOOKING_LOCKED_RETRY_DELAY).await;
                continue;
            }
            Err(other) => return Err(other),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_error(
    ctx: &WorkerContext,
    reservation: &mut Reservation,
    errors: &mut u32,
    class_full_notified: &mut bool,
    target: NaiveDateTime,
    err: &BookingError,
    user_email: &str,
) -> Waiter {
    let day_label = target.date().format("%d/%m/%Y").to_string();

    match err {
        BookingError::ClassNotFound => {
            reservation.booking_attempts += 1;
            if reservation.booking_attempts >= MAX_CLASS_NOT_FOUND_ATTEMPTS as i64 {
                reservation.skip_current_week = true;
                reservation.booking_attempts = 0;
                let msg = messages::class_not_found(&day_label, &target.format("%H:%M:%S").to_string());
                let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
                Waiter::None
            } else {
                tokio::time::sleep(CLASS_NOT_FOUND_RETRY_DELAY).await;
                Waiter::None
            }
        }
        BookingError::BookingPenalty(reason) => {
            tokio::time::sleep(BOOKING_PENALTY_DELAY).await;
            let msg = messages::booking_penalization(reason);
            let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
            Waiter::ForEvent {
                url: reservation.url.clone(),
                date: target.date(),
                events: CHANGED_BOOKING_EVENT,
                deadline: Some(target),
            }
        }
        BookingError::BookingFailed(reason) => {
            reservation.skip_current_week = true;
            let msg = messages::booking_error(&day_label, reason.trim_end_matches('.'));
            let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
            ctx.notifier.booking_failed(user_email, &msg).await;
            Waiter::None
        }
        BookingError::ClassFull => {
            let msg = messages::class_full(&day_label);
            let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
            if !*class_full_notified {
                ctx.notifier.class_full(user_email, &msg).await;
                *class_full_notified = true;
            }
            Waiter::ForEvent {
                url: reservation.url.clone(),
                date: target.date(),
                events: CHANGED_BOOKING_EVENT,
                deadline: Some(target),
            }
        }
        BookingError::BookingWindowNotOpen(available_at) => match available_at {
            Some(at) => {
                let label = messages::target_label(reservation.dow, reservation.local_time);
                let msg = messages::wait_until_booking_open(
                    &at.format("%d/%m/%Y a las %H:%M:%S").to_string(),
                    &label,
                );
                let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
                Waiter::Until(*at)
            }
            None => {
                let msg = messages::wait_class_loaded(&day_label);
                let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
                Waiter::ForEvent {
                    url: reservation.url.clone(),
                    date: target.date(),
                    events: BOOKING_HUB_EVENTS,
                    deadline: Some(target),
                }
            }
        },
        BookingError::Transient(_) => {
            *errors += 1;
            let sleep_for = (*errors as u64) * 60;
            let msg = messages::unexpected_network_error(sleep_for);
            let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
            Waiter::Until(ctx.clock.now_madrid() + chrono::Duration::seconds(sleep_for as i64))
        }
        BookingError::UnparseableResponse(_) => {
            *errors += 1;
            let sleep_for = (*errors as u64) * 60;
            let msg = messages::unexpected_wodbuster_response(sleep_for);
            let _ = events::append(&ctx.pool, &reservation.id, &msg).await;
            Waiter::Until(ctx.clock.now_madrid() + chrono::Duration::seconds(sleep_for as i64))
        }
        BookingError::PasswordRequired => {
            let _ = events::append(&ctx.pool, &reservation.id, messages::credentials_expired()).await;
            mark_force_login(&ctx.pool, &reservation.user_id).await;
            Waiter::None
        }
        BookingError::InvalidCredentials => {
            let _ = events::append(&ctx.pool, &reservation.id, messages::login_failed()).await;
            mark_force_login(&ctx.pool, &reservation.user_id).await;
            Waiter::None
        }
        BookingError::InvalidBox => {
            let _ = events::append(&ctx.pool, &reservation.id, messages::invalid_box_url()).await;
            Waiter::None
        }
        BookingError::BookingLocked => Waiter::None,
    }
}

/// Rotates the persisted cookie blob after a successful portal interaction
/// (SPEC_FULL.md §4.5 step 5 / §3's "cookie rotated on each successful
/// portal interaction").
async fn persist_cookie(pool: &SqlitePool, user_id: &str, cookie_blob: &str) {
    let _ = sqlx::query("UPDATE users SET cookie = ? WHERE id = ?")
        .bind(cookie_blob)
        .bind(user_id)
        .execute(pool)
        .await;
}

async fn mark_force_login(pool: &SqlitePool, user_id: &str) {
    let _ = sqlx::query("UPDATE users SET force_login = 1 WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await;
}

async fn is_active(pool: &SqlitePool, reservation_id: &str) -> bool {
    sqlx::query_scalar::<_, bool>("SELECT is_active FROM reservations WHERE id = ?")
        .bind(reservation_id)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
        .unwrap_or(false)
}

async fn persist_progress(pool: &SqlitePool, reservation: &Reservation) {
    let _ = sqlx::query(
        "UPDATE reservations SET last_booked_date = ?, booked_at = ?, skip_current_week = ?, \
         booking_attempts = ?, updated_at = datetime('now') WHERE id = ?",
    )
    .bind(reservation.last_booked_date)
    .bind(reservation.booked_at)
    .bind(reservation.skip_current_week)
    .bind(reservation.booking_attempts)
    .bind(&reservation.id)
    .execute(pool)
    .await;
}

async fn sleep_until(target: NaiveDateTime, clock: &Arc<dyn Clock>) {
    let now = clock.now_madrid();
    if target > now {
        let seconds = (target - now).num_milliseconds().max(0) as u64;
        tokio::time::sleep(Duration::from_millis(seconds)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn max_class_not_found_attempts_matches_original_constant() {
        assert_eq!(MAX_CLASS_NOT_FOUND_ATTEMPTS, 20);
    }

    #[test]
    fn max_errors_matches_original_constant() {
        assert_eq!(MAX_ERRORS, 500);
    }

    #[test]
    fn day_of_week_labels_render_for_all_seven_days() {
        let time = NaiveTime::from_hms_opt(10, 0, 0).unwrap();
        for dow in 0..7 {
            let label = messages::target_label(dow, time);
            assert!(label.contains("a las 10:00"));
        }
    }
}
