//! Append-only, deduplicated-against-previous event log (SPEC_FULL.md §4.4)
//! and the user-visible message catalog (SPEC_FULL.md §6), grounded on
//! `original_source/wodbooker/booker.py`'s `_add_event` and
//! `original_source/wodbooker/constants.py`'s `EventMessage` enum. Messages
//! are kept in their original Spanish — they are user-facing data, not
//! source comments, and are what the portal's own audience expects to read.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::Event;

const DAYS_OF_WEEK: [&str; 7] = [
    "Lunes",
    "Martes",
    "Miércoles",
    "Jueves",
    "Viernes",
    "Sábado",
    "Domingo",
];

pub fn day_label(dow: u32) -> &'static str {
    DAYS_OF_WEEK[(dow % 7) as usize]
}

/// Insert a new Event row for `reservation_id`, unless the most recent row
/// for that reservation already carries an identical message (SPEC_FULL.md
/// §4.4 / the invariant in §3: "at most one Event row may be identical to
/// its immediately previous row"). Commits before returning so UI readers
/// observe progress immediately.
pub async fn append(pool: &SqlitePool, reservation_id: &str, message: &str) -> anyhow::Result<()> {
    let previous: Option<(String,)> = sqlx::query_as(
        "SELECT message FROM events WHERE reservation_id = ? ORDER BY timestamp DESC, rowid DESC LIMIT 1",
    )
    .bind(reservation_id)
    .fetch_optional(pool)
    .await?;

    if previous.as_ref().map(|(m,)| m.as_str()) == Some(message) {
        return Ok(());
    }

    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO events (id, reservation_id, timestamp, message) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(reservation_id)
        .bind(Utc::now().naive_utc())
        .bind(message)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn list_for_reservation(
    pool: &SqlitePool,
    reservation_id: &str,
) -> anyhow::Result<Vec<Event>> {
    let rows = sqlx::query_as::<_, Event>(
        "SELECT id, reservation_id, timestamp, message FROM events WHERE reservation_id = ? ORDER BY timestamp ASC",
    )
    .bind(reservation_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Message catalog (SPEC_FULL.md §6). Each function renders the exact
/// parameterized templates of the original `EventMessage` enum.
pub mod messages {
    use super::day_label;

    pub fn class_waiting_over(elapsed: &str, next: &str) -> String {
        format!(
            "La clase del {elapsed} ya ha pasado y no se pudo reservar. Comenzando reserva para el {next}"
        )
    }

    pub fn wait_until_booking_open(open_at: &str, target: &str) -> String {
        format!("Esperando hasta el {open_at} cuando las reservas para el {target} estén disponibles")
    }

    pub fn booking_completed(target: &str) -> String {
        format!("Reserva para el {target} completada correctamente")
    }

    pub fn class_full(target: &str) -> String {
        format!("La clase del {target} está llena. Esperando a que haya plazas disponibles")
    }

    pub fn booking_penalization(reason: &str) -> String {
        format!("Penalización al reservar: {reason}. Esperando a que cambie el estado de la reserva")
    }

    pub fn wait_class_loaded(date: &str) -> String {
        format!("Esperando a que las clases del día {date} estén cargadas")
    }

    pub fn unexpected_network_error(seconds: u64) -> String {
        format!("Error inesperado de red. Esperando {seconds} segundos antes de volver a intentarlo...")
    }

    pub fn unexpected_wodbuster_response(seconds: u64) -> String {
        format!(
            "Respuesta inesperada de WodBuster. Esperando {seconds} segundos antes de volver a intentarlo..."
        )
    }

    pub fn credentials_expired() -> &'static str {
        "Tus credenciales están caducadas. Vuelve a logarte y actualiza esta entrada para reactivar las reservas"
    }

    pub fn login_failed() -> &'static str {
        "Login fallido: credenciales inválidas. Vuelve a logarte y vuelve a intentarlo"
    }

    pub fn invalid_box_url() -> &'static str {
        "La URL del box introducida no es válida o no tienes acceso al mismo. Actualiza la URL y vuelve a intentarlo"
    }

    pub fn too_many_errors() -> &'static str {
        "Se han producido demasiados errores al intentar reservar. Reserva parada"
    }

    const IGNORE_WEEK_MESSAGE: &str =
        "Se ignora esta semana y se intentará reservar para el mismo día de la siguiente semana";

    pub fn class_not_found(date: &str, time: &str) -> String {
        format!("El {date} no hay clase a las {time}. {IGNORE_WEEK_MESSAGE}")
    }

    pub fn booking_error(target: &str, reason: &str) -> String {
        format!("Error al reservar la clase del {target}: {reason}. {IGNORE_WEEK_MESSAGE}")
    }

    pub fn paused() -> &'static str {
        "Pausado"
    }

    /// Renders "<DayName> a las HH:MM" for use in message templates, matching
    /// the original's `DAYS_OF_WEEK[dow]` + `time.strftime('%H:%M')` pairing.
    pub fn target_label(dow: u32, time: chrono::NaiveTime) -> String {
        format!("{} a las {}", day_label(dow), time.format("%H:%M"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn append_dedups_identical_consecutive_message() {
        let db = Database::test_db().await;
        sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO reservations (id, user_id, dow, local_time, url, window_open_local_time) \
             VALUES ('r1', 'u1', 0, '10:00:00', 'https://example.com', '07:00:00')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        append(&db.pool, "r1", "hello").await.unwrap();
        append(&db.pool, "r1", "hello").await.unwrap();
        append(&db.pool, "r1", "hello").await.unwrap();

        let events = list_for_reservation(&db.pool, "r1").await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn append_keeps_distinct_consecutive_messages() {
        let db = Database::test_db().await;
        sqlx::query("INSERT INTO users (id, email) VALUES ('u1', 'u1@example.com')")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO reservations (id, user_id, dow, local_time, url, window_open_local_time) \
             VALUES ('r1', 'u1', 0, '10:00:00', 'https://example.com', '07:00:00')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        append(&db.pool, "r1", "first").await.unwrap();
        append(&db.pool, "r1", "second").await.unwrap();
        append(&db.pool, "r1", "first").await.unwrap();

        let events = list_for_reservation(&db.pool, "r1").await.unwrap();
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn day_label_monday_is_lunes() {
        assert_eq!(day_label(0), "Lunes");
        assert_eq!(day_label(6), "Domingo");
    }
}
