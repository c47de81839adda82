mod api;
mod auth;
mod clock;
mod config;
mod db;
mod error;
mod events;
mod notify;
mod portal;
mod rate_limit;
mod retention;
mod supervisor;
mod sync;
mod worker;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db::Database;
use crate::supervisor::Supervisor;

/// Shared application state available to every HTTP handler.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Database,
    pub supervisor: Supervisor,
    pub clock: Arc<dyn Clock>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (not required)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "booking_agent=info,tower_http=info".into()),
        )
        .init();

    info!("Starting booking-agent v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(AppConfig::from_env()?);
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    if !config.booking_whitelist_emails.is_empty() {
        warn!(
            count = config.booking_whitelist_emails.len(),
            "BOOKING_WHITELIST_EMAILS set — workers for other users will not start"
        );
    }
    if !config.has_vapid_keys() {
        warn!("VAPID keys not configured — push notifications disabled");
    }
    if !config.has_mail_transport() {
        warn!("EMAIL_SENDER/EMAIL_USER/EMAIL_PASSWORD not fully configured — email disabled");
    }

    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    info!("Database initialized");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let supervisor = Supervisor::new(db.pool.clone(), config.clone(), clock.clone());

    // §4.7: start one worker for every currently-active Reservation.
    supervisor.start_all_active().await;

    // §4.9: daily Event retention sweep.
    retention::spawn(db.pool.clone());

    // §4.6: 60s reminder scanner (60/30/15-minute pre-class push reminders).
    notify::reminder::spawn(db.pool.clone(), config.clone(), clock.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        supervisor,
        clock,
    });

    let app = build_router(state);

    let addr = config.listen_addr.parse::<std::net::SocketAddr>()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/auth", api::auth_routes(state.clone()))
        .nest("/api", api::routes(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
