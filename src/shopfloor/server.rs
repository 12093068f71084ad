use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::db::{DbHandle, TrackerDb};
use super::seed::{self, AdminAccount};
use crate::config::TrackerSection;

/// Configuration for the tracker server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub demo_data: bool,
    pub admin: AdminAccount,
    pub tracker: TrackerSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            db_path: PathBuf::from(".fabtrack/fabtrack.db"),
            dev_mode: false,
            demo_data: false,
            admin: AdminAccount::with_password("Fabtrack1"),
            tracker: TrackerSection::default(),
        }
    }
}

/// Build the application router. Dev mode allows any origin.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let app = api::api_router().with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Opens (or creates) the database and brings it up to the default data.
pub fn prepare_database(path: &Path, admin: &AdminAccount, demo_data: bool) -> Result<TrackerDb> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = TrackerDb::new(path).context("Failed to initialize tracker database")?;
    seed::seed_defaults_for(&db, admin).context("Failed to seed default data")?;
    if demo_data {
        seed::seed_demo(&db).context("Failed to seed demo data")?;
    }
    let purged = db.purge_expired_sessions(chrono::Utc::now())?;
    if purged > 0 {
        info!(purged, "removed expired sessions");
    }
    Ok(db)
}

/// Start the tracker server and serve until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = prepare_database(&config.db_path, &config.admin, config.demo_data)?;
    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        tracker: config.tracker,
    });
    let app = build_router(state, config.dev_mode);

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, db = %config.db_path.display(), "fabtrack listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
