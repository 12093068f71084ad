//! HTTP server command: `fabtrack serve`.

use anyhow::Result;
use std::path::PathBuf;

use fabtrack::config::FabtrackConfig;
use fabtrack::shopfloor::server::{self, ServerConfig};

pub async fn cmd_serve(
    config: &FabtrackConfig,
    port: Option<u16>,
    db_path: Option<PathBuf>,
    dev: bool,
) -> Result<()> {
    server::start_server(ServerConfig {
        port: port.unwrap_or_else(|| config.port()),
        db_path: super::resolve_db_path(config, db_path),
        dev_mode: dev || config.toml.server.dev_mode,
        demo_data: config.demo_data(),
        admin: super::admin_account(config),
        tracker: config.toml.tracker.clone(),
    })
    .await
}
