//! Database setup command: `fabtrack init-db`.

use anyhow::Result;
use std::path::PathBuf;

use fabtrack::config::FabtrackConfig;
use fabtrack::shopfloor::server;

pub fn cmd_init_db(config: &FabtrackConfig, db_path: Option<PathBuf>, demo: bool) -> Result<()> {
    let db_path = super::resolve_db_path(config, db_path);
    let demo = demo || config.demo_data();
    let db = server::prepare_database(&db_path, &super::admin_account(config), demo)?;

    println!("Tracker database initialized at {}", db_path.display());
    if demo {
        println!(
            "Demo data loaded: {} users, {} jobs",
            db.list_users()?.len(),
            db.list_jobs()?.len()
        );
    }
    Ok(())
}
