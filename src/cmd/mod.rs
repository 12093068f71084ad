//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `init_db` | `InitDb`         |
//! | `config`  | `Config`         |

pub mod config;
pub mod init_db;
pub mod serve;

pub use config::cmd_config;
pub use init_db::cmd_init_db;
pub use serve::cmd_serve;

use fabtrack::config::FabtrackConfig;
use fabtrack::shopfloor::seed::AdminAccount;

/// The bootstrap admin as configured.
fn admin_account(config: &FabtrackConfig) -> AdminAccount {
    AdminAccount {
        username: config.toml.bootstrap.admin_username.clone(),
        email: config.toml.bootstrap.admin_email.clone(),
        password: config.admin_password(),
    }
}

/// CLI path, or the configured one. Relative CLI paths are taken as given.
fn resolve_db_path(config: &FabtrackConfig, cli: Option<std::path::PathBuf>) -> std::path::PathBuf {
    cli.unwrap_or_else(|| config.db_path())
}
