//! SQLite storage for the shop floor.
//!
//! `TrackerDb` owns one connection. Entity access is split by area:
//! `catalog` (users, lookup tables, locations, carriers, settings),
//! `process` (states, machines, steps, chains) and `jobs` (assemblies, jobs
//! and their procedures).

mod catalog;
mod jobs;
mod process;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, Params, Row};
use uuid::Uuid;

pub use catalog::{NewUser, NewWorkstation, UserUpdate};
pub use jobs::{NewAssembly, NewJob};
pub use process::{NewProcessChain, NewProcessStep, NewStateMachine};

/// Async-safe handle to the tracker database.
///
/// Wraps `TrackerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TrackerDb>>,
}

impl DbHandle {
    pub fn new(db: TrackerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TrackerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup and tests only.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TrackerDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct TrackerDb {
    conn: Connection,
}

impl TrackerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS users (
                    id BLOB PRIMARY KEY,
                    username TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    first_name TEXT NOT NULL,
                    last_name TEXT NOT NULL,
                    email TEXT NOT NULL UNIQUE,
                    roles TEXT NOT NULL DEFAULT '[]',
                    locale TEXT NOT NULL DEFAULT 'de',
                    dark_mode INTEGER NOT NULL DEFAULT 0,
                    pinned_menu INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    token TEXT PRIMARY KEY,
                    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS reset_tokens (
                    token_hash TEXT PRIMARY KEY,
                    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS priorities (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    value INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS carrier_types (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS locations (
                    id BLOB PRIMARY KEY,
                    kind TEXT NOT NULL,
                    position TEXT NOT NULL,
                    name TEXT,
                    broken INTEGER NOT NULL DEFAULT 0,
                    active INTEGER NOT NULL DEFAULT 1,
                    transporter_id BLOB REFERENCES users(id) ON DELETE CASCADE
                );

                CREATE TABLE IF NOT EXISTS workstation_users (
                    workstation_id BLOB NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
                    user_id BLOB NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    PRIMARY KEY (workstation_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS carriers (
                    id BLOB PRIMARY KEY,
                    carrier_id TEXT NOT NULL UNIQUE,
                    carrier_type_id BLOB NOT NULL REFERENCES carrier_types(id),
                    location_id BLOB NOT NULL REFERENCES locations(id)
                );

                CREATE TABLE IF NOT EXISTS assemblies (
                    id BLOB PRIMARY KEY,
                    assembly_id TEXT NOT NULL UNIQUE,
                    alloy TEXT NOT NULL,
                    sample_count INTEGER NOT NULL DEFAULT 0,
                    position_at_carrier TEXT,
                    comment TEXT
                );

                CREATE TABLE IF NOT EXISTS assembly_carriers (
                    assembly_id BLOB NOT NULL REFERENCES assemblies(id) ON DELETE CASCADE,
                    carrier_id BLOB NOT NULL REFERENCES carriers(id),
                    position INTEGER NOT NULL,
                    PRIMARY KEY (assembly_id, carrier_id)
                );

                CREATE TABLE IF NOT EXISTS parameters (
                    id BLOB PRIMARY KEY,
                    field TEXT NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS states (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    blocking INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS state_machines (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS state_machine_states (
                    machine_id BLOB NOT NULL REFERENCES state_machines(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    state_id BLOB NOT NULL REFERENCES states(id),
                    PRIMARY KEY (machine_id, position)
                );

                CREATE TABLE IF NOT EXISTS process_steps (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    est_duration INTEGER NOT NULL DEFAULT 0,
                    state_machine_id BLOB NOT NULL REFERENCES state_machines(id),
                    workstation_id BLOB NOT NULL REFERENCES locations(id),
                    preparation_id BLOB REFERENCES carrier_types(id),
                    output_id BLOB REFERENCES carrier_types(id),
                    creates INTEGER NOT NULL DEFAULT 0,
                    modifies INTEGER NOT NULL DEFAULT 0,
                    deletes INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS process_step_parameters (
                    step_id BLOB NOT NULL REFERENCES process_steps(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    parameter_id BLOB NOT NULL REFERENCES parameters(id),
                    PRIMARY KEY (step_id, position)
                );

                CREATE TABLE IF NOT EXISTS process_chains (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS process_chain_steps (
                    chain_id BLOB NOT NULL REFERENCES process_chains(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    step_id BLOB NOT NULL REFERENCES process_steps(id),
                    PRIMARY KEY (chain_id, position)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id BLOB PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    state TEXT NOT NULL DEFAULT 'pending',
                    priority_id BLOB NOT NULL REFERENCES priorities(id),
                    process_chain_id BLOB NOT NULL REFERENCES process_chains(id),
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS job_assemblies (
                    job_id BLOB NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    assembly_id BLOB NOT NULL REFERENCES assemblies(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    PRIMARY KEY (job_id, assembly_id)
                );

                CREATE TABLE IF NOT EXISTS procedures (
                    id BLOB PRIMARY KEY,
                    job_id BLOB NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    process_step_id BLOB NOT NULL REFERENCES process_steps(id)
                );

                CREATE TABLE IF NOT EXISTS assembly_modifications (
                    assembly_id BLOB NOT NULL REFERENCES assemblies(id) ON DELETE CASCADE,
                    procedure_id BLOB NOT NULL REFERENCES procedures(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    PRIMARY KEY (assembly_id, position)
                );

                CREATE TABLE IF NOT EXISTS state_execs (
                    id BLOB PRIMARY KEY,
                    procedure_id BLOB NOT NULL REFERENCES procedures(id) ON DELETE CASCADE,
                    seq INTEGER NOT NULL,
                    state_id BLOB NOT NULL REFERENCES states(id),
                    trigger_id BLOB REFERENCES users(id) ON DELETE SET NULL,
                    transition_at TEXT NOT NULL,
                    started_at TEXT,
                    finished_at TEXT,
                    transition_time INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (procedure_id, seq)
                );

                CREATE TABLE IF NOT EXISTS procedure_values (
                    id BLOB PRIMARY KEY,
                    procedure_id BLOB NOT NULL REFERENCES procedures(id) ON DELETE CASCADE,
                    position INTEGER NOT NULL,
                    parameter_id BLOB NOT NULL REFERENCES parameters(id),
                    value TEXT,
                    unit TEXT
                );

                CREATE TABLE IF NOT EXISTS validation_patterns (
                    name TEXT PRIMARY KEY,
                    pattern TEXT NOT NULL DEFAULT '',
                    lower INTEGER NOT NULL DEFAULT 0,
                    upper INTEGER NOT NULL DEFAULT 0,
                    digits INTEGER NOT NULL DEFAULT 0,
                    special INTEGER NOT NULL DEFAULT 0,
                    dot INTEGER NOT NULL DEFAULT 0,
                    underscore INTEGER NOT NULL DEFAULT 0,
                    dash INTEGER NOT NULL DEFAULT 0,
                    space INTEGER NOT NULL DEFAULT 0,
                    slash INTEGER NOT NULL DEFAULT 0,
                    backslash INTEGER NOT NULL DEFAULT 0,
                    min_length INTEGER NOT NULL DEFAULT 0,
                    max_length INTEGER NOT NULL DEFAULT 0,
                    advanced INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS global_config (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_workstation_name
                    ON locations(name) WHERE kind = 'workstation';
                CREATE INDEX IF NOT EXISTS idx_procedures_job ON procedures(job_id, position);
                CREATE INDEX IF NOT EXISTS idx_state_execs_procedure ON state_execs(procedure_id, seq);
                CREATE INDEX IF NOT EXISTS idx_values_procedure ON procedure_values(procedure_id, position);
                CREATE INDEX IF NOT EXISTS idx_carriers_location ON carriers(location_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Run `f` inside a transaction. Nested calls join the outer transaction.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            return f(self);
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let value = f(self)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(value)
    }

    // ── Query helpers ─────────────────────────────────────────────────

    fn query_rows<T, P, F>(&self, sql: &str, params: P, what: &str, map: F) -> Result<Vec<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self
            .conn
            .prepare(sql)
            .with_context(|| format!("Failed to prepare {}", what))?;
        let rows = stmt
            .query_map(params, map)
            .with_context(|| format!("Failed to query {}", what))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.with_context(|| format!("Failed to read {} row", what))?);
        }
        Ok(out)
    }

    fn query_one<T, P, F>(&self, sql: &str, params: P, what: &str, map: F) -> Result<Option<T>>
    where
        P: Params,
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.query_rows(sql, params, what, map)?.into_iter().next())
    }

    fn ids(&self, sql: &str, id: Uuid, what: &str) -> Result<Vec<Uuid>> {
        self.query_rows(sql, [id], what, |row| row.get(0))
    }

    /// True when `table.column = value` exists on a row other than `except`.
    fn taken(&self, table: &str, column: &str, value: &str, except: Option<Uuid>) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1 AND (?2 IS NULL OR id != ?2)",
            table, column
        );
        let count: i64 = self
            .conn
            .query_row(&sql, rusqlite::params![value, except], |row| row.get(0))
            .with_context(|| format!("Failed to check {}.{} uniqueness", table, column))?;
        Ok(count > 0)
    }

    fn count(&self, sql: &str, id: Uuid, what: &str) -> Result<i64> {
        self.conn
            .query_row(sql, [id], |row| row.get(0))
            .with_context(|| format!("Failed to count {}", what))
    }

    fn delete_by_id(&self, table: &str, id: Uuid) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", table);
        let affected = self
            .conn
            .execute(&sql, [id])
            .with_context(|| format!("Failed to delete from {}", table))?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let tables = db.query_rows(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
            [],
            "tables",
            |row| row.get::<_, String>(0),
        )?;
        for expected in ["jobs", "procedures", "state_execs", "validation_patterns", "users"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
        // Migrations are idempotent.
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_open_file_database() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("fabtrack.db");
        {
            let db = TrackerDb::new(&path)?;
            db.set_config("oldActiveJob", "10")?;
        }
        let db = TrackerDb::new(&path)?;
        assert_eq!(db.get_config("oldActiveJob")?.as_deref(), Some("10"));
        Ok(())
    }

    #[test]
    fn test_transaction_rolls_back_on_error() -> Result<()> {
        let db = TrackerDb::new_in_memory()?;
        let result: Result<()> = db.transaction(|db| {
            db.set_config("a", "1")?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        assert_eq!(db.get_config("a")?, None);

        db.transaction(|db| db.transaction(|db| db.set_config("b", "2")))?;
        assert_eq!(db.get_config("b")?.as_deref(), Some("2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::new(TrackerDb::new_in_memory()?);
        handle.call(|db| db.set_config("k", "v")).await?;
        let value = handle.call(|db| db.get_config("k")).await?;
        assert_eq!(value.as_deref(), Some("v"));
        assert!(handle.lock_sync().is_ok());
        Ok(())
    }
}
