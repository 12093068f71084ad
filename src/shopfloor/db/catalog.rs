use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fabtrack_common::*;
use rusqlite::params;
use serde::Deserialize;
use uuid::Uuid;

use super::TrackerDb;
use crate::errors::TrackerError;

/// Fields of a user row. The password is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub locale: String,
}

#[derive(Debug, Clone)]
pub struct UserUpdate {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub roles: Vec<Role>,
    pub locale: String,
    pub dark_mode: bool,
    pub pinned_menu: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewWorkstation {
    pub name: String,
    pub position: String,
    #[serde(default)]
    pub broken: bool,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub users: Vec<Uuid>,
}

fn default_true() -> bool {
    true
}

const USER_COLUMNS: &str =
    "id, username, first_name, last_name, email, roles, locale, dark_mode, pinned_menu";

/// Intermediate row struct for users; roles are stored as a JSON array.
struct UserRow {
    id: Uuid,
    username: String,
    first_name: String,
    last_name: String,
    email: String,
    roles: String,
    locale: String,
    dark_mode: bool,
    pinned_menu: bool,
}

impl UserRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            email: row.get(4)?,
            roles: row.get(5)?,
            locale: row.get(6)?,
            dark_mode: row.get(7)?,
            pinned_menu: row.get(8)?,
        })
    }

    fn into_user(self) -> Result<User> {
        let names: Vec<String> =
            serde_json::from_str(&self.roles).context("Failed to parse user roles JSON")?;
        let roles = names
            .iter()
            .map(|r| Role::from_str(r).map_err(|e| anyhow::anyhow!(e)))
            .collect::<Result<Vec<_>>>()
            .context("Failed to parse user role")?;
        Ok(User {
            id: self.id,
            username: self.username,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            roles,
            locale: self.locale,
            dark_mode: self.dark_mode,
            pinned_menu: self.pinned_menu,
        })
    }
}

fn roles_json(roles: &[Role]) -> Result<String> {
    let names: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
    serde_json::to_string(&names).context("Failed to serialize user roles")
}

fn pattern_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValidationPattern> {
    Ok(ValidationPattern {
        name: row.get(0)?,
        pattern: row.get(1)?,
        lower: row.get(2)?,
        upper: row.get(3)?,
        digits: row.get(4)?,
        special: row.get(5)?,
        dot: row.get(6)?,
        underscore: row.get(7)?,
        dash: row.get(8)?,
        space: row.get(9)?,
        slash: row.get(10)?,
        backslash: row.get(11)?,
        min_length: row.get(12)?,
        max_length: row.get(13)?,
        advanced: row.get(14)?,
    })
}

const PATTERN_COLUMNS: &str = "name, pattern, lower, upper, digits, special, dot, underscore, \
     dash, space, slash, backslash, min_length, max_length, advanced";

impl TrackerDb {
    // ── Users ─────────────────────────────────────────────────────────

    pub fn create_user(&self, user: &NewUser) -> Result<User> {
        if self.taken("users", "username", &user.username, None)? {
            return Err(TrackerError::already_exists("User", &user.username).into());
        }
        if self.taken("users", "email", &user.email, None)? {
            return Err(TrackerError::already_exists("E-mail", &user.email).into());
        }
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO users (id, username, password_hash, first_name, last_name, email, roles, locale)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    user.username,
                    user.password_hash,
                    user.first_name,
                    user.last_name,
                    user.email,
                    roles_json(&user.roles)?,
                    user.locale,
                ],
            )
            .context("Failed to insert user")?;
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let sql = format!("SELECT {} FROM users ORDER BY username", USER_COLUMNS);
        self.query_rows(&sql, [], "users", UserRow::from_row)?
            .into_iter()
            .map(UserRow::into_user)
            .collect()
    }

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS);
        self.query_one(&sql, [id], "user", UserRow::from_row)?
            .map(UserRow::into_user)
            .transpose()
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS);
        self.query_one(&sql, [email], "user by email", UserRow::from_row)?
            .map(UserRow::into_user)
            .transpose()
    }

    /// User and stored password hash for a login name.
    pub fn get_credentials(&self, username: &str) -> Result<Option<(User, String)>> {
        let sql = format!(
            "SELECT {}, password_hash FROM users WHERE username = ?1",
            USER_COLUMNS
        );
        let found = self.query_one(&sql, [username], "credentials", |row| {
            Ok((UserRow::from_row(row)?, row.get::<_, String>(9)?))
        })?;
        match found {
            Some((row, hash)) => Ok(Some((row.into_user()?, hash))),
            None => Ok(None),
        }
    }

    pub fn list_users_with_role(&self, role: Role) -> Result<Vec<User>> {
        Ok(self
            .list_users()?
            .into_iter()
            .filter(|u| u.has_role(role))
            .collect())
    }

    pub fn update_user(&self, id: Uuid, update: &UserUpdate) -> Result<User> {
        if self.get_user(id)?.is_none() {
            return Err(TrackerError::not_found("User", id).into());
        }
        if self.taken("users", "username", &update.username, Some(id))? {
            return Err(TrackerError::already_exists("User", &update.username).into());
        }
        if self.taken("users", "email", &update.email, Some(id))? {
            return Err(TrackerError::already_exists("E-mail", &update.email).into());
        }
        self.conn
            .execute(
                "UPDATE users SET username = ?1, first_name = ?2, last_name = ?3, email = ?4,
                 roles = ?5, locale = ?6, dark_mode = ?7, pinned_menu = ?8 WHERE id = ?9",
                params![
                    update.username,
                    update.first_name,
                    update.last_name,
                    update.email,
                    roles_json(&update.roles)?,
                    update.locale,
                    update.dark_mode,
                    update.pinned_menu,
                    id,
                ],
            )
            .context("Failed to update user")?;
        self.get_user(id)?.context("User not found after update")
    }

    pub fn set_password_hash(&self, id: Uuid, password_hash: &str) -> Result<()> {
        let affected = self
            .conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE id = ?2",
                params![password_hash, id],
            )
            .context("Failed to update password")?;
        if affected == 0 {
            return Err(TrackerError::not_found("User", id).into());
        }
        Ok(())
    }

    pub fn delete_user(&self, id: Uuid) -> Result<bool> {
        let loaded = self.count(
            "SELECT COUNT(*) FROM carriers c JOIN locations l ON c.location_id = l.id
             WHERE l.transporter_id = ?1",
            id,
            "carriers on transport",
        )?;
        if loaded > 0 {
            return Err(TrackerError::in_use("user", "carriers are still on the user's transport").into());
        }
        self.delete_by_id("users", id)
    }

    // ── Sessions & reset tokens ───────────────────────────────────────

    pub fn create_session(&self, token: &str, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sessions (token, user_id, expires_at) VALUES (?1, ?2, ?3)",
                params![token, user_id, expires_at],
            )
            .context("Failed to insert session")?;
        Ok(())
    }

    /// User behind a session token that has not expired at `now`.
    pub fn session_user(&self, token: &str, now: DateTime<Utc>) -> Result<Option<User>> {
        let session = self.query_one(
            "SELECT user_id, expires_at FROM sessions WHERE token = ?1",
            [token],
            "session",
            |row| Ok((row.get::<_, Uuid>(0)?, row.get::<_, DateTime<Utc>>(1)?)),
        )?;
        match session {
            Some((user_id, expires_at)) if expires_at > now => self.get_user(user_id),
            _ => Ok(None),
        }
    }

    pub fn delete_session(&self, token: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM sessions WHERE token = ?1", [token])
            .context("Failed to delete session")?;
        Ok(affected > 0)
    }

    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<String> = self
            .query_rows(
                "SELECT token, expires_at FROM sessions",
                [],
                "sessions",
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, DateTime<Utc>>(1)?)),
            )?
            .into_iter()
            .filter(|(_, expires_at)| *expires_at <= now)
            .map(|(token, _)| token)
            .collect();
        for token in &expired {
            self.delete_session(token)?;
        }
        Ok(expired.len())
    }

    pub fn create_reset_token(&self, token_hash: &str, user_id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO reset_tokens (token_hash, user_id, expires_at) VALUES (?1, ?2, ?3)",
                params![token_hash, user_id, expires_at],
            )
            .context("Failed to insert reset token")?;
        Ok(())
    }

    /// Removes a reset token and returns its owner and expiry.
    pub fn take_reset_token(&self, token_hash: &str) -> Result<Option<(Uuid, DateTime<Utc>)>> {
        let found = self.query_one(
            "SELECT user_id, expires_at FROM reset_tokens WHERE token_hash = ?1",
            [token_hash],
            "reset token",
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if found.is_some() {
            self.conn
                .execute("DELETE FROM reset_tokens WHERE token_hash = ?1", [token_hash])
                .context("Failed to delete reset token")?;
        }
        Ok(found)
    }

    // ── Priorities ────────────────────────────────────────────────────

    pub fn create_priority(&self, name: &str, value: i32) -> Result<Priority> {
        if self.taken("priorities", "name", name, None)? {
            return Err(TrackerError::already_exists("Priority", name).into());
        }
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO priorities (id, name, value) VALUES (?1, ?2, ?3)",
                params![id, name, value],
            )
            .context("Failed to insert priority")?;
        self.get_priority(id)?.context("Priority not found after insert")
    }

    pub fn list_priorities(&self) -> Result<Vec<Priority>> {
        self.query_rows(
            "SELECT id, name, value FROM priorities ORDER BY value DESC, name",
            [],
            "priorities",
            |row| {
                Ok(Priority {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                })
            },
        )
    }

    pub fn get_priority(&self, id: Uuid) -> Result<Option<Priority>> {
        self.query_one(
            "SELECT id, name, value FROM priorities WHERE id = ?1",
            [id],
            "priority",
            |row| {
                Ok(Priority {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                })
            },
        )
    }

    pub fn update_priority(&self, id: Uuid, name: &str, value: i32) -> Result<Priority> {
        if self.get_priority(id)?.is_none() {
            return Err(TrackerError::not_found("Priority", id).into());
        }
        if self.taken("priorities", "name", name, Some(id))? {
            return Err(TrackerError::already_exists("Priority", name).into());
        }
        self.conn
            .execute(
                "UPDATE priorities SET name = ?1, value = ?2 WHERE id = ?3",
                params![name, value, id],
            )
            .context("Failed to update priority")?;
        self.get_priority(id)?.context("Priority not found after update")
    }

    pub fn delete_priority(&self, id: Uuid) -> Result<bool> {
        if self.count("SELECT COUNT(*) FROM jobs WHERE priority_id = ?1", id, "jobs")? > 0 {
            return Err(TrackerError::in_use("priority", "it is used by a job").into());
        }
        self.delete_by_id("priorities", id)
    }

    // ── Carrier types ─────────────────────────────────────────────────

    pub fn create_carrier_type(&self, name: &str) -> Result<CarrierType> {
        if self.taken("carrier_types", "name", name, None)? {
            return Err(TrackerError::already_exists("Carrier type", name).into());
        }
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO carrier_types (id, name) VALUES (?1, ?2)",
                params![id, name],
            )
            .context("Failed to insert carrier type")?;
        self.get_carrier_type(id)?
            .context("Carrier type not found after insert")
    }

    pub fn list_carrier_types(&self) -> Result<Vec<CarrierType>> {
        self.query_rows(
            "SELECT id, name FROM carrier_types ORDER BY name",
            [],
            "carrier types",
            |row| {
                Ok(CarrierType {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
    }

    pub fn get_carrier_type(&self, id: Uuid) -> Result<Option<CarrierType>> {
        self.query_one(
            "SELECT id, name FROM carrier_types WHERE id = ?1",
            [id],
            "carrier type",
            |row| {
                Ok(CarrierType {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
    }

    pub fn get_carrier_type_by_name(&self, name: &str) -> Result<Option<CarrierType>> {
        self.query_one(
            "SELECT id, name FROM carrier_types WHERE name = ?1",
            [name],
            "carrier type by name",
            |row| {
                Ok(CarrierType {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
    }

    pub fn update_carrier_type(&self, id: Uuid, name: &str) -> Result<CarrierType> {
        if self.get_carrier_type(id)?.is_none() {
            return Err(TrackerError::not_found("Carrier type", id).into());
        }
        if self.taken("carrier_types", "name", name, Some(id))? {
            return Err(TrackerError::already_exists("Carrier type", name).into());
        }
        self.conn
            .execute(
                "UPDATE carrier_types SET name = ?1 WHERE id = ?2",
                params![name, id],
            )
            .context("Failed to update carrier type")?;
        self.get_carrier_type(id)?
            .context("Carrier type not found after update")
    }

    pub fn delete_carrier_type(&self, id: Uuid) -> Result<bool> {
        let used = self.count(
            "SELECT (SELECT COUNT(*) FROM carriers WHERE carrier_type_id = ?1)
                  + (SELECT COUNT(*) FROM process_steps WHERE preparation_id = ?1 OR output_id = ?1)",
            id,
            "carrier type references",
        )?;
        if used > 0 {
            return Err(TrackerError::in_use("carrier type", "it is used by a carrier or step").into());
        }
        self.delete_by_id("carrier_types", id)
    }

    // ── Parameters ────────────────────────────────────────────────────

    pub fn create_parameter(&self, field: &str) -> Result<Parameter> {
        if self.taken("parameters", "field", field, None)? {
            return Err(TrackerError::already_exists("Parameter", field).into());
        }
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO parameters (id, field) VALUES (?1, ?2)",
                params![id, field],
            )
            .context("Failed to insert parameter")?;
        self.get_parameter(id)?.context("Parameter not found after insert")
    }

    pub fn list_parameters(&self) -> Result<Vec<Parameter>> {
        self.query_rows(
            "SELECT id, field FROM parameters ORDER BY field",
            [],
            "parameters",
            |row| {
                Ok(Parameter {
                    id: row.get(0)?,
                    field: row.get(1)?,
                })
            },
        )
    }

    pub fn get_parameter(&self, id: Uuid) -> Result<Option<Parameter>> {
        self.query_one(
            "SELECT id, field FROM parameters WHERE id = ?1",
            [id],
            "parameter",
            |row| {
                Ok(Parameter {
                    id: row.get(0)?,
                    field: row.get(1)?,
                })
            },
        )
    }

    pub fn update_parameter(&self, id: Uuid, field: &str) -> Result<Parameter> {
        if self.get_parameter(id)?.is_none() {
            return Err(TrackerError::not_found("Parameter", id).into());
        }
        if self.taken("parameters", "field", field, Some(id))? {
            return Err(TrackerError::already_exists("Parameter", field).into());
        }
        self.conn
            .execute(
                "UPDATE parameters SET field = ?1 WHERE id = ?2",
                params![field, id],
            )
            .context("Failed to update parameter")?;
        self.get_parameter(id)?.context("Parameter not found after update")
    }

    pub fn delete_parameter(&self, id: Uuid) -> Result<bool> {
        let used = self.count(
            "SELECT COUNT(*) FROM process_step_parameters WHERE parameter_id = ?1",
            id,
            "parameter references",
        )?;
        if used > 0 {
            return Err(TrackerError::in_use("parameter", "it is used by a process step").into());
        }
        self.delete_by_id("parameters", id)
    }

    // ── Locations ─────────────────────────────────────────────────────

    pub fn get_location(&self, id: Uuid) -> Result<Option<Location>> {
        let row = self.query_one(
            "SELECT id, kind, position FROM locations WHERE id = ?1",
            [id],
            "location",
            |row| {
                Ok((
                    row.get::<_, Uuid>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?;
        match row {
            Some((id, kind, position)) => Ok(Some(Location {
                id,
                kind: LocationKind::from_str(&kind)
                    .map_err(|e| anyhow::anyhow!(e))
                    .context("Failed to parse location kind")?,
                position,
            })),
            None => Ok(None),
        }
    }

    fn location_kind(&self, id: Uuid) -> Result<Option<LocationKind>> {
        Ok(self.get_location(id)?.map(|l| l.kind))
    }

    fn carriers_at(&self, location_id: Uuid) -> Result<i64> {
        self.count(
            "SELECT COUNT(*) FROM carriers WHERE location_id = ?1",
            location_id,
            "carriers at location",
        )
    }

    pub fn create_stock(&self, position: &str) -> Result<Stock> {
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO locations (id, kind, position) VALUES (?1, 'stock', ?2)",
                params![id, position],
            )
            .context("Failed to insert stock")?;
        self.get_stock(id)?.context("Stock not found after insert")
    }

    pub fn list_stocks(&self) -> Result<Vec<Stock>> {
        self.query_rows(
            "SELECT id, position FROM locations WHERE kind = 'stock' ORDER BY position",
            [],
            "stocks",
            |row| {
                Ok(Stock {
                    id: row.get(0)?,
                    position: row.get(1)?,
                })
            },
        )
    }

    pub fn get_stock(&self, id: Uuid) -> Result<Option<Stock>> {
        self.query_one(
            "SELECT id, position FROM locations WHERE kind = 'stock' AND id = ?1",
            [id],
            "stock",
            |row| {
                Ok(Stock {
                    id: row.get(0)?,
                    position: row.get(1)?,
                })
            },
        )
    }

    /// The stock at the default stock position, or any stock when none sits there.
    pub fn default_stock(&self) -> Result<Option<Stock>> {
        let stocks = self.list_stocks()?;
        let preferred = stocks.iter().position(|s| s.position == STOCK_POSITION);
        Ok(match preferred {
            Some(i) => stocks.into_iter().nth(i),
            None => stocks.into_iter().next(),
        })
    }

    pub fn update_stock(&self, id: Uuid, position: &str) -> Result<Stock> {
        if self.get_stock(id)?.is_none() {
            return Err(TrackerError::not_found("Stock", id).into());
        }
        self.conn
            .execute(
                "UPDATE locations SET position = ?1 WHERE id = ?2",
                params![position, id],
            )
            .context("Failed to update stock")?;
        self.get_stock(id)?.context("Stock not found after update")
    }

    pub fn delete_location(&self, id: Uuid) -> Result<bool> {
        if self.carriers_at(id)? > 0 {
            return Err(TrackerError::in_use("location", "carriers are stored there").into());
        }
        let steps = self.count(
            "SELECT COUNT(*) FROM process_steps WHERE workstation_id = ?1",
            id,
            "steps at workstation",
        )?;
        if steps > 0 {
            return Err(TrackerError::in_use("workstation", "it is used by a process step").into());
        }
        self.delete_by_id("locations", id)
    }

    pub fn create_transport(&self, position: &str, transporter: Uuid) -> Result<Transport> {
        if self.get_user(transporter)?.is_none() {
            return Err(TrackerError::not_found("User", transporter).into());
        }
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO locations (id, kind, position, transporter_id) VALUES (?1, 'transport', ?2, ?3)",
                params![id, position, transporter],
            )
            .context("Failed to insert transport")?;
        self.get_transport(id)?.context("Transport not found after insert")
    }

    pub fn list_transports(&self) -> Result<Vec<Transport>> {
        self.query_rows(
            "SELECT id, position, transporter_id FROM locations WHERE kind = 'transport' ORDER BY position",
            [],
            "transports",
            |row| {
                Ok(Transport {
                    id: row.get(0)?,
                    position: row.get(1)?,
                    transporter: row.get(2)?,
                })
            },
        )
    }

    pub fn get_transport(&self, id: Uuid) -> Result<Option<Transport>> {
        self.query_one(
            "SELECT id, position, transporter_id FROM locations WHERE kind = 'transport' AND id = ?1",
            [id],
            "transport",
            |row| {
                Ok(Transport {
                    id: row.get(0)?,
                    position: row.get(1)?,
                    transporter: row.get(2)?,
                })
            },
        )
    }

    pub fn transport_for_user(&self, user_id: Uuid) -> Result<Option<Transport>> {
        self.query_one(
            "SELECT id, position, transporter_id FROM locations
             WHERE kind = 'transport' AND transporter_id = ?1",
            [user_id],
            "transport by user",
            |row| {
                Ok(Transport {
                    id: row.get(0)?,
                    position: row.get(1)?,
                    transporter: row.get(2)?,
                })
            },
        )
    }

    pub fn update_transport(&self, id: Uuid, position: &str, transporter: Uuid) -> Result<Transport> {
        if self.get_transport(id)?.is_none() {
            return Err(TrackerError::not_found("Transport", id).into());
        }
        if self.get_user(transporter)?.is_none() {
            return Err(TrackerError::not_found("User", transporter).into());
        }
        self.conn
            .execute(
                "UPDATE locations SET position = ?1, transporter_id = ?2 WHERE id = ?3",
                params![position, transporter, id],
            )
            .context("Failed to update transport")?;
        self.get_transport(id)?.context("Transport not found after update")
    }

    /// Keeps the transport of a user in step with the transport role. The
    /// transport is named after the user.
    pub fn sync_transport(&self, user: &User) -> Result<Option<Transport>> {
        let existing = self.transport_for_user(user.id)?;
        if !user.has_role(Role::Transport) {
            if let Some(transport) = existing {
                self.delete_location(transport.id)?;
            }
            return Ok(None);
        }
        let position = format!("{} {}", user.first_name, user.last_name);
        let transport = match existing {
            Some(transport) => self.update_transport(transport.id, &position, user.id)?,
            None => self.create_transport(&position, user.id)?,
        };
        Ok(Some(transport))
    }

    pub fn create_workstation(&self, ws: &NewWorkstation) -> Result<Workstation> {
        if self.taken("locations", "name", &ws.name, None)? {
            return Err(TrackerError::already_exists("Workstation", &ws.name).into());
        }
        let id = Uuid::new_v4();
        self.transaction(|db| {
            db.conn
                .execute(
                    "INSERT INTO locations (id, kind, position, name, broken, active)
                     VALUES (?1, 'workstation', ?2, ?3, ?4, ?5)",
                    params![id, ws.position, ws.name, ws.broken, ws.active],
                )
                .context("Failed to insert workstation")?;
            db.replace_workstation_users(id, &ws.users)
        })?;
        self.get_workstation(id)?
            .context("Workstation not found after insert")
    }

    fn replace_workstation_users(&self, id: Uuid, users: &[Uuid]) -> Result<()> {
        self.conn
            .execute("DELETE FROM workstation_users WHERE workstation_id = ?1", [id])
            .context("Failed to clear workstation users")?;
        for user in users {
            if self.get_user(*user)?.is_none() {
                return Err(TrackerError::not_found("User", user).into());
            }
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO workstation_users (workstation_id, user_id) VALUES (?1, ?2)",
                    params![id, user],
                )
                .context("Failed to insert workstation user")?;
        }
        Ok(())
    }

    fn workstation_from_row(&self, row: (Uuid, String, String, bool, bool)) -> Result<Workstation> {
        let (id, name, position, broken, active) = row;
        let users = self.ids(
            "SELECT user_id FROM workstation_users WHERE workstation_id = ?1",
            id,
            "workstation users",
        )?;
        Ok(Workstation {
            id,
            name,
            position,
            broken,
            active,
            users,
        })
    }

    pub fn list_workstations(&self) -> Result<Vec<Workstation>> {
        let rows = self.query_rows(
            "SELECT id, name, position, broken, active FROM locations
             WHERE kind = 'workstation' ORDER BY name",
            [],
            "workstations",
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
        rows.into_iter()
            .map(|r| self.workstation_from_row(r))
            .collect()
    }

    pub fn get_workstation(&self, id: Uuid) -> Result<Option<Workstation>> {
        let row = self.query_one(
            "SELECT id, name, position, broken, active FROM locations
             WHERE kind = 'workstation' AND id = ?1",
            [id],
            "workstation",
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
        row.map(|r| self.workstation_from_row(r)).transpose()
    }

    pub fn workstations_for_user(&self, user_id: Uuid) -> Result<Vec<Workstation>> {
        Ok(self
            .list_workstations()?
            .into_iter()
            .filter(|w| w.users.contains(&user_id))
            .collect())
    }

    pub fn update_workstation(&self, id: Uuid, ws: &NewWorkstation) -> Result<Workstation> {
        if self.get_workstation(id)?.is_none() {
            return Err(TrackerError::not_found("Workstation", id).into());
        }
        if self.taken("locations", "name", &ws.name, Some(id))? {
            return Err(TrackerError::already_exists("Workstation", &ws.name).into());
        }
        self.transaction(|db| {
            db.conn
                .execute(
                    "UPDATE locations SET name = ?1, position = ?2, broken = ?3, active = ?4 WHERE id = ?5",
                    params![ws.name, ws.position, ws.broken, ws.active, id],
                )
                .context("Failed to update workstation")?;
            db.replace_workstation_users(id, &ws.users)
        })?;
        self.get_workstation(id)?
            .context("Workstation not found after update")
    }

    // ── Carriers ──────────────────────────────────────────────────────

    pub fn create_carrier(&self, carrier_id: &str, carrier_type: Uuid, location: Uuid) -> Result<Carrier> {
        if self.taken("carriers", "carrier_id", carrier_id, None)? {
            return Err(TrackerError::already_exists("Carrier", carrier_id).into());
        }
        self.check_carrier_refs(carrier_type, location)?;
        let id = Uuid::new_v4();
        self.conn
            .execute(
                "INSERT INTO carriers (id, carrier_id, carrier_type_id, location_id) VALUES (?1, ?2, ?3, ?4)",
                params![id, carrier_id, carrier_type, location],
            )
            .context("Failed to insert carrier")?;
        self.get_carrier(id)?.context("Carrier not found after insert")
    }

    fn check_carrier_refs(&self, carrier_type: Uuid, location: Uuid) -> Result<()> {
        if self.get_carrier_type(carrier_type)?.is_none() {
            return Err(TrackerError::not_found("Carrier type", carrier_type).into());
        }
        if self.location_kind(location)?.is_none() {
            return Err(TrackerError::not_found("Location", location).into());
        }
        Ok(())
    }

    fn carrier_from_row(&self, row: (Uuid, String, Uuid, Uuid)) -> Result<Carrier> {
        let (id, carrier_id, type_id, location_id) = row;
        Ok(Carrier {
            id,
            carrier_id,
            carrier_type: self
                .get_carrier_type(type_id)?
                .context("Carrier type of carrier missing")?,
            location: self
                .get_location(location_id)?
                .context("Location of carrier missing")?,
        })
    }

    pub fn list_carriers(&self) -> Result<Vec<Carrier>> {
        let rows = self.query_rows(
            "SELECT id, carrier_id, carrier_type_id, location_id FROM carriers ORDER BY carrier_id",
            [],
            "carriers",
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        rows.into_iter().map(|r| self.carrier_from_row(r)).collect()
    }

    pub fn get_carrier(&self, id: Uuid) -> Result<Option<Carrier>> {
        let row = self.query_one(
            "SELECT id, carrier_id, carrier_type_id, location_id FROM carriers WHERE id = ?1",
            [id],
            "carrier",
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        row.map(|r| self.carrier_from_row(r)).transpose()
    }

    pub fn update_carrier(&self, id: Uuid, carrier_id: &str, carrier_type: Uuid, location: Uuid) -> Result<Carrier> {
        if self.get_carrier(id)?.is_none() {
            return Err(TrackerError::not_found("Carrier", id).into());
        }
        if self.taken("carriers", "carrier_id", carrier_id, Some(id))? {
            return Err(TrackerError::already_exists("Carrier", carrier_id).into());
        }
        self.check_carrier_refs(carrier_type, location)?;
        self.conn
            .execute(
                "UPDATE carriers SET carrier_id = ?1, carrier_type_id = ?2, location_id = ?3 WHERE id = ?4",
                params![carrier_id, carrier_type, location, id],
            )
            .context("Failed to update carrier")?;
        self.get_carrier(id)?.context("Carrier not found after update")
    }

    /// Relocates carriers, e.g. onto a transport or into a workstation.
    pub fn move_carriers(&self, carriers: &[Uuid], location: Uuid) -> Result<()> {
        if self.location_kind(location)?.is_none() {
            return Err(TrackerError::not_found("Location", location).into());
        }
        self.transaction(|db| {
            for carrier in carriers {
                db.conn
                    .execute(
                        "UPDATE carriers SET location_id = ?1 WHERE id = ?2",
                        params![location, carrier],
                    )
                    .context("Failed to move carrier")?;
            }
            Ok(())
        })
    }

    pub fn delete_carrier(&self, id: Uuid) -> Result<bool> {
        let used = self.count(
            "SELECT COUNT(*) FROM assembly_carriers WHERE carrier_id = ?1",
            id,
            "carrier references",
        )?;
        if used > 0 {
            return Err(TrackerError::in_use("carrier", "it holds an assembly").into());
        }
        self.delete_by_id("carriers", id)
    }

    // ── Validation patterns ───────────────────────────────────────────

    pub fn upsert_pattern(&self, pattern: &ValidationPattern) -> Result<ValidationPattern> {
        self.conn
            .execute(
                "INSERT INTO validation_patterns (name, pattern, lower, upper, digits, special, dot,
                     underscore, dash, space, slash, backslash, min_length, max_length, advanced)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(name) DO UPDATE SET pattern = excluded.pattern, lower = excluded.lower,
                     upper = excluded.upper, digits = excluded.digits, special = excluded.special,
                     dot = excluded.dot, underscore = excluded.underscore, dash = excluded.dash,
                     space = excluded.space, slash = excluded.slash, backslash = excluded.backslash,
                     min_length = excluded.min_length, max_length = excluded.max_length,
                     advanced = excluded.advanced",
                params![
                    pattern.name,
                    pattern.pattern,
                    pattern.lower,
                    pattern.upper,
                    pattern.digits,
                    pattern.special,
                    pattern.dot,
                    pattern.underscore,
                    pattern.dash,
                    pattern.space,
                    pattern.slash,
                    pattern.backslash,
                    pattern.min_length,
                    pattern.max_length,
                    pattern.advanced,
                ],
            )
            .context("Failed to upsert validation pattern")?;
        self.get_pattern(&pattern.name)?
            .context("Validation pattern not found after upsert")
    }

    pub fn get_pattern(&self, name: &str) -> Result<Option<ValidationPattern>> {
        let sql = format!(
            "SELECT {} FROM validation_patterns WHERE name = ?1",
            PATTERN_COLUMNS
        );
        self.query_one(&sql, [name], "validation pattern", pattern_from_row)
    }

    pub fn list_patterns(&self) -> Result<Vec<ValidationPattern>> {
        let sql = format!(
            "SELECT {} FROM validation_patterns ORDER BY name",
            PATTERN_COLUMNS
        );
        self.query_rows(&sql, [], "validation patterns", pattern_from_row)
    }

    pub fn delete_pattern(&self, name: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM validation_patterns WHERE name = ?1", [name])
            .context("Failed to delete validation pattern")?;
        Ok(affected > 0)
    }

    // ── Global config ─────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.query_one(
            "SELECT value FROM global_config WHERE key = ?1",
            [key],
            "global config",
            |row| row.get(0),
        )
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO global_config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .context("Failed to set global config")?;
        Ok(())
    }

    pub fn list_config(&self) -> Result<Vec<GlobalConfig>> {
        self.query_rows(
            "SELECT key, value FROM global_config ORDER BY key",
            [],
            "global config",
            |row| {
                Ok(GlobalConfig {
                    key: row.get(0)?,
                    value: row.get(1)?,
                })
            },
        )
    }

    pub fn delete_config(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM global_config WHERE key = ?1", [key])
            .context("Failed to delete global config")?;
        Ok(affected > 0)
    }
}
