//! SQLite durable backend.
//!
//! One file holds campaign definitions, enrollments, tracking rows and
//! conversation artifacts. Two connections are kept to it: the regular one,
//! and a *service* connection used only by the privileged tracking write
//! after the regular connection was refused.

mod campaigns;
mod tracking;

use chrono::{DateTime, SecondsFormat, Utc};
use leadflow_core::error::{LeadflowError, Result};
use leadflow_core::types::{Campaign, Lead, Step};
use rusqlite::{Connection, ErrorCode, OpenFlags, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS campaigns (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    CREATE TABLE IF NOT EXISTS steps (
        id TEXT PRIMARY KEY,
        campaign_id TEXT NOT NULL,
        step_type TEXT NOT NULL,
        order_index INTEGER NOT NULL,
        config TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_steps_campaign ON steps(campaign_id, order_index);

    CREATE TABLE IF NOT EXISTS leads (
        id TEXT PRIMARY KEY,
        first_name TEXT,
        last_name TEXT,
        email TEXT,
        phone TEXT,
        company TEXT,
        title TEXT,
        custom TEXT NOT NULL DEFAULT '{}'
    );

    CREATE TABLE IF NOT EXISTS enrollments (
        id TEXT PRIMARY KEY,
        lead_id TEXT NOT NULL,
        campaign_id TEXT NOT NULL,
        current_step_index INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        next_due_at TEXT,
        decision_path_id TEXT,
        paused_at TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (lead_id, campaign_id)
    );
    CREATE INDEX IF NOT EXISTS idx_enrollments_due ON enrollments(campaign_id, status, next_due_at);

    CREATE TABLE IF NOT EXISTS tracking (
        tracking_id TEXT PRIMARY KEY,
        channel TEXT NOT NULL,
        external_id TEXT,
        status TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tracking_external ON tracking(external_id);

    CREATE TABLE IF NOT EXISTS artifacts (
        id TEXT PRIMARY KEY,
        tracking_id TEXT NOT NULL,
        data TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_artifacts_tracking ON artifacts(tracking_id);
";

/// SQLite-backed campaign repository and tracking backend.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    service: Option<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open or create the database file. `~` is expanded.
    pub fn open(path: &str) -> Result<Self> {
        let path = expand(path);
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path).map_err(db_err)?;
        // WAL lets the service connection write while readers are active.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        let service = Connection::open(&path).map_err(db_err)?;

        let db = Self {
            conn: Mutex::new(conn),
            service: Some(Mutex::new(service)),
        };
        db.migrate()?;
        tracing::info!("🗄️ Database ready at {path}");
        Ok(db)
    }

    /// Private in-memory database. There is no privileged path.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let db = Self { conn: Mutex::new(conn), service: None };
        db.migrate()?;
        Ok(db)
    }

    /// Regular connection read-only, writes allowed only through the
    /// service connection. Every normal write surfaces as permission denied.
    pub fn open_restricted(path: &str) -> Result<Self> {
        let path = expand(path);
        let service = Connection::open(&path).map_err(db_err)?;
        service.execute_batch(SCHEMA).map_err(db_err)?;
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            service: Some(Mutex::new(service)),
        })
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?.execute_batch(SCHEMA).map_err(db_err)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| LeadflowError::Backend(format!("Lock: {e}")))
    }

    pub(crate) fn lock_service(&self) -> Result<MutexGuard<'_, Connection>> {
        let service = self.service.as_ref().ok_or_else(|| {
            LeadflowError::PermissionDenied("no service connection for this database".into())
        })?;
        service
            .lock()
            .map_err(|e| LeadflowError::Backend(format!("Lock: {e}")))
    }

    // ── Definitions ─────────────────────────────────────────
    // Campaigns, steps and leads are written by the operator tooling; these
    // upserts exist for imports and tests.

    pub fn upsert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO campaigns (id, name, enabled) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, enabled = excluded.enabled",
                params![campaign.id, campaign.name, campaign.enabled],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn upsert_step(&self, step: &Step) -> Result<()> {
        let config = serde_json::to_string(&step.config)?;
        self.lock()?
            .execute(
                "INSERT INTO steps (id, campaign_id, step_type, order_index, config)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET step_type = excluded.step_type,
                    order_index = excluded.order_index, config = excluded.config",
                params![
                    step.id,
                    step.campaign_id,
                    step.step_type.as_str(),
                    step.order_index as i64,
                    config
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    pub fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        let custom = serde_json::to_string(&lead.custom)?;
        self.lock()?
            .execute(
                "INSERT INTO leads (id, first_name, last_name, email, phone, company, title, custom)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET first_name = excluded.first_name,
                    last_name = excluded.last_name, email = excluded.email,
                    phone = excluded.phone, company = excluded.company,
                    title = excluded.title, custom = excluded.custom",
                params![
                    lead.id,
                    lead.first_name,
                    lead.last_name,
                    lead.email,
                    lead.phone,
                    lead.company,
                    lead.title,
                    custom
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }
}

fn expand(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}

/// Map SQLite failures onto the error taxonomy. Authorization and read-only
/// refusals are the permission class; everything else is transient I/O.
pub(crate) fn db_err(e: rusqlite::Error) -> LeadflowError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if matches!(
            err.code,
            ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly
                | ErrorCode::AuthorizationForStatementDenied
        ) {
            return LeadflowError::PermissionDenied(e.to_string());
        }
    }
    LeadflowError::Backend(e.to_string())
}

/// Timestamps are stored as fixed-width RFC 3339 so text comparison orders them.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_roundtrip_orders_lexically() {
        let a = Utc::now();
        let b = a + chrono::Duration::seconds(1);
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts(&ts(a)).map(|d| d.timestamp_millis()), Some(a.timestamp_millis()));
    }

    #[test]
    fn test_readonly_maps_to_permission_denied() {
        let dir = std::env::temp_dir().join(format!("leadflow-db-ro-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ro.db");
        let db = SqliteBackend::open_restricted(path.to_str().unwrap()).unwrap();
        let err = db
            .upsert_campaign(&Campaign { id: "c1".into(), name: "x".into(), enabled: true })
            .unwrap_err();
        assert!(err.is_permission_denied(), "got {err}");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_in_memory_has_no_service_connection() {
        let db = SqliteBackend::open_in_memory().unwrap();
        assert!(db.lock_service().unwrap_err().is_permission_denied());
    }
}
