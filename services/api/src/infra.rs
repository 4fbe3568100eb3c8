use chrono::{DateTime, Utc};
use lead_sync::workflows::planning::{
    ClientAccount, ClientId, Lead, RepositoryError, SyncCriteria, SyncRepository, SyncRun,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clients (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS criteria (
    client_id TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    last_run_at TEXT
);
CREATE TABLE IF NOT EXISTS leads (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    external_reference TEXT NOT NULL,
    body TEXT NOT NULL,
    UNIQUE (client_id, external_reference)
);
CREATE TABLE IF NOT EXISTS runs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS runs_by_client ON runs (client_id, seq);
";

/// SQLite-backed store. Records are kept as JSON bodies keyed by the columns
/// the queries filter on. Several processes may open the same file; SQLite's
/// locking serialises their writes.
pub(crate) struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database and its tables.
    pub(crate) fn open(path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let path = path.into();
        let unavailable =
            |err: &dyn std::fmt::Display| RepositoryError::Unavailable(format!("{}: {err}", path.display()));

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| unavailable(&err))?;
        }
        let conn = Connection::open(&path).map_err(|err| unavailable(&err))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| unavailable(&err))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .map_err(|err| unavailable(&err))?;
        conn.execute_batch(SCHEMA).map_err(|err| unavailable(&err))?;
        debug!(path = %path.display(), "state database opened");

        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RepositoryError> {
        self.conn
            .lock()
            .map_err(|_| RepositoryError::Unavailable("connection mutex poisoned".to_string()))
    }
}

fn storage(err: rusqlite::Error) -> RepositoryError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            RepositoryError::Conflict
        }
        _ => RepositoryError::Unavailable(err.to_string()),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|err| RepositoryError::Unavailable(err.to_string()))
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(body).map_err(|err| RepositoryError::Unavailable(err.to_string()))
}

fn decode_all<T: DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>, RepositoryError> {
    bodies.iter().map(|body| decode(body)).collect()
}

fn parse_checkpoint(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| RepositoryError::Unavailable(format!("checkpoint {raw:?}: {err}")))
}

impl SyncRepository for SqliteStore {
    fn list_clients(&self) -> Result<Vec<ClientAccount>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT body FROM clients ORDER BY seq")
            .map_err(storage)?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        decode_all(bodies)
    }

    fn get_client(&self, id: &ClientId) -> Result<Option<ClientAccount>, RepositoryError> {
        let body = self
            .conn()?
            .query_row("SELECT body FROM clients WHERE id = ?1", params![id.0], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(storage)?;
        body.as_deref().map(decode).transpose()
    }

    fn save_client(&self, client: ClientAccount) -> Result<(), RepositoryError> {
        let body = encode(&client)?;
        self.conn()?
            .execute(
                "INSERT INTO clients (id, body) VALUES (?1, ?2)
                 ON CONFLICT (id) DO UPDATE SET body = excluded.body",
                params![client.id.0, body],
            )
            .map_err(storage)?;
        Ok(())
    }

    fn delete_client(&self, id: &ClientId) -> Result<(), RepositoryError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage)?;
        let removed = tx
            .execute("DELETE FROM clients WHERE id = ?1", params![id.0])
            .map_err(storage)?;
        if removed == 0 {
            return Err(RepositoryError::NotFound);
        }
        tx.execute("DELETE FROM criteria WHERE client_id = ?1", params![id.0])
            .map_err(storage)?;
        tx.commit().map_err(storage)
    }

    fn get_criteria(&self, client_id: &ClientId) -> Result<Option<SyncCriteria>, RepositoryError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT body, last_run_at FROM criteria WHERE client_id = ?1",
                params![client_id.0],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .map_err(storage)?;

        let Some((body, last_run_at)) = row else {
            return Ok(None);
        };
        let mut criteria: SyncCriteria = decode(&body)?;
        criteria.last_run_at = last_run_at.as_deref().map(parse_checkpoint).transpose()?;
        Ok(Some(criteria))
    }

    fn save_criteria(&self, criteria: SyncCriteria) -> Result<(), RepositoryError> {
        let body = encode(&criteria)?;
        let checkpoint = criteria.last_run_at.map(|at| at.to_rfc3339());
        self.conn()?
            .execute(
                "INSERT INTO criteria (client_id, body, last_run_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (client_id) DO UPDATE SET body = excluded.body",
                params![criteria.client_id.0, body, checkpoint],
            )
            .map_err(storage)?;
        Ok(())
    }

    fn set_checkpoint(&self, client_id: &ClientId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let updated = self
            .conn()?
            .execute(
                "UPDATE criteria SET last_run_at = ?2 WHERE client_id = ?1",
                params![client_id.0, at.to_rfc3339()],
            )
            .map_err(storage)?;
        if updated == 0 {
            debug!(client_id = %client_id, "checkpoint skipped; criteria removed");
        }
        Ok(())
    }

    fn list_leads(&self, client_id: Option<&ClientId>) -> Result<Vec<Lead>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT body FROM leads WHERE ?1 IS NULL OR client_id = ?1 ORDER BY seq DESC",
            )
            .map_err(storage)?;
        let bodies = stmt
            .query_map(params![client_id.map(|id| id.0.as_str())], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        decode_all(bodies)
    }

    fn save_lead(&self, lead: Lead) -> Result<(), RepositoryError> {
        let body = encode(&lead)?;
        self.conn()?
            .execute(
                "INSERT INTO leads (client_id, external_reference, body) VALUES (?1, ?2, ?3)",
                params![lead.client_id.0, lead.external_reference, body],
            )
            .map_err(storage)?;
        Ok(())
    }

    fn append_run(&self, run: SyncRun) -> Result<(), RepositoryError> {
        let body = encode(&run)?;
        self.conn()?
            .execute(
                "INSERT INTO runs (client_id, body) VALUES (?1, ?2)",
                params![run.client_id.0, body],
            )
            .map_err(storage)?;
        Ok(())
    }

    fn list_runs(&self, client_id: Option<&ClientId>) -> Result<Vec<SyncRun>, RepositoryError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT body FROM runs WHERE ?1 IS NULL OR client_id = ?1 ORDER BY seq DESC")
            .map_err(storage)?;
        let bodies = stmt
            .query_map(params![client_id.map(|id| id.0.as_str())], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        decode_all(bodies)
    }
}
