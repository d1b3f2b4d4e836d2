//! SQLite lease store.
//!
//! Several processes may open the same database file; every mutation runs
//! in an `IMMEDIATE` transaction so read-modify-write of a lease row is
//! atomic across them. All DB calls are dispatched via
//! `tokio::task::spawn_blocking`.

use super::{LeaseRecord, LeaseStore, LeaseToken, LockError, LockResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helper macro
// ---------------------------------------------------------------------------

/// Spawn a blocking closure that receives a locked `&mut Connection`.
macro_rules! db {
    ($conn:expr, $body:expr) => {{
        let conn = Arc::clone(&$conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| {
                LockError::Database(format!("connection mutex poisoned: {e}"))
            })?;
            ($body)(&mut *guard)
        })
        .await
        .map_err(|e| LockError::Database(format!("spawn_blocking panic: {e}")))?
    }};
}

fn db_err(e: rusqlite::Error) -> LockError {
    LockError::Database(e.to_string())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct SqliteLeaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLeaseStore {
    /// Open (or create) the lease database at `path`.
    pub fn new(path: impl AsRef<Path>) -> LockResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(db_err)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create in-memory store (for testing).
    pub fn in_memory() -> LockResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> LockResult<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;

            CREATE TABLE IF NOT EXISTS leases (
                resource    TEXT PRIMARY KEY,
                lease_id    TEXT,
                expires_at  TEXT,
                break_at    TEXT,
                metadata    TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .map_err(db_err)
    }
}

fn format_ts(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn parse_ts(raw: Option<String>) -> LockResult<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| LockError::Database(format!("bad timestamp `{s}`: {e}")))
    })
    .transpose()
}

fn load(conn: &Connection, resource: &str) -> LockResult<Option<LeaseRecord>> {
    let row = conn
        .query_row(
            "SELECT lease_id, expires_at, break_at, metadata \
             FROM leases WHERE resource = ?1",
            params![resource],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;

    let Some((lease_id, expires_at, break_at, metadata)) = row else {
        return Ok(None);
    };
    Ok(Some(LeaseRecord {
        lease_id,
        expires_at: parse_ts(expires_at)?,
        break_at: parse_ts(break_at)?,
        metadata: serde_json::from_str(&metadata)?,
    }))
}

fn save(conn: &Connection, resource: &str, rec: &LeaseRecord) -> LockResult<()> {
    let metadata = serde_json::to_string(&rec.metadata)?;
    conn.execute(
        "UPDATE leases SET lease_id = ?2, expires_at = ?3, break_at = ?4, \
         metadata = ?5 WHERE resource = ?1",
        params![
            resource,
            rec.lease_id,
            format_ts(rec.expires_at),
            format_ts(rec.break_at),
            metadata
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Load, mutate and write back one lease row inside a single
/// `IMMEDIATE` transaction. `f` sees `None` when no marker exists.
fn with_record<T>(
    conn: &mut Connection,
    resource: &str,
    f: impl FnOnce(Option<&mut LeaseRecord>) -> LockResult<T>,
) -> LockResult<T> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err)?;
    let mut rec = load(&tx, resource)?;
    let out = f(rec.as_mut())?;
    if let Some(rec) = &rec {
        save(&tx, resource, rec)?;
    }
    tx.commit().map_err(db_err)?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// LeaseStore impl
// ---------------------------------------------------------------------------

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn create_marker(&self, resource: &str) -> LockResult<()> {
        let resource = resource.to_owned();
        db!(self.conn, move |conn: &mut Connection| {
            conn.execute(
                "INSERT OR IGNORE INTO leases (resource) VALUES (?1)",
                params![resource],
            )
            .map(|_| ())
            .map_err(db_err)
        })
    }

    async fn try_acquire(
        &self,
        resource: &str,
        duration: Duration,
    ) -> LockResult<Option<LeaseToken>> {
        let resource = resource.to_owned();
        db!(self.conn, move |conn: &mut Connection| {
            with_record(conn, &resource, |rec| match rec {
                Some(rec) => Ok(rec.try_acquire(Utc::now(), duration)),
                None => Err(LockError::MarkerNotFound {
                    resource: resource.clone(),
                }),
            })
        })
    }

    async fn properties(
        &self,
        resource: &str,
    ) -> LockResult<Option<LeaseRecord>> {
        let resource = resource.to_owned();
        db!(self.conn, move |conn: &mut Connection| load(conn, &resource))
    }

    async fn release(
        &self,
        resource: &str,
        token: &LeaseToken,
        metadata: Option<&BTreeMap<String, String>>,
    ) -> LockResult<()> {
        let resource = resource.to_owned();
        let token = token.clone();
        let metadata = metadata.cloned();
        db!(self.conn, move |conn: &mut Connection| {
            with_record(conn, &resource, |rec| match rec {
                Some(rec) => {
                    rec.release(&resource, &token, Utc::now(), metadata.as_ref())
                }
                None => Err(LockError::LeaseLost {
                    resource: resource.clone(),
                }),
            })
        })
    }

    async fn break_lease(
        &self,
        resource: &str,
        period: Duration,
    ) -> LockResult<bool> {
        let resource = resource.to_owned();
        db!(self.conn, move |conn: &mut Connection| {
            with_record(conn, &resource, |rec| {
                Ok(rec.is_some_and(|rec| rec.break_lease(Utc::now(), period)))
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
