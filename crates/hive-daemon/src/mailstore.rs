//! Durable mailstore backed by SQLite.
//!
//! One database file holds the append-only event log, the lease table, the
//! tool-audit log, the idempotency registry, and worker heartbeat rows.
//! Every mutation commits before the call returns (`journal_mode=WAL`,
//! `synchronous=FULL`), so a crash at any point leaves the store
//! recoverable: PENDING events and CLAIMED events with expired leases are
//! claimable again on restart, DONE events are never re-emitted.
//!
//! Claims, acks, and fails run inside a single `BEGIN IMMEDIATE`
//! transaction that both checks lease ownership and mutates event status,
//! which serializes concurrent claimers: exactly one receives any given
//! event.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hive_core::event::{iso_now, Event, EventStatus, NewEvent};
use hive_core::tool::{AuditEntry, IdempotencyRecord, NewAuditEntry};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

/// Fixed per-event retry budget; exhaustion moves the event to DEAD.
pub const MAX_RETRIES: u32 = 3;

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        type TEXT NOT NULL,
        origin_id TEXT NOT NULL,
        target_agent TEXT,
        payload_json TEXT NOT NULL,
        justification TEXT,
        status TEXT NOT NULL DEFAULT 'PENDING',
        error TEXT,
        correlation_id TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        result_json TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_events_status_id ON events(status, id);
    CREATE INDEX IF NOT EXISTS idx_events_target_status_id
        ON events(target_agent, status, id);
    CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id);

    CREATE TABLE IF NOT EXISTS leases (
        event_id INTEGER PRIMARY KEY REFERENCES events(id) ON DELETE CASCADE,
        claimed_by TEXT NOT NULL,
        claim_ts TEXT NOT NULL,
        lease_expiry_us INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_leases_expiry ON leases(lease_expiry_us);

    CREATE TABLE IF NOT EXISTS tool_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        action_type TEXT NOT NULL,
        working_dir TEXT NOT NULL,
        idempotency_key TEXT,
        allowed INTEGER NOT NULL,
        reason TEXT,
        payload_json TEXT NOT NULL,
        result_json TEXT,
        correlation_id TEXT
    );

    CREATE TABLE IF NOT EXISTS idempotency_keys (
        idempotency_key TEXT PRIMARY KEY,
        created_ts TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        action_type TEXT NOT NULL,
        event_id INTEGER,
        result_json TEXT
    );

    CREATE TABLE IF NOT EXISTS worker_heartbeats (
        agent_id TEXT PRIMARY KEY,
        consumer_id TEXT NOT NULL,
        pid INTEGER NOT NULL,
        ts TEXT NOT NULL
    );
";

/// Errors from mailstore operations.
#[derive(Debug, thiserror::Error)]
pub enum MailStoreError {
    /// Underlying SQLite failure; propagates to the caller, which exits
    /// non-zero. A fresh process recovers from the durable file.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Ack/fail attempted by a consumer that does not hold the lease.
    #[error("lease for event {event_id} is held by '{holder}', not '{consumer_id}'")]
    LeaseLost {
        /// Event whose lease was contested.
        event_id: i64,
        /// Current lease holder (`<none>` when no lease exists).
        holder: String,
        /// The consumer that attempted the operation.
        consumer_id: String,
    },

    /// Caller-supplied input was rejected before touching storage.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Filesystem error creating the database directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("connection lock poisoned")]
    LockPoisoned,
}

/// Tuning knobs for a mailstore handle.
#[derive(Debug, Clone)]
pub struct MailStoreConfig {
    /// Default lease duration for claims that do not override it.
    pub lease_seconds: f64,
    /// Sleep between claim attempts inside [`MailStore::claim`].
    pub poll_interval: Duration,
    /// SQLite busy timeout.
    pub busy_timeout: Duration,
}

impl Default for MailStoreConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 15.0,
            poll_interval: Duration::from_millis(100),
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

/// Durable event/mail storage with lease-based claiming semantics.
#[derive(Debug, Clone)]
pub struct MailStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
    config: MailStoreConfig,
}

impl MailStore {
    /// Open (creating if necessary) the store at `path`.
    pub fn open(path: impl AsRef<Path>, config: MailStoreConfig) -> Result<Self, MailStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            config,
        })
    }

    /// Path of the backing database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Default lease duration.
    #[must_use]
    pub fn lease_seconds(&self) -> f64 {
        self.config.lease_seconds
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, MailStoreError> {
        self.conn.lock().map_err(|_| MailStoreError::LockPoisoned)
    }

    // -----------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------

    /// Atomically append one PENDING event and return its id.
    pub fn publish(&self, event: NewEvent) -> Result<i64, MailStoreError> {
        let event = event.normalized();
        if event.event_type.trim().is_empty() {
            return Err(MailStoreError::InvalidInput(
                "event type must be non-empty".to_string(),
            ));
        }
        if event.origin_id.trim().is_empty() {
            return Err(MailStoreError::InvalidInput(
                "origin_id must be non-empty".to_string(),
            ));
        }

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events (
                ts, type, origin_id, target_agent, payload_json,
                justification, status, error, correlation_id
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING', NULL, ?7)",
            params![
                iso_now(),
                event.event_type,
                event.origin_id,
                event.target_agent,
                event.payload.to_string(),
                event.justification,
                event.correlation_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(event_id = id, event_type = %event.event_type, "published event");
        Ok(id)
    }

    /// One claim attempt. Selects the lowest-id PENDING event (including
    /// CLAIMED events whose lease has expired, which are requeued first),
    /// matching `target_agent` when supplied, inserts a lease, and flips
    /// the status to CLAIMED. Returns `None` when no candidate exists.
    pub fn try_claim(
        &self,
        consumer_id: &str,
        target_agent: Option<&str>,
        include_unrouted: bool,
        lease_seconds: Option<f64>,
    ) -> Result<Option<Event>, MailStoreError> {
        let consumer_id = consumer_id.trim();
        if consumer_id.is_empty() {
            return Err(MailStoreError::InvalidInput(
                "consumer_id must be non-empty".to_string(),
            ));
        }

        let lease_window = lease_seconds
            .unwrap_or(self.config.lease_seconds)
            .max(0.1);
        let now_us = Utc::now().timestamp_micros();
        #[allow(clippy::cast_possible_truncation)] // lease windows are seconds, not eras
        let expiry_us = now_us + (lease_window * 1_000_000.0) as i64;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        release_expired_leases(&tx, now_us)?;

        let target = target_agent.map(str::trim).filter(|t| !t.is_empty());
        let row: Option<Event> = match target {
            Some(agent) if include_unrouted => tx
                .query_row(
                    "SELECT e.* FROM events e
                     LEFT JOIN leases l ON l.event_id = e.id
                     WHERE e.status = 'PENDING' AND l.event_id IS NULL
                       AND (e.target_agent = ?1 OR e.target_agent IS NULL
                            OR e.target_agent = '')
                     ORDER BY e.id ASC LIMIT 1",
                    params![agent],
                    event_from_row,
                )
                .optional()?,
            Some(agent) => tx
                .query_row(
                    "SELECT e.* FROM events e
                     LEFT JOIN leases l ON l.event_id = e.id
                     WHERE e.status = 'PENDING' AND l.event_id IS NULL
                       AND e.target_agent = ?1
                     ORDER BY e.id ASC LIMIT 1",
                    params![agent],
                    event_from_row,
                )
                .optional()?,
            None => tx
                .query_row(
                    "SELECT e.* FROM events e
                     LEFT JOIN leases l ON l.event_id = e.id
                     WHERE e.status = 'PENDING' AND l.event_id IS NULL
                     ORDER BY e.id ASC LIMIT 1",
                    [],
                    event_from_row,
                )
                .optional()?,
        };

        let Some(mut event) = row else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "INSERT INTO leases (event_id, claimed_by, claim_ts, lease_expiry_us)
             VALUES (?1, ?2, ?3, ?4)",
            params![event.id, consumer_id, iso_now(), expiry_us],
        )?;
        tx.execute(
            "UPDATE events SET status = 'CLAIMED' WHERE id = ?1",
            params![event.id],
        )?;
        tx.commit()?;

        event.status = EventStatus::Claimed;
        debug!(event_id = event.id, consumer_id, "claimed event");
        Ok(Some(event))
    }

    /// Claim with a bounded blocking wait. Polls [`Self::try_claim`] until
    /// an event arrives or `timeout` elapses; callers pass a timeout no
    /// larger than a tenth of the lease window.
    pub fn claim(
        &self,
        consumer_id: &str,
        target_agent: Option<&str>,
        include_unrouted: bool,
        lease_seconds: Option<f64>,
        timeout: Duration,
    ) -> Result<Option<Event>, MailStoreError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(event) =
                self.try_claim(consumer_id, target_agent, include_unrouted, lease_seconds)?
            {
                return Ok(Some(event));
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.config.poll_interval.min(deadline - now));
        }
    }

    /// Transition CLAIMED → DONE. Only the current lease holder may ack.
    pub fn ack(
        &self,
        event_id: i64,
        consumer_id: &str,
        result: Option<&Value>,
    ) -> Result<(), MailStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        verify_lease_holder(&tx, event_id, consumer_id)?;
        tx.execute(
            "UPDATE events SET status = 'DONE', error = NULL, result_json = ?2
             WHERE id = ?1",
            params![event_id, result.map(Value::to_string)],
        )?;
        tx.execute("DELETE FROM leases WHERE event_id = ?1", params![event_id])?;
        tx.commit()?;
        debug!(event_id, consumer_id, "acked event");
        Ok(())
    }

    /// Transition CLAIMED → FAILED, or requeue/dead-letter when `retry` is
    /// requested. Only the current lease holder may fail.
    ///
    /// With `retry`, the event returns to PENDING while its retry budget
    /// ([`MAX_RETRIES`]) holds and moves to DEAD once it is exhausted. The
    /// budget lives in a dedicated column, so it is deterministic across
    /// process restarts.
    pub fn fail(
        &self,
        event_id: i64,
        consumer_id: &str,
        error: &str,
        retry: bool,
    ) -> Result<EventStatus, MailStoreError> {
        let truncated: String = error.chars().take(4000).collect();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        verify_lease_holder(&tx, event_id, consumer_id)?;

        let retry_count: u32 = tx.query_row(
            "SELECT retry_count FROM events WHERE id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;

        let status = if retry {
            if retry_count < MAX_RETRIES {
                tx.execute(
                    "UPDATE events SET status = 'PENDING', error = ?2,
                            retry_count = retry_count + 1
                     WHERE id = ?1",
                    params![event_id, truncated],
                )?;
                EventStatus::Pending
            } else {
                tx.execute(
                    "UPDATE events SET status = 'DEAD', error = ?2 WHERE id = ?1",
                    params![event_id, truncated],
                )?;
                EventStatus::Dead
            }
        } else {
            tx.execute(
                "UPDATE events SET status = 'FAILED', error = ?2 WHERE id = ?1",
                params![event_id, truncated],
            )?;
            EventStatus::Failed
        };

        tx.execute("DELETE FROM leases WHERE event_id = ?1", params![event_id])?;
        tx.commit()?;
        debug!(event_id, consumer_id, status = %status, "failed event");
        Ok(status)
    }

    /// Manual FAILED → PENDING requeue (operator surface).
    pub fn requeue(
        &self,
        event_id: i64,
        consumer_id: &str,
        error: Option<&str>,
    ) -> Result<(), MailStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        verify_lease_holder(&tx, event_id, consumer_id)?;
        tx.execute(
            "UPDATE events SET status = 'PENDING', error = ?2 WHERE id = ?1",
            params![event_id, error],
        )?;
        tx.execute("DELETE FROM leases WHERE event_id = ?1", params![event_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Fetch one event by id.
    pub fn get_event(&self, event_id: i64) -> Result<Option<Event>, MailStoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT * FROM events WHERE id = ?1",
                params![event_id],
                event_from_row,
            )
            .optional()?)
    }

    /// Events with `id > after_id`, ascending, at most `limit` rows.
    /// Read-only; used by the projection materializer.
    pub fn list_events(&self, after_id: i64, limit: u32) -> Result<Vec<Event>, MailStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM events WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit], event_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Count of events per status.
    pub fn status_counts(
        &self,
    ) -> Result<std::collections::BTreeMap<String, u64>, MailStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM events GROUP BY status ORDER BY status ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // -----------------------------------------------------------------
    // Tool audit
    // -----------------------------------------------------------------

    /// Append one tool-audit row and return its id.
    pub fn record_tool_audit(&self, entry: &NewAuditEntry) -> Result<i64, MailStoreError> {
        let conn = self.lock()?;
        insert_audit(&conn, entry)
    }

    /// Append an audit row and store the execution result on the
    /// idempotency record in the same transaction.
    pub fn record_tool_audit_with_result(
        &self,
        entry: &NewAuditEntry,
        idempotency_key: &str,
        result: &Value,
    ) -> Result<i64, MailStoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE idempotency_keys SET result_json = ?2 WHERE idempotency_key = ?1",
            params![idempotency_key, result.to_string()],
        )?;
        let audit_id = insert_audit(&tx, entry)?;
        tx.commit()?;
        Ok(audit_id)
    }

    /// Tool-audit rows with `id > after_id`, ascending, at most `limit`.
    pub fn list_tool_audit(
        &self,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<AuditEntry>, MailStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, ts, agent_id, action_type, working_dir, idempotency_key,
                    allowed, reason, payload_json, result_json, correlation_id
             FROM tool_audit WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after_id, limit], audit_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // -----------------------------------------------------------------
    // Idempotency
    // -----------------------------------------------------------------

    /// Reserve an idempotency key. Returns `false` when the key is already
    /// taken (the second caller gets no side effects).
    pub fn reserve_idempotency_key(
        &self,
        idempotency_key: &str,
        agent_id: &str,
        action_type: &str,
        event_id: Option<i64>,
    ) -> Result<bool, MailStoreError> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Err(MailStoreError::InvalidInput(
                "idempotency_key must be non-empty".to_string(),
            ));
        }
        let conn = self.lock()?;
        match conn.execute(
            "INSERT INTO idempotency_keys (
                idempotency_key, created_ts, agent_id, action_type, event_id, result_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![key, iso_now(), agent_id, action_type, event_id],
        ) {
            Ok(_) => Ok(true),
            Err(err) if is_constraint_violation(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch an idempotency record by key.
    pub fn get_idempotency_record(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, MailStoreError> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT idempotency_key, created_ts, agent_id, action_type,
                        event_id, result_json
                 FROM idempotency_keys WHERE idempotency_key = ?1",
                params![key],
                |row| {
                    Ok(IdempotencyRecord {
                        idempotency_key: row.get(0)?,
                        created_ts: row.get(1)?,
                        agent_id: row.get(2)?,
                        action_type: row.get(3)?,
                        event_id: row.get(4)?,
                        result: parse_json_column(row.get::<_, Option<String>>(5)?),
                    })
                },
            )
            .optional()?)
    }

    /// Store the cached result for a reserved key.
    pub fn set_idempotency_result(
        &self,
        idempotency_key: &str,
        result: &Value,
    ) -> Result<(), MailStoreError> {
        let key = idempotency_key.trim();
        if key.is_empty() {
            return Ok(());
        }
        let conn = self.lock()?;
        conn.execute(
            "UPDATE idempotency_keys SET result_json = ?2 WHERE idempotency_key = ?1",
            params![key, result.to_string()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Worker heartbeats
    // -----------------------------------------------------------------

    /// Upsert a worker liveness row.
    pub fn record_worker_heartbeat(
        &self,
        agent_id: &str,
        consumer_id: &str,
        pid: u32,
    ) -> Result<(), MailStoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO worker_heartbeats (agent_id, consumer_id, pid, ts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(agent_id) DO UPDATE SET
                consumer_id = excluded.consumer_id,
                pid = excluded.pid,
                ts = excluded.ts",
            params![agent_id, consumer_id, pid, iso_now()],
        )?;
        Ok(())
    }

    /// Latest heartbeat for a worker, if any.
    pub fn get_worker_heartbeat(
        &self,
        agent_id: &str,
    ) -> Result<Option<WorkerHeartbeat>, MailStoreError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT agent_id, consumer_id, pid, ts
                 FROM worker_heartbeats WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(WorkerHeartbeat {
                        agent_id: row.get(0)?,
                        consumer_id: row.get(1)?,
                        pid: row.get(2)?,
                        ts: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }
}

/// A worker liveness row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHeartbeat {
    /// Worker agent id.
    pub agent_id: String,
    /// Consumer id of the worker process instance.
    pub consumer_id: String,
    /// OS pid of the worker process.
    pub pid: u32,
    /// RFC 3339 stamp of the last heartbeat.
    pub ts: String,
}

fn release_expired_leases(conn: &Connection, now_us: i64) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE events SET status = 'PENDING'
         WHERE id IN (SELECT event_id FROM leases WHERE lease_expiry_us <= ?1)
           AND status = 'CLAIMED'",
        params![now_us],
    )?;
    conn.execute(
        "DELETE FROM leases WHERE lease_expiry_us <= ?1",
        params![now_us],
    )?;
    Ok(())
}

fn verify_lease_holder(
    conn: &Connection,
    event_id: i64,
    consumer_id: &str,
) -> Result<(), MailStoreError> {
    let holder: Option<String> = conn
        .query_row(
            "SELECT claimed_by FROM leases WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .optional()?;

    match holder {
        Some(holder) if holder == consumer_id => Ok(()),
        Some(holder) => Err(MailStoreError::LeaseLost {
            event_id,
            holder,
            consumer_id: consumer_id.to_string(),
        }),
        None => Err(MailStoreError::LeaseLost {
            event_id,
            holder: "<none>".to_string(),
            consumer_id: consumer_id.to_string(),
        }),
    }
}

fn insert_audit(conn: &Connection, entry: &NewAuditEntry) -> Result<i64, MailStoreError> {
    conn.execute(
        "INSERT INTO tool_audit (
            ts, agent_id, action_type, working_dir, idempotency_key,
            allowed, reason, payload_json, result_json, correlation_id
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            iso_now(),
            entry.agent_id,
            entry.action_type,
            entry.working_dir,
            entry.idempotency_key,
            i32::from(entry.allowed),
            entry.reason,
            entry.payload.to_string(),
            entry.result.as_ref().map(Value::to_string),
            entry.correlation_id,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn event_from_row(row: &Row<'_>) -> Result<Event, rusqlite::Error> {
    let payload_raw: String = row.get("payload_json")?;
    let payload =
        serde_json::from_str(&payload_raw).unwrap_or(Value::Object(serde_json::Map::new()));
    let status_raw: String = row.get("status")?;

    Ok(Event {
        id: row.get("id")?,
        ts: row.get("ts")?,
        event_type: row.get("type")?,
        origin_id: row.get("origin_id")?,
        target_agent: row.get("target_agent")?,
        payload,
        justification: row.get("justification")?,
        status: EventStatus::parse(&status_raw).unwrap_or(EventStatus::Pending),
        error: row.get("error")?,
        correlation_id: row.get("correlation_id")?,
        retry_count: row.get("retry_count")?,
    })
}

fn audit_from_row(row: &Row<'_>) -> Result<AuditEntry, rusqlite::Error> {
    let payload_raw: String = row.get(8)?;
    let payload =
        serde_json::from_str(&payload_raw).unwrap_or(Value::Object(serde_json::Map::new()));

    Ok(AuditEntry {
        id: row.get(0)?,
        ts: row.get(1)?,
        agent_id: row.get(2)?,
        action_type: row.get(3)?,
        working_dir: row.get(4)?,
        idempotency_key: row.get(5)?,
        allowed: row.get::<_, i32>(6)? != 0,
        reason: row.get(7)?,
        payload,
        result: parse_json_column(row.get::<_, Option<String>>(9)?),
        correlation_id: row.get(10)?,
    })
}

fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.as_deref()
        .filter(|s| !s.trim().is_empty())
        .and_then(|s| serde_json::from_str(s).ok())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(info, _)
            if info.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
