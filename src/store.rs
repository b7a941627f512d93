//! # Session Store
//!
//! Durable repository for tracking sessions and their point sequences.
//!
//! ## Guarantees
//!
//! - **Single open session**: at most one session with `end_time IS NULL`.
//!   `open_or_create_session` checks and creates inside one IMMEDIATE
//!   transaction, and a partial unique index backs it at the schema level.
//! - **Atomic appends**: inserting a point and bumping the owning session's
//!   cached `point_count` commit together.
//! - **Cascading deletes**: deleting a session deletes its points.
//! - **Reactive reads**: `get_all_sessions` yields a fresh snapshot after
//!   every committed mutation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rusqlite_migration::{Migrations, M};
use tokio::sync::watch;

use crate::{LocationPoint, Session, SessionWithPoints, StoreError, StoreResult};

// ============================================================================
// Store Contract
// ============================================================================

/// Durable session storage used by the tracking task (writes) and the UI (reads).
///
/// Every operation returns a typed [`StoreResult`] so callers can skip and
/// continue on failure.
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails with `OpenSessionExists` if `session` is
    /// open and another open session is already stored.
    fn create_session(&self, session: &Session) -> StoreResult<Session>;

    /// Update start/end times of an existing session. The cached point count
    /// is owned by the store and is not taken from `session`.
    fn update_session(&self, session: &Session) -> StoreResult<()>;

    /// The currently open session, if any.
    fn get_active_session(&self) -> StoreResult<Option<Session>>;

    /// Return the open session, creating one at `start_time` if none is open.
    /// The boolean is true when a new session was created.
    fn open_or_create_session(&self, start_time: i64) -> StoreResult<(Session, bool)>;

    /// Close the open session at `end_time`. Returns the closed session, or
    /// None if nothing was open.
    fn close_active_session(&self, end_time: i64) -> StoreResult<Option<Session>>;

    /// Append a point to an open session.
    fn add_location_to_session(&self, session_id: i64, point: &LocationPoint) -> StoreResult<()>;

    fn get_session(&self, session_id: i64) -> StoreResult<Option<SessionWithPoints>>;

    /// All sessions (most recent first) with their points, as a stream that
    /// yields immediately and again after every change.
    fn get_all_sessions(&self) -> BoxStream<'static, StoreResult<Vec<SessionWithPoints>>>;

    /// One-shot read of what `get_all_sessions` streams.
    fn sessions_snapshot(&self) -> StoreResult<Vec<SessionWithPoints>>;

    /// Delete one session and its points. Returns false if it did not exist.
    fn delete_session(&self, session_id: i64) -> StoreResult<bool>;

    fn delete_all_sessions(&self) -> StoreResult<()>;
}

// ============================================================================
// Schema
// ============================================================================

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            r#"
            CREATE TABLE sessions (
                id INTEGER PRIMARY KEY,
                start_time INTEGER NOT NULL,
                end_time INTEGER,
                point_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE location_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                accuracy REAL,
                altitude REAL,
                speed REAL,
                bearing REAL,
                address TEXT,
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_points_session_time ON location_points(session_id, timestamp);
            CREATE INDEX idx_sessions_start ON sessions(start_time);
            "#,
        ),
        // At most one open session, enforced by the database itself
        M::up(
            "CREATE UNIQUE INDEX idx_sessions_single_open
                ON sessions((end_time IS NULL)) WHERE end_time IS NULL;",
        ),
    ])
}

const SESSION_COLUMNS: &str = "id, start_time, end_time, point_count";

const POINT_COLUMNS: &str =
    "session_id, latitude, longitude, timestamp, accuracy, altitude, speed, bearing, address";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        start_time: row.get(1)?,
        end_time: row.get(2)?,
        point_count: row.get(3)?,
    })
}

fn point_from_row(row: &Row<'_>) -> rusqlite::Result<LocationPoint> {
    Ok(LocationPoint {
        session_id: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        timestamp: row.get(3)?,
        accuracy: row.get(4)?,
        altitude: row.get(5)?,
        speed: row.get(6)?,
        bearing: row.get(7)?,
        address: row.get(8)?,
    })
}

fn query_active(conn: &Connection) -> StoreResult<Option<Session>> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE end_time IS NULL LIMIT 1"),
            [],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

fn query_session(conn: &Connection, session_id: i64) -> StoreResult<Option<Session>> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            [session_id],
            session_from_row,
        )
        .optional()?;
    Ok(session)
}

fn query_points(conn: &Connection, session_id: i64) -> StoreResult<Vec<LocationPoint>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {POINT_COLUMNS} FROM location_points
         WHERE session_id = ?1 ORDER BY timestamp ASC, id ASC"
    ))?;
    let points = stmt
        .query_map([session_id], point_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(points)
}

// ============================================================================
// SQLite Store
// ============================================================================

struct Inner {
    conn: Mutex<Connection>,
    /// Bumped after every committed mutation; feeds reactive readers.
    changes: watch::Sender<u64>,
}

/// SQLite-backed [`SessionStore`]. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct SqliteSessionStore {
    inner: Arc<Inner>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `db_path` and migrate it to the latest schema.
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        Self::new(":memory:")
    }

    fn from_connection(mut conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        // Must be set per connection and outside any transaction
        conn.pragma_update(None, "foreign_keys", true)?;
        migrations().to_latest(&mut conn)?;

        let (changes, _) = watch::channel(0);
        info!("[SessionStore] Opened session database");

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                changes,
            }),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        Ok(self.inner.conn.lock()?)
    }

    fn notify_changed(&self) {
        self.inner.changes.send_modify(|version| *version += 1);
    }
}

impl SessionStore for SqliteSessionStore {
    fn create_session(&self, session: &Session) -> StoreResult<Session> {
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if session.is_open() {
                if let Some(open) = query_active(&tx)? {
                    return Err(StoreError::OpenSessionExists(open.session_id));
                }
            }

            tx.execute(
                "INSERT INTO sessions (id, start_time, end_time, point_count) VALUES (?1, ?2, ?3, 0)",
                params![session.session_id, session.start_time, session.end_time],
            )?;
            tx.commit()?;
        }
        self.notify_changed();

        debug!("[SessionStore] Created session {}", session.session_id);
        Ok(Session {
            point_count: 0,
            ..*session
        })
    }

    fn update_session(&self, session: &Session) -> StoreResult<()> {
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if query_session(&tx, session.session_id)?.is_none() {
                return Err(StoreError::SessionNotFound(session.session_id));
            }
            if session.is_open() {
                if let Some(open) = query_active(&tx)? {
                    if open.session_id != session.session_id {
                        return Err(StoreError::OpenSessionExists(open.session_id));
                    }
                }
            }

            tx.execute(
                "UPDATE sessions SET start_time = ?1, end_time = ?2 WHERE id = ?3",
                params![session.start_time, session.end_time, session.session_id],
            )?;
            tx.commit()?;
        }
        self.notify_changed();
        Ok(())
    }

    fn get_active_session(&self) -> StoreResult<Option<Session>> {
        let conn = self.conn()?;
        query_active(&conn)
    }

    fn open_or_create_session(&self, start_time: i64) -> StoreResult<(Session, bool)> {
        let session = {
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(open) = query_active(&tx)? {
                return Ok((open, false));
            }

            // Ids derive from creation time but must stay unique and increasing
            let max_id: Option<i64> =
                tx.query_row("SELECT MAX(id) FROM sessions", [], |row| row.get(0))?;
            let session_id = match max_id {
                Some(max) if max >= start_time => max + 1,
                _ => start_time,
            };

            tx.execute(
                "INSERT INTO sessions (id, start_time, end_time, point_count) VALUES (?1, ?2, NULL, 0)",
                params![session_id, start_time],
            )?;
            tx.commit()?;
            Session::open(session_id, start_time)
        };
        self.notify_changed();

        info!("[SessionStore] Opened new session {}", session.session_id);
        Ok((session, true))
    }

    fn close_active_session(&self, end_time: i64) -> StoreResult<Option<Session>> {
        let closed = {
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let Some(open) = query_active(&tx)? else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE sessions SET end_time = ?1 WHERE id = ?2",
                params![end_time, open.session_id],
            )?;
            tx.commit()?;
            open.closed_at(end_time)
        };
        self.notify_changed();

        info!(
            "[SessionStore] Closed session {} with {} points",
            closed.session_id, closed.point_count
        );
        Ok(Some(closed))
    }

    fn add_location_to_session(&self, session_id: i64, point: &LocationPoint) -> StoreResult<()> {
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            match query_session(&tx, session_id)? {
                None => return Err(StoreError::SessionNotFound(session_id)),
                Some(session) if !session.is_open() => {
                    return Err(StoreError::SessionClosed(session_id));
                }
                Some(_) => {}
            }

            tx.execute(
                &format!(
                    "INSERT INTO location_points ({POINT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    session_id,
                    point.latitude,
                    point.longitude,
                    point.timestamp,
                    point.accuracy,
                    point.altitude,
                    point.speed,
                    point.bearing,
                    point.address,
                ],
            )?;
            tx.execute(
                "UPDATE sessions SET point_count = point_count + 1 WHERE id = ?1",
                [session_id],
            )?;
            tx.commit()?;
        }
        self.notify_changed();
        Ok(())
    }

    fn get_session(&self, session_id: i64) -> StoreResult<Option<SessionWithPoints>> {
        let conn = self.conn()?;
        let Some(session) = query_session(&conn, session_id)? else {
            return Ok(None);
        };
        let points = query_points(&conn, session_id)?;
        Ok(Some(SessionWithPoints { session, points }))
    }

    fn get_all_sessions(&self) -> BoxStream<'static, StoreResult<Vec<SessionWithPoints>>> {
        let store = self.clone();
        let changes = self.inner.changes.subscribe();

        stream::unfold(
            (store, changes, true),
            |(store, mut changes, first)| async move {
                if !first && changes.changed().await.is_err() {
                    return None;
                }
                let snapshot = store.sessions_snapshot();
                Some((snapshot, (store, changes, false)))
            },
        )
        .boxed()
    }

    fn sessions_snapshot(&self) -> StoreResult<Vec<SessionWithPoints>> {
        let conn = self.conn()?;
        let sessions = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY start_time DESC, id DESC"
            ))?;
            let rows = stmt
                .query_map([], session_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        sessions
            .into_iter()
            .map(|session| {
                let points = query_points(&conn, session.session_id)?;
                Ok(SessionWithPoints { session, points })
            })
            .collect()
    }

    fn delete_session(&self, session_id: i64) -> StoreResult<bool> {
        let deleted = {
            let conn = self.conn()?;
            conn.execute("DELETE FROM sessions WHERE id = ?1", [session_id])? > 0
        };
        if deleted {
            self.notify_changed();
            info!("[SessionStore] Deleted session {}", session_id);
        }
        Ok(deleted)
    }

    fn delete_all_sessions(&self) -> StoreResult<()> {
        let removed = {
            let conn = self.conn()?;
            conn.execute("DELETE FROM sessions", [])?
        };
        self.notify_changed();
        info!("[SessionStore] Deleted all sessions ({})", removed);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
