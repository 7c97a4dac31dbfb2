use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::backoff::Backoff;
use crate::error::QueueError;
use crate::store::{check_dependency, QueueStore};
use crate::types::{Lease, LeaseToken, QueueItem, QueueKey, QueueStatus};

/// How long a writer waits for another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_items (
    queue       TEXT    NOT NULL,
    scope       TEXT    NOT NULL,
    kind        TEXT    NOT NULL,
    payload     BLOB    NOT NULL,
    run_count   INTEGER NOT NULL DEFAULT 0,
    next_run_at INTEGER NOT NULL,
    last_run_at INTEGER,
    lease_token BLOB,
    created_at  INTEGER NOT NULL,
    seq         INTEGER NOT NULL,
    dep_scope   TEXT,
    dep_kind    TEXT,
    UNIQUE (queue, scope, kind)
);
CREATE INDEX IF NOT EXISTS queue_items_due
    ON queue_items (queue, lease_token, next_run_at);
CREATE INDEX IF NOT EXISTS queue_items_fifo
    ON queue_items (queue, created_at, seq);
";

const SELECT_COLUMNS: &str = "scope, kind, payload, run_count, next_run_at, last_run_at, \
     lease_token, created_at, dep_scope, dep_kind";

/// Durable store on a single SQLite file.
///
/// Each instance owns one connection. Several instances (threads or
/// processes) may open the same file: `pop` claims rows inside an
/// `IMMEDIATE` transaction with a conditional update, so two connections
/// never lease the same item.
pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
}

impl SqliteQueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        add_dependency_columns(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Files created before items could depend on each other lack the columns.
fn add_dependency_columns(conn: &Connection) -> Result<(), QueueError> {
    let has_column: bool = conn
        .prepare("SELECT COUNT(*) FROM pragma_table_info('queue_items') WHERE name = 'dep_scope'")?
        .query_row([], |row| row.get::<_, i64>(0))?
        > 0;
    if !has_column {
        conn.execute_batch(
            "ALTER TABLE queue_items ADD COLUMN dep_scope TEXT;
             ALTER TABLE queue_items ADD COLUMN dep_kind TEXT;",
        )?;
    }
    Ok(())
}

// ── Column conversions ──────────────────────────────────────────────

fn to_sql_time(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_time(value: i64) -> Result<u64, QueueError> {
    u64::try_from(value).map_err(|_| QueueError::Corrupted {
        reason: format!("negative timestamp {value}"),
    })
}

fn to_sql_count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Raw row as stored; converted to [`QueueItem`] outside the rusqlite closure.
struct RawItem {
    scope: String,
    kind: String,
    payload: Vec<u8>,
    run_count: i64,
    next_run_at: i64,
    last_run_at: Option<i64>,
    lease_token: Option<Vec<u8>>,
    created_at: i64,
    dep_scope: Option<String>,
    dep_kind: Option<String>,
}

impl RawItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            scope: row.get(0)?,
            kind: row.get(1)?,
            payload: row.get(2)?,
            run_count: row.get(3)?,
            next_run_at: row.get(4)?,
            last_run_at: row.get(5)?,
            lease_token: row.get(6)?,
            created_at: row.get(7)?,
            dep_scope: row.get(8)?,
            dep_kind: row.get(9)?,
        })
    }

    fn into_item(self) -> Result<QueueItem, QueueError> {
        let lease = match self.lease_token {
            Some(bytes) => Some(LeaseToken::from_slice(&bytes).ok_or_else(|| {
                QueueError::Corrupted {
                    reason: format!("lease token of {} bytes", bytes.len()),
                }
            })?),
            None => None,
        };
        let depends_on = match (self.dep_scope, self.dep_kind) {
            (Some(scope), Some(kind)) => Some(QueueKey::new(scope, kind)?),
            (None, None) => None,
            _ => {
                return Err(QueueError::Corrupted {
                    reason: "half of a dependency key is missing".into(),
                })
            }
        };
        Ok(QueueItem {
            key: QueueKey::new(self.scope, self.kind)?,
            payload: self.payload,
            run_count: u32::try_from(self.run_count).unwrap_or(u32::MAX),
            next_run_at: from_sql_time(self.next_run_at)?,
            last_run_at: self.last_run_at.map(from_sql_time).transpose()?,
            lease,
            created_at: from_sql_time(self.created_at)?,
            depends_on,
        })
    }
}

impl QueueStore for SqliteQueueStore {
    fn upsert(
        &self,
        queue: &str,
        key: &QueueKey,
        payload: &[u8],
        depends_on: Option<&QueueKey>,
        now: u64,
    ) -> Result<(), QueueError> {
        check_dependency(key, depends_on)?;
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seq: i64 = tx
            .prepare_cached("SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_items")?
            .query_row([], |row| row.get(0))?;
        tx.prepare_cached(
            "INSERT INTO queue_items
                 (queue, scope, kind, payload, run_count, next_run_at, last_run_at,
                  lease_token, created_at, seq, dep_scope, dep_kind)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, NULL, NULL, ?5, ?6, ?7, ?8)
             ON CONFLICT (queue, scope, kind) DO UPDATE SET
                 payload = excluded.payload,
                 run_count = 0,
                 next_run_at = excluded.next_run_at,
                 last_run_at = NULL,
                 lease_token = NULL,
                 created_at = excluded.created_at,
                 seq = excluded.seq,
                 dep_scope = excluded.dep_scope,
                 dep_kind = excluded.dep_kind",
        )?
        .execute(params![
            queue,
            key.scope(),
            key.kind(),
            payload,
            to_sql_time(now),
            seq,
            depends_on.map(QueueKey::scope),
            depends_on.map(QueueKey::kind),
        ])?;
        tx.commit()?;
        Ok(())
    }

    fn pop(
        &self,
        queue: &str,
        max: usize,
        now: u64,
        backoff: &Backoff,
    ) -> Result<Lease, QueueError> {
        if max == 0 {
            return Ok(Lease::empty());
        }
        let token = LeaseToken::generate();
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates = {
            let mut stmt = tx.prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM queue_items AS q
                 WHERE queue = ?1 AND lease_token IS NULL AND next_run_at <= ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM queue_items AS d
                       WHERE d.queue = q.queue AND d.scope = q.dep_scope AND d.kind = q.dep_kind
                   )
                 ORDER BY created_at, seq
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![queue, to_sql_time(now), to_sql_count(max)],
                RawItem::from_row,
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut items = Vec::with_capacity(candidates.len());
        {
            let mut claim = tx.prepare_cached(
                "UPDATE queue_items
                 SET lease_token = ?1, run_count = ?2, last_run_at = ?3, next_run_at = ?4
                 WHERE queue = ?5 AND scope = ?6 AND kind = ?7 AND lease_token IS NULL",
            )?;
            for raw in candidates {
                let mut item = raw.into_item()?;
                item.run_count = item.run_count.saturating_add(1);
                item.last_run_at = Some(now);
                item.next_run_at = now.saturating_add(backoff.delay_ms(item.run_count));
                item.lease = Some(token);

                let claimed = claim.execute(params![
                    token.as_bytes().as_slice(),
                    i64::from(item.run_count),
                    to_sql_time(now),
                    to_sql_time(item.next_run_at),
                    queue,
                    item.key.scope(),
                    item.key.kind(),
                ])?;
                if claimed == 1 {
                    items.push(item);
                }
            }
        }
        tx.commit()?;
        Ok(Lease { token, items })
    }

    fn commit(
        &self,
        queue: &str,
        token: &LeaseToken,
        keys: &[QueueKey],
    ) -> Result<usize, QueueError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM queue_items
                 WHERE queue = ?1 AND scope = ?2 AND kind = ?3 AND lease_token = ?4",
            )?;
            for key in keys {
                removed += stmt.execute(params![
                    queue,
                    key.scope(),
                    key.kind(),
                    token.as_bytes().as_slice()
                ])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn cancel(
        &self,
        queue: &str,
        token: &LeaseToken,
        keys: &[QueueKey],
    ) -> Result<usize, QueueError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut released = 0;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE queue_items SET lease_token = NULL
                 WHERE queue = ?1 AND scope = ?2 AND kind = ?3 AND lease_token = ?4",
            )?;
            for key in keys {
                released += stmt.execute(params![
                    queue,
                    key.scope(),
                    key.kind(),
                    token.as_bytes().as_slice()
                ])?;
            }
        }
        tx.commit()?;
        Ok(released)
    }

    fn recover_dead(&self, queue: &str, older_than: u64) -> Result<usize, QueueError> {
        let conn = self.conn.lock()?;
        let recovered = conn
            .prepare_cached(
                "UPDATE queue_items
                 SET lease_token = NULL, next_run_at = COALESCE(last_run_at, next_run_at)
                 WHERE queue = ?1 AND lease_token IS NOT NULL AND last_run_at < ?2",
            )?
            .execute(params![queue, to_sql_time(older_than)])?;
        Ok(recovered)
    }

    fn get(&self, queue: &str, key: &QueueKey) -> Result<Option<QueueItem>, QueueError> {
        let conn = self.conn.lock()?;
        let raw = conn
            .prepare_cached(&format!(
                "SELECT {SELECT_COLUMNS} FROM queue_items
                 WHERE queue = ?1 AND scope = ?2 AND kind = ?3"
            ))?
            .query_row(params![queue, key.scope(), key.kind()], RawItem::from_row)
            .optional()?;
        raw.map(RawItem::into_item).transpose()
    }

    fn status(&self, queue: &str) -> Result<QueueStatus, QueueError> {
        let conn = self.conn.lock()?;
        let (total, leased, next): (i64, Option<i64>, Option<i64>) = conn
            .prepare_cached(
                "SELECT COUNT(*),
                        SUM(CASE WHEN lease_token IS NOT NULL THEN 1 ELSE 0 END),
                        MIN(CASE WHEN lease_token IS NULL THEN next_run_at END)
                 FROM queue_items WHERE queue = ?1",
            )?
            .query_row(params![queue], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        Ok(QueueStatus {
            total: usize::try_from(total).unwrap_or(0),
            leased: usize::try_from(leased.unwrap_or(0)).unwrap_or(0),
            next_run_at: next.map(from_sql_time).transpose()?,
        })
    }
}
