use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use core_model::{
    Change, ChangeKind, Checklist, DocumentBackend, ITEM_ID_LEN, Item, WriteBatch, WriteOp,
    deterministic_id,
};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

const CHANGE_FEED_CAPACITY: usize = 256;
/// Change log rows kept behind the newest one.
const CHANGE_LOG_RETAIN: i64 = 10_000;

/// Checklist documents and their item sub-collections in one SQLite file.
///
/// Each commit appends its changes to a `change_log` table inside the same
/// transaction. The backend publishes log rows past its cursor on
/// [`DocumentBackend::subscribe`]: its own right after committing, and those of
/// other connections to the same file whenever the log is polled, see
/// [`SqliteBackend::watch_external_changes`].
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<Change>,
    // highest change_log seq already published; only moved under the conn lock
    cursor: AtomicI64,
    id_seq: AtomicU64,
}

impl SqliteBackend {
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("checklist")
            .join("checklist.db")
    }

    pub fn open_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent dir for {}", path.display()))?;
        }
        Self::open(path)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening sqlite db {}", path.as_ref().display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
            cursor: AtomicI64::new(0),
            id_seq: AtomicU64::new(0),
        })
    }

    /// Creates missing tables and starts the change cursor at the current end of
    /// the log, so history written before this point is not replayed.
    pub fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checklists (
              id TEXT PRIMARY KEY,
              title TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS items (
              checklist_id TEXT NOT NULL,
              id TEXT NOT NULL,
              text TEXT NOT NULL,
              completed INTEGER NOT NULL DEFAULT 0,
              ord INTEGER NOT NULL,
              created_at TEXT NOT NULL,
              PRIMARY KEY (checklist_id, id)
            );
            CREATE INDEX IF NOT EXISTS items_by_order ON items (checklist_id, ord DESC);
            CREATE TABLE IF NOT EXISTS change_log (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              checklist_id TEXT NOT NULL,
              kind TEXT NOT NULL
            );
            "#,
        )?;
        let head: i64 =
            conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM change_log", [], |r| r.get(0))?;
        self.cursor.store(head, Ordering::Release);
        Ok(())
    }

    /// Publishes every change-log row past the cursor, whichever connection
    /// wrote it, and returns how many were published.
    pub fn poll_changes(&self) -> anyhow::Result<usize> {
        let conn = self.lock()?;
        let cursor = self.cursor.load(Ordering::Acquire);
        let mut stmt = conn.prepare_cached(
            "SELECT seq, checklist_id, kind FROM change_log WHERE seq > ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![cursor], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("reading change log")?;
        let mut published = 0;
        for (seq, checklist_id, kind) in rows {
            self.cursor.store(seq, Ordering::Release);
            let Some(kind) = ChangeKind::parse(&kind) else {
                warn!(seq, kind = %kind, "unknown change kind in log");
                continue;
            };
            // No live subscribers is not an error.
            let _ = self.changes.send(Change { checklist_id, kind });
            published += 1;
        }
        Ok(published)
    }

    /// Polls the change log every `every` so commits made by other
    /// connections reach this backend's subscribers. The task stops once the
    /// backend is dropped.
    pub fn watch_external_changes(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let backend = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(backend) = backend.upgrade() else {
                    return;
                };
                match tokio::task::spawn_blocking(move || backend.poll_changes()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => debug!(changes = n, "picked up changes from the log"),
                    Ok(Err(err)) => warn!(error = %format!("{err:#}"), "change log poll failed"),
                    Err(err) => warn!(error = %err, "change log poll task failed"),
                }
            }
        })
    }

    pub fn integrity_check(&self) -> anyhow::Result<String> {
        self.lock()?
            .query_row("PRAGMA integrity_check;", [], |r| r.get(0))
            .map_err(Into::into)
    }

    pub fn checklist_count(&self) -> anyhow::Result<i64> {
        self.lock()?
            .query_row("SELECT COUNT(*) FROM checklists", [], |r| r.get(0))
            .map_err(Into::into)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))
    }
}

impl DocumentBackend for SqliteBackend {
    fn get_checklist(&self, id: &str) -> anyhow::Result<Option<Checklist>> {
        self.lock()?
            .query_row(
                "SELECT id, title, created_at, updated_at FROM checklists WHERE id = ?1",
                params![id],
                |r| {
                    Ok(Checklist {
                        id: r.get(0)?,
                        title: r.get(1)?,
                        created_at: parse_ts(2, r.get(2)?)?,
                        updated_at: parse_ts(3, r.get(3)?)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("reading checklist {id}"))
    }

    fn list_items(&self, checklist_id: &str) -> anyhow::Result<Vec<Item>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, text, completed, ord, created_at FROM items WHERE checklist_id = ?1 ORDER BY ord DESC, created_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![checklist_id], |r| {
            Ok(Item {
                id: r.get(0)?,
                text: r.get(1)?,
                completed: r.get::<_, i64>(2)? != 0,
                order: r.get(3)?,
                created_at: parse_ts(4, r.get(4)?)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("reading items of {checklist_id}"))
    }

    fn max_item_order(&self, checklist_id: &str) -> anyhow::Result<Option<i64>> {
        self.lock()?
            .query_row(
                "SELECT MAX(ord) FROM items WHERE checklist_id = ?1",
                params![checklist_id],
                |r| r.get(0),
            )
            .map_err(Into::into)
    }

    fn completed_item_ids(&self, checklist_id: &str) -> anyhow::Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM items WHERE checklist_id = ?1 AND completed = 1 ORDER BY ord DESC",
        )?;
        let rows = stmt.query_map(params![checklist_id], |r| r.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    fn allocate_item_id(&self, checklist_id: &str) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let nonce: u64 = rand::random();
        let mut id = deterministic_id(&[
            checklist_id,
            &seq.to_string(),
            &nanos.to_string(),
            &nonce.to_string(),
        ]);
        id.truncate(ITEM_ID_LEN);
        id
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let changes = batch.changes();
        {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            for op in batch.ops() {
                apply_op(&tx, op)?;
            }
            append_changes(&tx, &changes)?;
            tx.commit()?;
        }
        debug!(ops = batch.len(), changes = changes.len(), "batch committed");
        // the write is durable; a failed publish only delays listeners until the next poll
        if let Err(err) = self.poll_changes() {
            warn!(error = %format!("{err:#}"), "publishing committed changes failed");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }
}

fn apply_op(tx: &Transaction<'_>, op: &WriteOp) -> anyhow::Result<()> {
    match op {
        WriteOp::SetChecklist(c) => {
            tx.execute(
                r#"INSERT INTO checklists (id, title, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                  title=excluded.title,
                  created_at=excluded.created_at,
                  updated_at=excluded.updated_at"#,
                params![c.id, c.title, fmt_ts(c.created_at), fmt_ts(c.updated_at)],
            )?;
        }
        WriteOp::UpdateChecklist {
            id,
            title,
            updated_at,
        } => {
            let changed = tx.execute(
                "UPDATE checklists SET title = COALESCE(?2, title), updated_at = ?3 WHERE id = ?1",
                params![id, title, fmt_ts(*updated_at)],
            )?;
            if changed == 0 {
                anyhow::bail!("checklist {id} does not exist");
            }
        }
        WriteOp::CreateItem { checklist_id, item } => {
            tx.execute(
                "INSERT INTO items (checklist_id, id, text, completed, ord, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    checklist_id,
                    item.id,
                    item.text,
                    item.completed,
                    item.order,
                    fmt_ts(item.created_at)
                ],
            )
            .with_context(|| format!("creating item {} in {checklist_id}", item.id))?;
        }
        WriteOp::UpdateItem {
            checklist_id,
            item_id,
            patch,
        } => {
            let changed = tx.execute(
                "UPDATE items SET text = COALESCE(?3, text), completed = COALESCE(?4, completed) WHERE checklist_id = ?1 AND id = ?2",
                params![checklist_id, item_id, patch.text, patch.completed],
            )?;
            if changed == 0 {
                anyhow::bail!("item {item_id} does not exist in checklist {checklist_id}");
            }
        }
        WriteOp::DeleteItem {
            checklist_id,
            item_id,
        } => {
            tx.execute(
                "DELETE FROM items WHERE checklist_id = ?1 AND id = ?2",
                params![checklist_id, item_id],
            )?;
        }
    }
    Ok(())
}

fn append_changes(tx: &Transaction<'_>, changes: &[Change]) -> anyhow::Result<()> {
    let mut stmt =
        tx.prepare_cached("INSERT INTO change_log (checklist_id, kind) VALUES (?1, ?2)")?;
    for change in changes {
        stmt.execute(params![change.checklist_id, change.kind.as_str()])?;
    }
    tx.execute(
        "DELETE FROM change_log WHERE seq <= last_insert_rowid() - ?1",
        params![CHANGE_LOG_RETAIN],
    )?;
    Ok(())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use core_model::ItemPatch;

    fn backend() -> SqliteBackend {
        let backend = SqliteBackend::open(":memory:").unwrap();
        backend.init_schema().unwrap();
        backend
    }

    fn checklist(id: &str, at: DateTime<Utc>) -> Checklist {
        Checklist {
            id: id.to_string(),
            title: "Groceries".to_string(),
            created_at: at,
            updated_at: at,
        }
    }

    fn item(id: &str, order: i64, completed: bool, at: DateTime<Utc>) -> Item {
        Item {
            id: id.to_string(),
            text: format!("text {id}"),
            completed,
            order,
            created_at: at,
        }
    }

    fn seed(backend: &SqliteBackend, id: &str, items: Vec<Item>) {
        let now = Utc::now();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::SetChecklist(checklist(id, now)));
        for item in items {
            batch.push(WriteOp::CreateItem {
                checklist_id: id.to_string(),
                item,
            });
        }
        backend.commit(batch).unwrap();
    }

    #[test]
    fn schema_and_integrity() {
        let backend = backend();
        assert_eq!(backend.integrity_check().unwrap(), "ok");
        backend.init_schema().expect("schema init is idempotent");
        backend.commit(WriteBatch::new()).expect("empty batch is fine");
    }

    #[test]
    fn set_and_get_checklist() {
        let backend = backend();
        assert!(backend.get_checklist("c1").unwrap().is_none());
        let now = Utc::now();
        seed(&backend, "c1", vec![]);
        let got = backend.get_checklist("c1").unwrap().expect("present");
        assert_eq!(got.title, "Groceries");
        assert!(got.created_at <= Utc::now());
        assert!(got.created_at >= now - ChronoDuration::seconds(5));
        assert_eq!(backend.checklist_count().unwrap(), 1);
    }

    #[test]
    fn timestamps_keep_nanosecond_precision() {
        let backend = backend();
        let at = Utc::now();
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::SetChecklist(checklist("c1", at)));
        backend.commit(batch).unwrap();
        let got = backend.get_checklist("c1").unwrap().unwrap();
        assert_eq!(got.created_at, at);
    }

    #[test]
    fn update_of_missing_checklist_fails() {
        let backend = backend();
        let mut batch = WriteBatch::new();
        batch.touch_checklist("ghost", Utc::now());
        let err = backend.commit(batch).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn update_item_applies_only_given_fields() {
        let backend = backend();
        let now = Utc::now();
        seed(&backend, "c1", vec![item("i1", 0, false, now)]);
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::UpdateItem {
            checklist_id: "c1".into(),
            item_id: "i1".into(),
            patch: ItemPatch::completed(true),
        });
        backend.commit(batch).unwrap();
        let items = backend.list_items("c1").unwrap();
        assert!(items[0].completed);
        assert_eq!(items[0].text, "text i1");

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::UpdateItem {
            checklist_id: "c1".into(),
            item_id: "missing".into(),
            patch: ItemPatch::text("x"),
        });
        assert!(backend.commit(batch).is_err());
    }

    #[test]
    fn failed_batch_rolls_back_every_write() {
        let backend = backend();
        let now = Utc::now();
        seed(
            &backend,
            "c1",
            vec![item("i1", 0, true, now), item("i2", 1, true, now)],
        );
        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::DeleteItem {
                checklist_id: "c1".into(),
                item_id: "i1".into(),
            })
            .push(WriteOp::DeleteItem {
                checklist_id: "c1".into(),
                item_id: "i2".into(),
            })
            .touch_checklist("ghost", now);
        assert!(backend.commit(batch).is_err());
        assert_eq!(backend.list_items("c1").unwrap().len(), 2);
    }

    #[test]
    fn items_sorted_newest_first_with_ties() {
        let backend = backend();
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::milliseconds(1);
        seed(
            &backend,
            "c1",
            vec![
                item("a", 0, false, t0),
                item("b", 1, false, t0),
                item("c", 1, false, t1),
                item("d", 2, false, t0),
            ],
        );
        let ids: Vec<String> = backend
            .list_items("c1")
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["d", "c", "b", "a"]);
        assert_eq!(backend.max_item_order("c1").unwrap(), Some(2));
        assert_eq!(backend.max_item_order("empty").unwrap(), None);
    }

    #[test]
    fn completed_ids_are_scoped_to_checklist() {
        let backend = backend();
        let now = Utc::now();
        seed(
            &backend,
            "c1",
            vec![item("i1", 0, true, now), item("i2", 1, false, now)],
        );
        seed(&backend, "c2", vec![item("i1", 0, true, now)]);
        assert_eq!(backend.completed_item_ids("c1").unwrap(), vec!["i1"]);
        assert_eq!(backend.completed_item_ids("c2").unwrap(), vec!["i1"]);
    }

    #[test]
    fn commit_publishes_changes_and_failures_do_not() {
        let backend = backend();
        let mut rx = backend.subscribe();
        seed(&backend, "c1", vec![item("i1", 0, false, Utc::now())]);
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.kind, ChangeKind::Checklist);
        assert_eq!(second.kind, ChangeKind::Items);
        assert_eq!(second.checklist_id, "c1");

        let mut batch = WriteBatch::new();
        batch.touch_checklist("ghost", Utc::now());
        let _ = backend.commit(batch);
        assert!(rx.try_recv().is_err());
    }

    fn shared_file() -> (tempfile::TempDir, SqliteBackend, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checklist.db");
        let alice = SqliteBackend::open(&path).unwrap();
        alice.init_schema().unwrap();
        let bob = SqliteBackend::open(&path).unwrap();
        bob.init_schema().unwrap();
        (dir, alice, bob)
    }

    #[test]
    fn commits_from_another_connection_are_polled() {
        let (_dir, alice, bob) = shared_file();
        let mut rx = alice.subscribe();
        seed(&bob, "shared", vec![item("i1", 0, false, Utc::now())]);
        assert!(rx.try_recv().is_err());

        assert_eq!(alice.poll_changes().unwrap(), 2);
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.checklist_id, "shared");
        assert_eq!(first.kind, ChangeKind::Checklist);
        assert_eq!(second.kind, ChangeKind::Items);

        // already published rows are not sent twice
        assert_eq!(alice.poll_changes().unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn own_commit_also_publishes_pending_foreign_changes() {
        let (_dir, alice, bob) = shared_file();
        let mut rx = alice.subscribe();
        seed(&bob, "from-bob", vec![]);
        seed(&alice, "from-alice", vec![]);
        let ids: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|c| c.checklist_id)
            .collect();
        assert_eq!(ids, vec!["from-bob", "from-alice"]);
    }

    #[test]
    fn history_before_init_is_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checklist.db");
        {
            let writer = SqliteBackend::open(&path).unwrap();
            writer.init_schema().unwrap();
            seed(&writer, "old", vec![]);
        }
        let reader = SqliteBackend::open(&path).unwrap();
        reader.init_schema().unwrap();
        assert_eq!(reader.poll_changes().unwrap(), 0);
    }

    #[tokio::test]
    async fn watcher_delivers_changes_from_another_connection() {
        let (_dir, alice, bob) = shared_file();
        let alice = Arc::new(alice);
        let watcher = alice.watch_external_changes(Duration::from_millis(10));
        let mut rx = alice.subscribe();

        seed(&bob, "shared", vec![]);
        let change = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("change in time")
            .unwrap();
        assert_eq!(change.checklist_id, "shared");

        drop(alice);
        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher stops with its backend")
            .unwrap();
    }

    #[test]
    fn allocated_item_ids_are_unique() {
        let backend = backend();
        let a = backend.allocate_item_id("c1");
        let b = backend.allocate_item_id("c1");
        assert_eq!(a.len(), ITEM_ID_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn file_backed_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checklist.db");
        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.init_schema().unwrap();
            seed(&backend, "c1", vec![item("i1", 0, false, Utc::now())]);
        }
        let backend = SqliteBackend::open(&path).unwrap();
        backend.init_schema().unwrap();
        assert!(backend.get_checklist("c1").unwrap().is_some());
        assert_eq!(backend.list_items("c1").unwrap().len(), 1);
    }
}
