//! SQLite-backed database holding every entity table.
//!
//! All access goes through one connection guarded by a mutex, which gives a
//! total order of commits. Change notifications run after commit while the
//! connection is still held, so subscribers see results in commit order.

use chrono::{DateTime, SubsecRound, Utc};
use rusqlite::{params_from_iter, Connection, ErrorCode, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::{debug, info, warn};

use waypoint_common::{Error, GcmMessage, GcmRegistration, News, Result, Step, StepLink, SyncRecord};

use crate::bus::{ChangeBus, Subscription};
use crate::entity::{Entity, EntityKind};
use crate::query::{Filter, Query};
use crate::store::EntityStore;

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY NOT NULL,
    position INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    completed INTEGER NOT NULL,
    possible_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS links (
    id TEXT PRIMARY KEY NOT NULL,
    steps_id TEXT NOT NULL,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    FOREIGN KEY(steps_id) REFERENCES steps(id)
);

CREATE TABLE IF NOT EXISTS news (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    date INTEGER NOT NULL,
    tldr TEXT
);

CREATE TABLE IF NOT EXISTS syncs (
    id TEXT PRIMARY KEY NOT NULL,
    pending INTEGER NOT NULL,
    pending_time INTEGER,
    time_synced INTEGER,
    time_created INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS gcm_messages (
    id TEXT PRIMARY KEY NOT NULL,
    syncs_id TEXT,
    type INTEGER NOT NULL,
    data TEXT NOT NULL,
    time_created INTEGER NOT NULL,
    FOREIGN KEY(syncs_id) REFERENCES syncs(id)
);

CREATE TABLE IF NOT EXISTS gcm_registrations (
    token TEXT PRIMARY KEY NOT NULL,
    time_created INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_links_steps_id ON links(steps_id);
CREATE INDEX IF NOT EXISTS idx_syncs_pending ON syncs(pending);
"#;

const DROP_SCHEMA: &str = r#"
DROP TABLE IF EXISTS gcm_messages;
DROP TABLE IF EXISTS gcm_registrations;
DROP TABLE IF EXISTS syncs;
DROP TABLE IF EXISTS links;
DROP TABLE IF EXISTS steps;
DROP TABLE IF EXISTS news;
"#;

/// Where the database lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// A file-backed store at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// An in-memory store.
    pub fn in_memory() -> Self {
        Self { path: None }
    }
}

/// Map a SQLite failure onto the error taxonomy.
///
/// Constraint violations are integrity errors; everything else is a
/// persistence error.
pub(crate) fn map_sqlite(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            Error::Integrity(err.to_string())
        }
        _ => Error::Persistence(err.to_string()),
    }
}

/// Run `query` for entity kind `E` on `conn`.
pub(crate) fn select<E: Entity>(conn: &Connection, query: &Query) -> Result<Vec<E>> {
    let (sql, params) = query.to_select(E::TABLE, E::COLUMNS)?;
    let mut stmt = conn.prepare_cached(&sql).map_err(map_sqlite)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), |row| E::from_row(row))
        .map_err(map_sqlite)?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row.map_err(map_sqlite)?);
    }
    Ok(result)
}

fn count<E: Entity>(conn: &Connection, filter: &Filter) -> Result<usize> {
    let (where_sql, params) = filter.to_sql(E::COLUMNS)?;
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", E::TABLE, where_sql);
    let count: i64 = conn
        .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))
        .map_err(map_sqlite)?;
    Ok(count as usize)
}

/// Change buses for every entity kind.
#[doc(hidden)]
pub struct Buses {
    pub(crate) steps: Arc<ChangeBus<Step>>,
    pub(crate) links: Arc<ChangeBus<StepLink>>,
    pub(crate) news: Arc<ChangeBus<News>>,
    pub(crate) syncs: Arc<ChangeBus<SyncRecord>>,
    pub(crate) messages: Arc<ChangeBus<GcmMessage>>,
    pub(crate) registrations: Arc<ChangeBus<GcmRegistration>>,
}

impl Buses {
    fn new() -> Self {
        Self {
            steps: Arc::new(ChangeBus::new()),
            links: Arc::new(ChangeBus::new()),
            news: Arc::new(ChangeBus::new()),
            syncs: Arc::new(ChangeBus::new()),
            messages: Arc::new(ChangeBus::new()),
            registrations: Arc::new(ChangeBus::new()),
        }
    }

    fn notify(&self, conn: &Connection, kind: EntityKind) {
        match kind {
            EntityKind::Step => self.steps.notify(conn),
            EntityKind::StepLink => self.links.notify(conn),
            EntityKind::News => self.news.notify(conn),
            EntityKind::Sync => self.syncs.notify(conn),
            EntityKind::GcmMessage => self.messages.notify(conn),
            EntityKind::GcmRegistration => self.registrations.notify(conn),
        }
    }
}

struct Inner {
    conn: Mutex<Connection>,
    buses: Buses,
}

/// Handle to the local database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Open the database described by `config`, creating tables as needed.
    ///
    /// # Errors
    /// - `Persistence` if the file cannot be opened or migrated
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let conn = match &config.path {
            Some(path) => Self::open_file(path)?,
            None => Connection::open_in_memory().map_err(map_sqlite)?,
        };
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    fn open_file(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Connection::open(path).map_err(map_sqlite)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(map_sqlite)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(map_sqlite)?;

        if version != 0 && version != SCHEMA_VERSION {
            warn!(
                "Schema version {} does not match {}; recreating tables",
                version, SCHEMA_VERSION
            );
            conn.execute_batch(DROP_SCHEMA).map_err(map_sqlite)?;
        }

        conn.execute_batch(SCHEMA).map_err(map_sqlite)?;
        conn.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))
            .map_err(map_sqlite)?;

        info!("Database opened (schema v{})", SCHEMA_VERSION);
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                buses: Buses::new(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner
            .conn
            .lock()
            .map_err(|_| Error::Persistence("Database lock poisoned".to_string()))
    }

    /// Typed store for entity kind `E`.
    pub fn store<E: Entity>(&self) -> EntityStore<E> {
        EntityStore::new(self.clone())
    }

    pub fn steps(&self) -> EntityStore<Step> {
        self.store()
    }

    pub fn step_links(&self) -> EntityStore<StepLink> {
        self.store()
    }

    pub fn news(&self) -> EntityStore<News> {
        self.store()
    }

    pub fn syncs(&self) -> EntityStore<SyncRecord> {
        self.store()
    }

    pub fn messages(&self) -> EntityStore<GcmMessage> {
        self.store()
    }

    pub fn registrations(&self) -> EntityStore<GcmRegistration> {
        self.store()
    }

    /// Run `f` inside one transaction.
    ///
    /// Either everything `f` wrote commits or nothing does. After commit,
    /// every touched kind's subscriptions are refreshed.
    pub fn write<T>(&self, f: impl FnOnce(&mut WriteTx<'_>) -> Result<T>) -> Result<T> {
        self.write_until(None, f)
    }

    /// Like [`Database::write`], but the transaction is rolled back with
    /// `Error::Timeout` once `deadline` passes between two row writes.
    pub fn write_until<T>(
        &self,
        deadline: Option<Instant>,
        f: impl FnOnce(&mut WriteTx<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock()?;

        let (value, touched) = {
            let tx = conn.transaction().map_err(map_sqlite)?;
            let mut write = WriteTx {
                tx,
                touched: BTreeSet::new(),
                // Rows store milliseconds; keep returned values identical.
                now: Utc::now().trunc_subsecs(3),
                deadline,
            };
            let value = f(&mut write)?;
            write.check_deadline()?;
            let touched = write.commit()?;
            (value, touched)
        };

        for kind in touched {
            self.inner.buses.notify(&conn, kind);
        }

        Ok(value)
    }

    /// Run read-only `f` against a consistent view.
    pub fn read<T>(&self, f: impl FnOnce(&ReadTx<'_>) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&ReadTx { conn: &*conn })
    }

    /// Subscribe to `query` on kind `E`.
    pub(crate) fn subscribe<E: Entity>(&self, query: Query) -> Result<Subscription<E>> {
        let conn = self.lock()?;
        let initial = select::<E>(&conn, &query)?;
        E::bus(&self.inner.buses).register(query, initial)
    }

    /// Refresh all subscriptions of kind `E` against the current state.
    pub(crate) fn notify<E: Entity>(&self) -> Result<()> {
        let conn = self.lock()?;
        self.inner.buses.notify(&conn, E::KIND);
        Ok(())
    }

    /// Number of live subscriptions on kind `E`.
    pub(crate) fn subscriber_count<E: Entity>(&self) -> usize {
        E::bus(&self.inner.buses).len()
    }
}

/// Read access inside [`Database::read`].
pub struct ReadTx<'a> {
    conn: &'a Connection,
}

impl ReadTx<'_> {
    pub fn query<E: Entity>(&self, query: &Query) -> Result<Vec<E>> {
        select::<E>(self.conn, query)
    }

    pub fn count<E: Entity>(&self, filter: &Filter) -> Result<usize> {
        count::<E>(self.conn, filter)
    }
}

/// Write access inside [`Database::write`].
pub struct WriteTx<'a> {
    tx: Transaction<'a>,
    touched: BTreeSet<EntityKind>,
    now: DateTime<Utc>,
    deadline: Option<Instant>,
}

impl WriteTx<'_> {
    /// Timestamp used for write-time defaults in this transaction.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Fail with `Error::Timeout` if the deadline has passed.
    pub fn check_deadline(&self) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout(
                "Write transaction exceeded its deadline".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Insert-or-update each entity keyed by its id, assigning ids where
    /// absent. Returns the entities as written.
    ///
    /// # Errors
    /// - `Integrity` if a foreign key does not resolve
    /// - `Persistence` on storage failure
    pub fn upsert<E: Entity>(&mut self, entities: Vec<E>) -> Result<Vec<E>> {
        let columns = E::COLUMNS.join(", ");
        let placeholders: Vec<String> = (1..=E::COLUMNS.len()).map(|i| format!("?{}", i)).collect();
        let updates: Vec<String> = E::COLUMNS
            .iter()
            .filter(|c| **c != E::KEY)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();

        let sql = if updates.is_empty() {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO NOTHING",
                E::TABLE,
                columns,
                placeholders.join(", "),
                E::KEY
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) DO UPDATE SET {}",
                E::TABLE,
                columns,
                placeholders.join(", "),
                E::KEY,
                updates.join(", ")
            )
        };

        let mut written = Vec::with_capacity(entities.len());
        {
            let mut stmt = self.tx.prepare_cached(&sql).map_err(map_sqlite)?;
            for entity in entities {
                self.check_deadline()?;
                let entity = entity.resolve(self.now)?;
                stmt.execute(params_from_iter(entity.to_row().iter()))
                    .map_err(map_sqlite)?;
                written.push(entity);
            }
        }

        if !written.is_empty() {
            debug!("Upserted {} row(s) into {}", written.len(), E::TABLE);
            self.touched.insert(E::KIND);
        }
        Ok(written)
    }

    /// Insert `entity` unless a row with its key exists, in which case the
    /// existing row is returned unchanged. The flag is `true` on insert.
    pub fn insert_if_absent<E: Entity>(&mut self, entity: E) -> Result<(E, bool)> {
        if let Some(key) = entity.key() {
            let existing = self.query::<E>(&Query::filter(Filter::eq(E::KEY, key.to_string())))?;
            if let Some(row) = existing.into_iter().next() {
                return Ok((row, false));
            }
        }
        let mut written = self.upsert(vec![entity])?;
        let row = written
            .pop()
            .ok_or_else(|| Error::Persistence(format!("Insert into {} wrote nothing", E::TABLE)))?;
        Ok((row, true))
    }

    /// Delete rows matching `filter`, returning how many were removed.
    pub fn delete<E: Entity>(&mut self, filter: &Filter) -> Result<usize> {
        let (where_sql, params) = filter.to_sql(E::COLUMNS)?;
        let sql = format!("DELETE FROM {} WHERE {}", E::TABLE, where_sql);
        let removed = self
            .tx
            .execute(&sql, params_from_iter(params.iter()))
            .map_err(map_sqlite)?;
        if removed > 0 {
            debug!("Deleted {} row(s) from {}", removed, E::TABLE);
            self.touched.insert(E::KIND);
        }
        Ok(removed)
    }

    /// Delete every row of kind `E`.
    pub fn clear<E: Entity>(&mut self) -> Result<usize> {
        self.delete::<E>(&Filter::All)
    }

    /// Read inside the transaction, seeing its own uncommitted writes.
    pub fn query<E: Entity>(&self, query: &Query) -> Result<Vec<E>> {
        select::<E>(&self.tx, query)
    }

    pub fn count<E: Entity>(&self, filter: &Filter) -> Result<usize> {
        count::<E>(&self.tx, filter)
    }

    fn commit(self) -> Result<BTreeSet<EntityKind>> {
        self.tx.commit().map_err(map_sqlite)?;
        Ok(self.touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_file_database_persists() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig::at(temp.path().join("nested").join("waypoint.db"));

        {
            let db = Database::open(&config).unwrap();
            db.steps()
                .upsert_one(Step::new(1, "Persisted", "", false, ""))
                .unwrap();
        }

        let db = Database::open(&config).unwrap();
        assert_eq!(db.steps().all().unwrap()[0].title, "Persisted");
    }

    #[test]
    fn test_schema_version_mismatch_recreates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("waypoint.db");

        {
            let db = Database::open(&StoreConfig::at(&path)).unwrap();
            db.steps().upsert_one(Step::new(1, "Old", "", false, "")).unwrap();
        }
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        }

        let db = Database::open(&StoreConfig::at(&path)).unwrap();
        assert!(db.steps().all().unwrap().is_empty());
    }

    #[test]
    fn test_failed_write_rolls_back_everything() {
        let db = Database::in_memory().unwrap();
        let result: Result<()> = db.write(|tx| {
            tx.upsert(vec![Step::new(1, "A", "", false, "").with_id("a")])?;
            tx.upsert(vec![News::new("n", "u", Utc::now())])?;
            Err(Error::Persistence("boom".to_string()))
        });

        assert!(result.is_err());
        assert!(db.steps().all().unwrap().is_empty());
        assert!(db.news().all().unwrap().is_empty());
    }

    #[test]
    fn test_write_sees_own_changes() {
        let db = Database::in_memory().unwrap();
        let count = db
            .write(|tx| {
                tx.upsert(vec![Step::new(1, "A", "", false, "")])?;
                tx.count::<Step>(&Filter::All)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_expired_deadline_times_out() {
        let db = Database::in_memory().unwrap();
        let deadline = Instant::now() - Duration::from_millis(1);
        let err = db
            .write_until(Some(deadline), |tx| {
                tx.upsert(vec![Step::new(1, "A", "", false, "")])
            })
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(db.steps().all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multi_kind_write_notifies_each_kind_once() {
        let db = Database::in_memory().unwrap();
        let mut steps = db.steps().subscribe_all().unwrap();
        let mut links = db.step_links().subscribe_all().unwrap();
        steps.next().await.unwrap();
        links.next().await.unwrap();

        db.write(|tx| {
            tx.upsert(vec![Step::new(1, "A", "", false, "").with_id("a")])?;
            tx.upsert(vec![StepLink::new("a", "L", "https://l")])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(steps.next().await.unwrap().len(), 1);
        assert_eq!(links.next().await.unwrap().len(), 1);
    }

    #[test]
    fn test_map_sqlite_classifies_constraints() {
        let db = Database::in_memory().unwrap();
        let err = db
            .step_links()
            .upsert_one(StepLink::new("ghost", "t", "u"))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));

        let err = map_sqlite(rusqlite::Error::InvalidQuery);
        assert!(matches!(err, Error::Persistence(_)));
    }
}
