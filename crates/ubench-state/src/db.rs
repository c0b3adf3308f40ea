//! Short-lived redb handles.
//!
//! A file-backed [`Db`] opens the database for exactly one transaction and
//! drops it afterwards, releasing redb's exclusive file lock so other ubench
//! processes can get in. While another process holds the lock, opening is
//! retried with a bounded backoff.
//!
//! Every call is synchronous: a busy database blocks the calling thread for
//! up to the lock wait (ten seconds by default) before failing with
//! [`StateError::Locked`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redb::{
    Database, DatabaseError, ReadableDatabase, ReadableTable, TableDefinition, TableError,
    WriteTransaction,
};
use tracing::{debug, error, warn};

use crate::error::{StateError, StateResult};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// How long to wait for another process to release the database.
const LOCK_WAIT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

#[derive(Clone)]
enum Backend {
    File(PathBuf),
    Memory(Arc<Database>),
}

#[derive(Clone)]
pub(crate) struct Db {
    backend: Backend,
    lock_wait: Duration,
}

impl Db {
    /// A database at `path`. Nothing is opened until the first operation.
    pub(crate) fn file(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            backend: Backend::File(path.to_path_buf()),
            lock_wait: LOCK_WAIT,
        })
    }

    /// Give up on a busy database after `wait` instead of [`LOCK_WAIT`].
    #[cfg(test)]
    pub(crate) fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    /// An ephemeral in-memory database (for testing).
    pub(crate) fn memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        Ok(Self {
            backend: Backend::Memory(Arc::new(db)),
            lock_wait: LOCK_WAIT,
        })
    }

    /// Read one value. A missing or unreadable database reads as `None`.
    pub(crate) fn get(&self, table: Table, key: &str) -> StateResult<Option<Vec<u8>>> {
        let read = |db: &Database| -> StateResult<Option<Vec<u8>>> {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = match txn.open_table(table) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(StateError::Table(e.to_string())),
            };
            let value = table.get(key).map_err(map_err!(Read))?;
            Ok(value.map(|guard| guard.value().to_vec()))
        };
        Ok(self.with_read(read)?.flatten())
    }

    /// Read every row of a table in key order. A missing or unreadable
    /// database reads as empty.
    pub(crate) fn scan(&self, table: Table) -> StateResult<Vec<(String, Vec<u8>)>> {
        let read = |db: &Database| -> StateResult<Vec<(String, Vec<u8>)>> {
            let txn = db.begin_read().map_err(map_err!(Transaction))?;
            let table = match txn.open_table(table) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(StateError::Table(e.to_string())),
            };
            let mut rows = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                rows.push((key.value().to_string(), value.value().to_vec()));
            }
            Ok(rows)
        };
        Ok(self.with_read(read)?.unwrap_or_default())
    }

    /// Run `f` inside one write transaction and commit it.
    ///
    /// A database file that cannot be opened for any reason other than
    /// another process holding it is treated as corrupt and replaced.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> StateResult<T>,
    ) -> StateResult<T> {
        let run = |db: &Database| -> StateResult<T> {
            let txn = db.begin_write().map_err(map_err!(Transaction))?;
            let out = f(&txn)?;
            txn.commit().map_err(map_err!(Transaction))?;
            Ok(out)
        };
        match &self.backend {
            Backend::Memory(db) => run(db),
            Backend::File(path) => {
                let db = match open_with_retry(path, true, self.lock_wait) {
                    Ok(db) => db,
                    Err(DatabaseError::DatabaseAlreadyOpen) => {
                        return Err(StateError::locked(path));
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "state database is corrupt, replacing it");
                        std::fs::remove_file(path)?;
                        open_with_retry(path, true, self.lock_wait).map_err(map_err!(Open))?
                    }
                };
                run(&db)
            }
        }
    }

    fn with_read<T>(&self, f: impl FnOnce(&Database) -> StateResult<T>) -> StateResult<Option<T>> {
        match &self.backend {
            Backend::Memory(db) => f(db).map(Some),
            Backend::File(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                match open_with_retry(path, false, self.lock_wait) {
                    Ok(db) => f(&db).map(Some),
                    Err(DatabaseError::DatabaseAlreadyOpen) => {
                        Err(StateError::locked(path))
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "state database is unreadable, treating it as empty");
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// Open (or create) the database, sleeping between attempts for up to
/// `wait` while another process holds it.
fn open_with_retry(path: &Path, create: bool, wait: Duration) -> Result<Database, DatabaseError> {
    let deadline = Instant::now() + wait;
    let mut backoff = Duration::from_millis(10);
    loop {
        let result = if create {
            Database::create(path)
        } else {
            Database::open(path)
        };
        match result {
            Err(DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                debug!(path = %path.display(), ?backoff, "state database busy, retrying");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(DatabaseError::DatabaseAlreadyOpen) => {
                warn!(path = %path.display(), "gave up waiting for state database lock");
                return Err(DatabaseError::DatabaseAlreadyOpen);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::DISCOVERY;

    fn put(db: &Db, key: &str, value: &[u8]) {
        db.write(|txn| {
            let mut table = txn.open_table(DISCOVERY).map_err(map_err!(Table))?;
            table.insert(key, value).map_err(map_err!(Write))?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::file(&dir.path().join("nested/absent.redb")).unwrap();
        assert!(db.get(DISCOVERY, "x").unwrap().is_none());
        assert!(db.scan(DISCOVERY).unwrap().is_empty());
        // Reading must not create the file.
        assert!(!dir.path().join("nested/absent.redb").exists());
    }

    #[test]
    fn file_round_trip_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let a = Db::file(&path).unwrap();
        let b = Db::file(&path).unwrap();
        put(&a, "k1", b"one");
        // A second handle on the same file sees the write and can write too.
        assert_eq!(b.get(DISCOVERY, "k1").unwrap().as_deref(), Some(&b"one"[..]));
        put(&b, "k2", b"two");
        let keys: Vec<String> = a.scan(DISCOVERY).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["k1", "k2"]);
    }

    #[test]
    fn corrupt_file_reads_empty_and_is_replaced_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        std::fs::write(&path, b"definitely not a redb file").unwrap();

        let db = Db::file(&path).unwrap();
        assert!(db.scan(DISCOVERY).unwrap().is_empty());

        put(&db, "k", b"v");
        assert_eq!(db.get(DISCOVERY, "k").unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn held_database_fails_locked_after_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let db = Db::file(&path).unwrap().with_lock_wait(Duration::from_millis(60));
        put(&db, "k", b"v");

        let holder = Database::create(&path).unwrap();
        let started = Instant::now();
        let err = db.get(DISCOVERY, "k").unwrap_err();
        assert!(matches!(err, StateError::Locked { ref path } if path.ends_with("state.redb")));
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(matches!(
            db.write(|_| Ok(())),
            Err(StateError::Locked { .. })
        ));

        drop(holder);
        assert_eq!(db.get(DISCOVERY, "k").unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn memory_backend_reads_missing_table_as_empty() {
        let db = Db::memory().unwrap();
        assert!(db.get(DISCOVERY, "x").unwrap().is_none());
        put(&db, "x", b"1");
        assert_eq!(db.scan(DISCOVERY).unwrap().len(), 1);
    }
}
