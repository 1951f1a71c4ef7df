//! Embedded storage for a single AbuseMesh node: the append-only event log
//! and the six derived tables folded from it.
//!
//! A thin [`Database`] wrapper around `redb_bincode::Database` exposes
//! `write_with`/`read_with` closures over a [`WriteTransactionCtx`], plus a
//! `DbError` snafu enum covering the handful of ways redb itself can fail.
//! [`EventStream`] and [`TableSet`] (the actual replication logic) build on
//! top of this.

mod event_stream;
mod table_set;
mod validator;

pub mod tables;

use std::ops;
use std::path::PathBuf;
use std::result;

use redb_bincode::{ReadTransaction, WriteTransaction};
use snafu::{Location, ResultExt, Snafu};
use tokio::task::JoinError;
use tracing::debug;

pub use self::event_stream::{EventObserver, EventStream};
pub use self::table_set::{TableRequest, TableSet, TableSetHandle};
pub use self::validator::{validate, Invalidity, NodeSnapshot, ReportSnapshot};

const LOG_TARGET: &str = "abusemesh::db";

/// Current on-disk schema version. Bumped whenever a table's key/value
/// shape changes; [`Database::open_inner`] refuses to open a database
/// written by a newer version of the code than itself.
const DB_VERSION: u64 = 1;

pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    on_commit: std::sync::Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: std::sync::Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> result::Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;

        dbtx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    Overflow,
}

pub type DbResult<T> = std::result::Result<T, DbError>;

/// Embedded redb-backed store. Owns the on-disk tables; the replication
/// logic in [`EventStream`]/[`TableSet`] owns the concurrency model on top
/// of it — single-writer, request-channel-serialized access.
#[derive(Debug)]
pub struct Database {
    inner: redb_bincode::Database,
}

impl Database {
    pub async fn new_in_memory() -> DbResult<Database> {
        debug!(target: LOG_TARGET, "Opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> DbResult<Database> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> DbResult<Database> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, Self::init_tables_tx).await?;

        Ok(Self { inner })
    }

    fn init_tables_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        let mut db_version_table = tx.open_table(&tables::db_version::TABLE)?;
        match db_version_table.get(&())?.map(|g| g.value()) {
            Some(db_ver) if db_ver > DB_VERSION => {
                return DbVersionTooHighSnafu {
                    db_ver,
                    code_ver: DB_VERSION,
                }
                .fail();
            }
            None => {
                db_version_table.insert(&(), &DB_VERSION)?;
            }
            _ => {}
        }
        drop(db_version_table);

        tx.open_table(&tables::events::TABLE)?;
        tx.open_table(&tables::events_order::TABLE)?;
        tx.open_table(&tables::events_order_counter::TABLE)?;
        tx.open_table(&tables::nodes::TABLE)?;
        tx.open_table(&tables::reports::TABLE)?;
        tx.open_table(&tables::neighbors::TABLE)?;
        tx.open_table(&tables::report_confirmations::TABLE)?;
        tx.open_table(&tables::delist_requests::TABLE)?;
        tx.open_table(&tables::delist_acceptances::TABLE)?;
        Ok(())
    }

    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    pub async fn read_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    pub async fn read_with<T>(&self, f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>) -> DbResult<T> {
        Self::read_with_inner(&self.inner, f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn opens_and_reopens_in_memory() {
        let db = Database::new_in_memory().await.expect("open");
        db.write_with(|tx| {
            let t = tx.open_table(&tables::db_version::TABLE)?;
            assert_eq!(t.get(&())?.map(|g| g.value()), Some(DB_VERSION));
            Ok(())
        })
        .await
        .expect("read back version");
    }
}
