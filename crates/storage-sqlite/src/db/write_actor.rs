//! Single writer thread. Every job runs inside an immediate transaction on the
//! same thread, so writes never contend with each other for the SQLite lock.

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use log::{debug, error};
use tokio::sync::{mpsc, oneshot};

use super::get_connection;
use crate::errors::StorageError;

type Job = Box<dyn FnOnce(&Pool<ConnectionManager<SqliteConnection>>) + Send>;

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl WriteHandle {
    /// Runs `job` in a transaction on the writer thread. An `Err` rolls back.
    pub async fn exec<F, T>(&self, job: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        self.exec_then(job, |_: &T| {}).await
    }

    /// Like [`exec`](Self::exec), and runs `on_commit` on the writer thread
    /// after the transaction committed, before the next job starts.
    pub async fn exec_then<F, C, T>(&self, job: F, on_commit: C) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
        C: FnOnce(&T) + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let wrapped: Job = Box::new(move |pool| {
            let result = get_connection(pool).and_then(|mut conn| {
                conn.immediate_transaction::<T, StorageError, _>(|tx| job(tx))
            });
            if let Ok(value) = &result {
                on_commit(value);
            }
            if reply_tx.send(result).is_err() {
                debug!("Write job finished after its caller went away");
            }
        });
        self.tx
            .send(wrapped)
            .map_err(|_| StorageError::WriterClosed)?;
        reply_rx.await.map_err(|_| StorageError::WriterClosed)?
    }
}

/// Starts the writer thread. It exits once every [`WriteHandle`] is dropped.
pub fn spawn_writer(pool: Pool<ConnectionManager<SqliteConnection>>) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    let spawned = std::thread::Builder::new()
        .name("spotter-sqlite-writer".to_string())
        .spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                job(&pool);
            }
            debug!("SQLite writer stopped");
        });
    if let Err(err) = spawned {
        // The receiver was dropped with the closure, so every exec reports WriterClosed.
        error!("Failed to start SQLite writer thread: {}", err);
    }
    WriteHandle { tx }
}
