use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::db;
use crate::services::maps::MapRecord;

/// Durable home for map records.
pub trait MapStore: Send + Sync {
    fn save<'a>(&'a self, record: &'a MapRecord) -> BoxFuture<'a, anyhow::Result<()>>;
    fn delete(&self, id: Uuid) -> BoxFuture<'_, anyhow::Result<()>>;
}

impl MapStore for PgPool {
    fn save<'a>(&'a self, record: &'a MapRecord) -> BoxFuture<'a, anyhow::Result<()>> {
        db::save_map(self, record).boxed()
    }

    fn delete(&self, id: Uuid) -> BoxFuture<'_, anyhow::Result<()>> {
        db::delete_map(self, id).boxed()
    }
}

enum StoreOp {
    Save(Box<MapRecord>),
    Delete(Uuid),
    Flush(oneshot::Sender<()>),
}

/// Applies saves and deletes one at a time, in the order they were queued.
/// Once a map is deleted, saves still queued for it are dropped.
#[derive(Clone)]
pub struct StoreWriter {
    tx: mpsc::UnboundedSender<StoreOp>,
}

impl StoreWriter {
    /// Starts the writer task on the current runtime, if there is one.
    pub fn spawn(store: Arc<dyn MapStore>) -> Option<Self> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("no async runtime available; map persistence disabled");
                return None;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run_writer(store, rx));
        Some(Self { tx })
    }

    pub fn save(&self, record: &MapRecord) {
        self.send(StoreOp::Save(Box::new(record.clone())));
    }

    pub fn delete(&self, id: Uuid) {
        self.send(StoreOp::Delete(id));
    }

    /// Resolves once everything queued before the call has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(StoreOp::Flush(done));
        let _ = wait.await;
    }

    fn send(&self, op: StoreOp) {
        if self.tx.send(op).is_err() {
            tracing::warn!("map store writer has stopped; change not persisted");
        }
    }
}

async fn run_writer(store: Arc<dyn MapStore>, mut rx: mpsc::UnboundedReceiver<StoreOp>) {
    let mut deleted: HashSet<Uuid> = HashSet::new();
    while let Some(op) = rx.recv().await {
        match op {
            StoreOp::Save(record) => {
                if deleted.contains(&record.id) {
                    tracing::debug!(map_id = %record.id, "skipping save for deleted map");
                    continue;
                }
                if let Err(err) = store.save(&record).await {
                    tracing::warn!(map_id = %record.id, error = %err, "failed to persist map");
                }
            }
            StoreOp::Delete(id) => {
                deleted.insert(id);
                if let Err(err) = store.delete(id).await {
                    tracing::warn!(map_id = %id, error = %err, "failed to delete persisted map");
                }
            }
            StoreOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
