//! In-process document store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    apply_patch, apply_write, ChangeEvent, DocPath, Document, DocumentPatch, DocumentStore,
    Query, SetOptions, StoreError, StoreResult, TxDecision, TxMutation, TxOutcome, WriteBatch,
    WriteOp, CHANGE_FEED_CAPACITY,
};

/// Document store kept entirely in memory.
///
/// Backs the unit tests and is a reference for the semantics every backend
/// must share. Writes can be made to fail on demand to simulate a client going
/// offline halfway through a protocol.
pub struct InMemoryDocumentStore {
    docs: Mutex<BTreeMap<DocPath, Value>>,
    changes: broadcast::Sender<ChangeEvent>,
    failing_writes: AtomicUsize,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            docs: Mutex::new(BTreeMap::new()),
            changes,
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` write calls fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Snapshot of every stored document, ordered by path.
    pub fn dump(&self) -> StoreResult<Vec<Document>> {
        Ok(self
            .lock()?
            .iter()
            .map(|(path, data)| Document {
                path: path.clone(),
                data: data.clone(),
            })
            .collect())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, BTreeMap<DocPath, Value>>> {
        self.docs
            .lock()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }

    fn check_write_allowed(&self) -> StoreResult<()> {
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(
                "simulated network failure".to_string(),
            ));
        }
        Ok(())
    }

    /// Callers hold the document lock so feed order matches commit order.
    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.changes.send(event);
        }
    }

    fn write_ops(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        self.check_write_allowed()?;
        let mut docs = self.lock()?;
        let mut staged: BTreeMap<DocPath, Option<Value>> = BTreeMap::new();
        let mut events = Vec::with_capacity(ops.len());

        for op in &ops {
            let path = op.path().clone();
            let before = match staged.get(&path) {
                Some(state) => state.clone(),
                None => docs.get(&path).cloned(),
            };
            let after = apply_write(before.as_ref(), op)?;
            events.push(ChangeEvent {
                path: path.clone(),
                before,
                after: after.clone(),
            });
            staged.insert(path, after);
        }

        for (path, state) in staged {
            match state {
                Some(data) => {
                    docs.insert(path, data);
                }
                None => {
                    docs.remove(&path);
                }
            }
        }
        self.publish(events);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, path: &DocPath) -> StoreResult<Option<Document>> {
        Ok(self.lock()?.get(path).map(|data| Document {
            path: path.clone(),
            data: data.clone(),
        }))
    }

    async fn set(&self, path: &DocPath, data: Value, options: SetOptions) -> StoreResult<()> {
        self.write_ops(vec![WriteOp::Set {
            path: path.clone(),
            data,
            options,
        }])
    }

    async fn update(&self, path: &DocPath, patch: DocumentPatch) -> StoreResult<()> {
        self.write_ops(vec![WriteOp::Update {
            path: path.clone(),
            patch,
        }])
    }

    async fn add(&self, collection: &str, data: Value) -> StoreResult<DocPath> {
        let path = DocPath::doc(collection, &Uuid::new_v4().to_string())?;
        self.write_ops(vec![WriteOp::Set {
            path: path.clone(),
            data,
            options: SetOptions::overwrite(),
        }])?;
        Ok(path)
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        batch.check_size()?;
        if batch.is_empty() {
            return Ok(());
        }
        self.write_ops(batch.into_ops())
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        let candidates = self
            .lock()?
            .iter()
            .filter(|(path, _)| query.in_scope(path))
            .map(|(path, data)| Document {
                path: path.clone(),
                data: data.clone(),
            })
            .collect::<Vec<_>>();
        Ok(query.apply(candidates))
    }

    async fn transact(&self, path: &DocPath, mutation: TxMutation) -> StoreResult<TxOutcome> {
        self.check_write_allowed()?;
        let mut docs = self.lock()?;
        let before = docs.get(path).cloned();
        let after = match mutation(before.as_ref()) {
            TxDecision::Abort(reason) => return Ok(TxOutcome::Aborted(reason)),
            TxDecision::Set(data) => data,
            TxDecision::Update(patch) => {
                let mut doc = before
                    .clone()
                    .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                apply_patch(&mut doc, &patch);
                doc
            }
        };
        docs.insert(path.clone(), after.clone());
        self.publish(vec![ChangeEvent {
            path: path.clone(),
            before,
            after: Some(after),
        }]);
        Ok(TxOutcome::Committed)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
