//! Document store adapter contract.
//!
//! The relationship engine never talks to a concrete database. Everything goes
//! through [`DocumentStore`], which models a JSON document store with
//! per-document atomic writes, bounded multi-document batches, field queries,
//! single-document read-modify-write transactions and an ordered change feed.

mod memory;
mod patch;
mod query;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::InMemoryDocumentStore;
pub use patch::{apply_patch, merge_into, DocumentPatch, PatchValue};
pub use query::{compare_json, field_value, Direction, Filter, FilterOp, Query, QueryScope};

/// Maximum operations a single [`WriteBatch`] may carry.
pub const MAX_BATCH_OPS: usize = 500;

/// Capacity of the in-process change feed before slow subscribers lag.
pub const CHANGE_FEED_CAPACITY: usize = 1024;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Batch has {ops} operations, limit is {max}")]
    BatchTooLarge { ops: usize, max: usize },

    #[error("Invalid document path '{0}'")]
    InvalidPath(String),

    /// Network or backend temporarily unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Slash separated path with an even number of segments: `collection/id[/sub/id...]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocPath(String);

impl DocPath {
    pub fn parse(path: impl Into<String>) -> StoreResult<Self> {
        let path = path.into();
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 2
            || segments.len() % 2 != 0
            || segments.iter().any(|s| s.trim().is_empty())
        {
            return Err(StoreError::InvalidPath(path));
        }
        Ok(Self(path))
    }

    /// Path of document `id` inside `collection`.
    pub fn doc(collection: &str, id: &str) -> StoreResult<Self> {
        if id.contains('/') {
            return Err(StoreError::InvalidPath(format!("{}/{}", collection, id)));
        }
        Self::parse(format!("{}/{}", collection, id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Full collection path (everything before the id).
    pub fn collection(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    /// Last collection segment, used by collection-group queries.
    pub fn collection_id(&self) -> &str {
        self.collection().rsplit('/').next().unwrap_or_default()
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocPath,
    pub data: Value,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub merge: bool,
}

impl SetOptions {
    pub fn merge() -> Self {
        Self { merge: true }
    }

    pub fn overwrite() -> Self {
        Self { merge: false }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        path: DocPath,
        data: Value,
        options: SetOptions,
    },
    Update {
        path: DocPath,
        patch: DocumentPatch,
    },
    Delete {
        path: DocPath,
    },
}

impl WriteOp {
    pub fn path(&self) -> &DocPath {
        match self {
            Self::Set { path, .. } | Self::Update { path, .. } | Self::Delete { path } => path,
        }
    }
}

/// All-or-nothing group of writes, capped at [`MAX_BATCH_OPS`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: DocPath, data: Value, options: SetOptions) -> &mut Self {
        self.ops.push(WriteOp::Set {
            path,
            data,
            options,
        });
        self
    }

    pub fn update(&mut self, path: DocPath, patch: DocumentPatch) -> &mut Self {
        self.ops.push(WriteOp::Update { path, patch });
        self
    }

    pub fn delete(&mut self, path: DocPath) -> &mut Self {
        self.ops.push(WriteOp::Delete { path });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn check_size(&self) -> StoreResult<()> {
        if self.ops.len() > MAX_BATCH_OPS {
            return Err(StoreError::BatchTooLarge {
                ops: self.ops.len(),
                max: MAX_BATCH_OPS,
            });
        }
        Ok(())
    }
}

/// Decision returned by a transaction body after seeing the current document.
#[derive(Debug, Clone, PartialEq)]
pub enum TxDecision {
    /// Patch the existing document. Fails with `NotFound` if it does not exist.
    Update(DocumentPatch),
    /// Replace (or create) the document with this data.
    Set(Value),
    Abort(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    Aborted(String),
}

impl TxOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

pub type TxMutation = Box<dyn FnOnce(Option<&Value>) -> TxDecision + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One committed document transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub path: DocPath,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match (&self.before, &self.after) {
            (None, _) => ChangeKind::Created,
            (Some(_), Some(_)) => ChangeKind::Updated,
            (Some(_), None) => ChangeKind::Deleted,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> StoreResult<Option<Document>>;

    async fn set(&self, path: &DocPath, data: Value, options: SetOptions) -> StoreResult<()>;

    /// Applies explicit field writes; unmentioned fields are left untouched.
    async fn update(&self, path: &DocPath, patch: DocumentPatch) -> StoreResult<()>;

    /// Creates a document with a generated id inside `collection`.
    async fn add(&self, collection: &str, data: Value) -> StoreResult<DocPath>;

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;

    /// Atomic read-modify-write of a single document.
    async fn transact(&self, path: &DocPath, mutation: TxMutation) -> StoreResult<TxOutcome>;

    /// Every committed transition, in commit order.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// Event produced by a [`Watch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Change(ChangeEvent),
    /// The subscriber fell behind and skipped transitions; re-read current state.
    Resync { skipped: u64 },
}

/// Change feed filtered down to documents matching a query.
pub struct Watch {
    rx: broadcast::Receiver<ChangeEvent>,
    query: Query,
}

impl Watch {
    pub fn new(store: &dyn DocumentStore, query: Query) -> Self {
        Self {
            rx: store.subscribe(),
            query,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Next matching transition, or `None` once the store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    let before_matches = event
                        .before
                        .as_ref()
                        .is_some_and(|data| self.query.matches(&event.path, data));
                    let after_matches = event
                        .after
                        .as_ref()
                        .is_some_and(|data| self.query.matches(&event.path, data));
                    if before_matches || after_matches {
                        return Some(WatchEvent::Change(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Watch on '{}' lagged, {} transitions skipped",
                        self.query.scope_name(),
                        skipped
                    );
                    return Some(WatchEvent::Resync { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Applies one write op to a document snapshot, returning the new state.
pub fn apply_write(current: Option<&Value>, op: &WriteOp) -> StoreResult<Option<Value>> {
    match op {
        WriteOp::Set { data, options, .. } => {
            if options.merge {
                let mut merged = current.cloned().unwrap_or_else(|| Value::Object(Default::default()));
                merge_into(&mut merged, data);
                Ok(Some(merged))
            } else {
                Ok(Some(data.clone()))
            }
        }
        WriteOp::Update { path, patch } => {
            let mut doc = current
                .cloned()
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            apply_patch(&mut doc, patch);
            Ok(Some(doc))
        }
        WriteOp::Delete { .. } => Ok(None),
    }
}
