use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::{debug, info};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use spotter_core::store::{
    apply_patch, apply_write, ChangeEvent, DocPath, Document, DocumentPatch, DocumentStore, Query,
    QueryScope, SetOptions, StoreError, StoreResult, TxDecision, TxMutation, TxOutcome,
    WriteBatch, WriteOp, CHANGE_FEED_CAPACITY,
};
use spotter_core::time_utils::now_rfc3339;

use super::model::DocumentDB;
use crate::db::{create_pool, get_connection, init, run_migrations, write_actor::spawn_writer};
use crate::db::{DbPool, WriteHandle};
use crate::errors::StorageError;
use crate::schema::documents;

fn load_data(conn: &mut SqliteConnection, path: &DocPath) -> Result<Option<Value>, StorageError> {
    let row = documents::table
        .find(path.as_str())
        .select(DocumentDB::as_select())
        .first::<DocumentDB>(conn)
        .optional()?;
    row.map(|r| r.data_value()).transpose()
}

fn store_data(
    conn: &mut SqliteConnection,
    path: &DocPath,
    state: Option<&Value>,
) -> Result<(), StorageError> {
    match state {
        Some(data) => {
            let row = DocumentDB::new(path, data, now_rfc3339())?;
            diesel::insert_into(documents::table)
                .values(&row)
                .on_conflict(documents::path)
                .do_update()
                .set((
                    documents::data.eq(&row.data),
                    documents::updated_at.eq(&row.updated_at),
                ))
                .execute(conn)?;
        }
        None => {
            diesel::delete(documents::table.find(path.as_str())).execute(conn)?;
        }
    }
    Ok(())
}

/// [`DocumentStore`] over a SQLite file.
pub struct SqliteDocumentStore {
    pool: DbPool,
    writer: WriteHandle,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteDocumentStore {
    pub fn new(pool: DbPool, writer: WriteHandle) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            pool,
            writer,
            changes,
        }
    }

    /// Prepares the database under `app_data_dir`, migrates it and starts the writer.
    pub fn open(app_data_dir: &str) -> Result<Self, StorageError> {
        let db_path = init(app_data_dir)?;
        run_migrations(&db_path)?;
        let pool = create_pool(&db_path)?;
        let writer = spawn_writer(pool.as_ref().clone());
        info!("Opened document store at {}", db_path);
        Ok(Self::new(pool, writer))
    }

    fn query_rows(&self, query: &Query) -> Result<Vec<Document>, StorageError> {
        let mut conn = get_connection(&self.pool)?;
        let rows = match query.scope() {
            QueryScope::Collection(collection) => documents::table
                .filter(documents::collection.eq(collection))
                .select(DocumentDB::as_select())
                .load::<DocumentDB>(&mut conn)?,
            QueryScope::CollectionGroup(collection_id) => documents::table
                .filter(documents::collection_id.eq(collection_id))
                .select(DocumentDB::as_select())
                .load::<DocumentDB>(&mut conn)?,
        };
        let docs = rows
            .into_iter()
            .map(Document::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(query.apply(docs))
    }

    async fn write_ops(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        let changes = self.changes.clone();
        self.writer
            .exec_then(
                move |conn| {
                    let mut staged: BTreeMap<DocPath, Option<Value>> = BTreeMap::new();
                    let mut events = Vec::with_capacity(ops.len());
                    for op in &ops {
                        let path = op.path().clone();
                        let before = match staged.get(&path) {
                            Some(state) => state.clone(),
                            None => load_data(conn, &path)?,
                        };
                        let after = apply_write(before.as_ref(), op)?;
                        events.push(ChangeEvent {
                            path: path.clone(),
                            before,
                            after: after.clone(),
                        });
                        staged.insert(path, after);
                    }
                    for (path, state) in &staged {
                        store_data(conn, path, state.as_ref())?;
                    }
                    Ok(events)
                },
                move |events: &Vec<ChangeEvent>| {
                    for event in events {
                        let _ = changes.send(event.clone());
                    }
                },
            )
            .await
            .map(|_| ())
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, path: &DocPath) -> StoreResult<Option<Document>> {
        let mut conn = get_connection(&self.pool).map_err(StoreError::from)?;
        let data = load_data(&mut conn, path).map_err(StoreError::from)?;
        Ok(data.map(|data| Document {
            path: path.clone(),
            data,
        }))
    }

    async fn set(&self, path: &DocPath, data: Value, options: SetOptions) -> StoreResult<()> {
        self.write_ops(vec![WriteOp::Set {
            path: path.clone(),
            data,
            options,
        }])
        .await
    }

    async fn update(&self, path: &DocPath, patch: DocumentPatch) -> StoreResult<()> {
        self.write_ops(vec![WriteOp::Update {
            path: path.clone(),
            patch,
        }])
        .await
    }

    async fn add(&self, collection: &str, data: Value) -> StoreResult<DocPath> {
        let path = DocPath::doc(collection, &Uuid::new_v4().to_string())?;
        self.write_ops(vec![WriteOp::Set {
            path: path.clone(),
            data,
            options: SetOptions::overwrite(),
        }])
        .await?;
        Ok(path)
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        batch.check_size()?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!("Committing batch of {} write(s)", batch.len());
        self.write_ops(batch.into_ops()).await
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        self.query_rows(query).map_err(StoreError::from)
    }

    async fn transact(&self, path: &DocPath, mutation: TxMutation) -> StoreResult<TxOutcome> {
        let changes = self.changes.clone();
        let path = path.clone();
        let (outcome, _) = self
            .writer
            .exec_then(
                move |conn| {
                    let before = load_data(conn, &path)?;
                    let after = match mutation(before.as_ref()) {
                        TxDecision::Abort(reason) => return Ok((TxOutcome::Aborted(reason), None)),
                        TxDecision::Set(data) => data,
                        TxDecision::Update(patch) => {
                            let mut doc = before
                                .clone()
                                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                            apply_patch(&mut doc, &patch);
                            doc
                        }
                    };
                    store_data(conn, &path, Some(&after))?;
                    let event = ChangeEvent {
                        path: path.clone(),
                        before,
                        after: Some(after),
                    };
                    Ok((TxOutcome::Committed, Some(event)))
                },
                move |(_, event): &(TxOutcome, Option<ChangeEvent>)| {
                    if let Some(event) = event {
                        let _ = changes.send(event.clone());
                    }
                },
            )
            .await
            .map_err(StoreError::from)?;
        Ok(outcome)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
