//! SQLite backend for the spotter document store.
//!
//! Documents live in a single `documents` table keyed by path, with the JSON
//! body stored as text. Reads go through an r2d2 pool. Every write is routed
//! through a single writer thread so commits are serialized and the change
//! feed sees them in commit order.

pub mod db;
pub mod documents;
pub mod errors;
pub mod schema;

pub use db::{create_pool, get_connection, init, run_migrations, write_actor::spawn_writer};
pub use db::{DbPool, WriteHandle};
pub use documents::SqliteDocumentStore;
pub use errors::StorageError;
