mod model;
mod store;

pub use model::DocumentDB;
pub use store::SqliteDocumentStore;
