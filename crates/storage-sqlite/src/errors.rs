use spotter_core::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Query failed: {0}")]
    Query(#[from] diesel::result::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Stored document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Writer actor is no longer running")]
    WriterClosed,
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Store(inner) => inner,
            StorageError::Pool(e) => StoreError::Unavailable(e.to_string()),
            StorageError::Query(diesel::result::Error::DatabaseError(_, info))
                if info.message().contains("locked") =>
            {
                StoreError::Unavailable(info.message().to_string())
            }
            StorageError::WriterClosed => {
                StoreError::Unavailable("writer actor is no longer running".to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_pass_through_unchanged() {
        let err = StorageError::from(StoreError::NotFound("users/u1/profile/main".into()));
        assert_eq!(
            StoreError::from(err),
            StoreError::NotFound("users/u1/profile/main".into())
        );
    }

    #[test]
    fn closed_writer_is_transient() {
        assert!(StoreError::from(StorageError::WriterClosed).is_transient());
        assert!(!StoreError::from(StorageError::Migration("bad".into())).is_transient());
    }
}
