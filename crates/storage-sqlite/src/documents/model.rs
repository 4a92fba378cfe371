//! Database row for a stored document.

use diesel::prelude::*;
use serde_json::Value;
use spotter_core::store::{DocPath, Document};

use crate::errors::StorageError;

#[derive(Queryable, Insertable, Selectable, Debug, Clone, PartialEq, Eq)]
#[diesel(primary_key(path))]
#[diesel(table_name = crate::schema::documents)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DocumentDB {
    pub path: String,
    pub collection: String,
    pub collection_id: String,
    pub data: String,
    pub updated_at: String,
}

impl DocumentDB {
    pub fn new(path: &DocPath, data: &Value, updated_at: String) -> Result<Self, StorageError> {
        Ok(Self {
            path: path.to_string(),
            collection: path.collection().to_string(),
            collection_id: path.collection_id().to_string(),
            data: serde_json::to_string(data)?,
            updated_at,
        })
    }

    pub fn data_value(&self) -> Result<Value, StorageError> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

impl TryFrom<DocumentDB> for Document {
    type Error = StorageError;

    fn try_from(row: DocumentDB) -> Result<Self, Self::Error> {
        let data = row.data_value()?;
        Ok(Document {
            path: DocPath::parse(row.path)?,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_carries_path_parts() {
        let path = DocPath::parse("users/u1/profile/main").unwrap();
        let row = DocumentDB::new(&path, &json!({"userId": "u1"}), "t".into()).unwrap();
        assert_eq!(row.collection, "users/u1/profile");
        assert_eq!(row.collection_id, "profile");

        let doc = Document::try_from(row).unwrap();
        assert_eq!(doc.path, path);
        assert_eq!(doc.data["userId"], "u1");
    }

    #[test]
    fn corrupt_body_is_an_error() {
        let row = DocumentDB {
            path: "c/1".into(),
            collection: "c".into(),
            collection_id: "c".into(),
            data: "{not json".into(),
            updated_at: "t".into(),
        };
        assert!(matches!(
            Document::try_from(row),
            Err(StorageError::Json(_))
        ));
    }
}
