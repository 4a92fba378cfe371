//! Field queries evaluated against JSON documents.

use serde_json::Value;
use std::cmp::Ordering;

use super::{DocPath, Document};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Documents directly inside this collection path.
    Collection(String),
    /// Documents in any collection whose last segment is this id.
    CollectionGroup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    In,
    ArrayContains,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub scope: QueryScope,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            scope: QueryScope::Collection(path.into()),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self {
            scope: QueryScope::CollectionGroup(collection_id.into()),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        });
        self
    }

    pub fn where_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FilterOp::In,
            value: Value::Array(values),
        });
        self
    }

    pub fn where_array_contains(
        mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op: FilterOp::ArrayContains,
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn scope(&self) -> &QueryScope {
        &self.scope
    }

    pub fn scope_name(&self) -> &str {
        match &self.scope {
            QueryScope::Collection(path) | QueryScope::CollectionGroup(path) => path,
        }
    }

    pub fn in_scope(&self, path: &DocPath) -> bool {
        match &self.scope {
            QueryScope::Collection(collection) => path.collection() == collection,
            QueryScope::CollectionGroup(id) => path.collection_id() == id,
        }
    }

    pub fn matches(&self, path: &DocPath, data: &Value) -> bool {
        self.in_scope(path) && self.filters.iter().all(|f| f.matches(data))
    }

    /// Filters, orders and limits an unordered candidate set.
    pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut out: Vec<Document> = docs
            .into_iter()
            .filter(|doc| self.matches(&doc.path, &doc.data))
            .collect();

        match &self.order_by {
            Some((field, direction)) => out.sort_by(|a, b| {
                let ordering = compare_json(
                    field_value(&a.data, field).unwrap_or(&Value::Null),
                    field_value(&b.data, field).unwrap_or(&Value::Null),
                )
                .then_with(|| a.path.cmp(&b.path));
                match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            }),
            None => out.sort_by(|a, b| a.path.cmp(&b.path)),
        }

        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

impl Filter {
    pub fn matches(&self, data: &Value) -> bool {
        let actual = field_value(data, &self.field);
        match self.op {
            FilterOp::Eq => actual.is_some_and(|v| v == &self.value),
            FilterOp::In => match (&self.value, actual) {
                (Value::Array(candidates), Some(v)) => candidates.contains(v),
                _ => false,
            },
            FilterOp::ArrayContains => match actual {
                Some(Value::Array(items)) => items.contains(&self.value),
                _ => false,
            },
        }
    }
}

/// Looks up a dotted field path.
pub fn field_value<'a>(data: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(data, |current, segment| current.get(segment))
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| compare_json(l, r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(path: &str, data: Value) -> Document {
        Document {
            path: DocPath::parse(path).unwrap(),
            data,
        }
    }

    #[test]
    fn filters_and_orders() {
        let docs = vec![
            doc("linkRequests/a", json!({ "status": "pending", "createdAt": "2026-01-02" })),
            doc("linkRequests/b", json!({ "status": "accepted", "createdAt": "2026-01-01" })),
            doc("linkRequests/c", json!({ "status": "pending", "createdAt": "2026-01-03" })),
            doc("other/d", json!({ "status": "pending" })),
        ];
        let query = Query::collection("linkRequests")
            .where_eq("status", "pending")
            .order_by("createdAt", Direction::Desc)
            .limit(1);

        let result = query.apply(docs);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id(), "c");
    }

    #[test]
    fn collection_group_and_array_contains() {
        let docs = vec![
            doc("users/u1/profile/main", json!({ "partnerIds": ["u2"] })),
            doc("users/u2/profile/main", json!({ "partnerIds": [] })),
        ];
        let query = Query::collection_group("profile").where_array_contains("partnerIds", "u2");
        let result = query.apply(docs);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].path.as_str(), "users/u1/profile/main");
    }

    #[test]
    fn where_in_and_nested_fields() {
        let data = json!({ "routineSync": { "mode": "auto" } });
        let filter = Filter {
            field: "routineSync.mode".to_string(),
            op: FilterOp::In,
            value: json!(["manual", "auto"]),
        };
        assert!(filter.matches(&data));
    }
}
