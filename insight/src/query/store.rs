//! Dataset store access.
//!
//! The engine consumes the relational store through [`DatasetStore`];
//! the sqlite adapter here is the default deployment, opening each
//! dataset file read-only with the `query_only` pragma set, defense
//! in depth beneath the textual validator.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use indexmap::IndexMap;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use crate::errors::{EngineError, EngineResult};
use crate::schema::{infer_field_type, DatasetSchema, FieldProfile};

/// Rows come back as ordered column-name → value maps.
pub type QueryRow = IndexMap<String, serde_json::Value>;

#[derive(Debug, Clone, Default)]
pub struct QueryRows {
    pub rows: Vec<QueryRow>,
    /// True when the row cap cut the result short.
    pub truncated: bool,
}

/// Largest result set handed back to a capability. Anything bigger is
/// truncated; synthesis never needs more than a sample anyway.
pub const MAX_RESULT_ROWS: usize = 500;

/// Table every dataset is ingested into.
pub const DATASET_TABLE: &str = "records";

const SCHEMA_SAMPLE_LIMIT: usize = 50;

#[async_trait]
pub trait DatasetStore: Send + Sync {
    /// Execute a validated read-only query. The implementation must not
    /// be able to commit writes regardless of the query text.
    async fn execute(&self, dataset_ref: &str, query: &str) -> EngineResult<QueryRows>;

    /// Typed schema context for the dataset.
    async fn schema(&self, dataset_ref: &str) -> EngineResult<DatasetSchema>;
}

/// Sqlite-backed store: one database file per dataset under a root
/// directory, each holding a `records` table written by the ingestion
/// layer.
pub struct SqliteDatasetStore {
    root: PathBuf,
}

impl SqliteDatasetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dataset_path(&self, dataset_ref: &str) -> EngineResult<PathBuf> {
        // Dataset refs are opaque ids from the upload layer; refuse
        // anything that could escape the data directory.
        if dataset_ref.is_empty()
            || dataset_ref
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(EngineError::Storage(format!(
                "invalid dataset reference '{}'",
                dataset_ref
            )));
        }
        Ok(self.root.join(format!("{}.db", dataset_ref)))
    }

    fn open_read_only(path: &Path) -> EngineResult<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| EngineError::Storage(format!("cannot open dataset {:?}: {}", path, e)))?;
        conn.pragma_update(None, "query_only", true)
            .map_err(|e| EngineError::Storage(format!("cannot enforce query_only: {}", e)))?;
        Ok(conn)
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<{} byte blob>", b.len())),
    }
}

fn run_query(conn: &Connection, query: &str) -> EngineResult<QueryRows> {
    let mut stmt = conn
        .prepare(query)
        .map_err(|e| EngineError::Execution(e.to_string()))?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    let mut rows = stmt
        .query([])
        .map_err(|e| EngineError::Execution(e.to_string()))?;
    let mut out = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(|e| EngineError::Execution(e.to_string()))? {
        if out.len() >= MAX_RESULT_ROWS {
            truncated = true;
            break;
        }
        let mut record = IndexMap::with_capacity(column_names.len());
        for (idx, name) in column_names.iter().enumerate() {
            let value = row
                .get_ref(idx)
                .map_err(|e| EngineError::Execution(e.to_string()))?;
            record.insert(name.clone(), value_to_json(value));
        }
        out.push(record);
    }
    Ok(QueryRows {
        rows: out,
        truncated,
    })
}

fn read_schema(conn: &Connection) -> EngineResult<DatasetSchema> {
    let mut columns: Vec<(String, bool)> = Vec::new();
    {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", DATASET_TABLE))
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let mut rows = stmt.query([]).map_err(|e| EngineError::Storage(e.to_string()))?;
        while let Some(row) = rows.next().map_err(|e| EngineError::Storage(e.to_string()))? {
            let name: String = row.get(1).map_err(|e| EngineError::Storage(e.to_string()))?;
            let notnull: i64 = row.get(3).map_err(|e| EngineError::Storage(e.to_string()))?;
            columns.push((name, notnull == 0));
        }
    }
    if columns.is_empty() {
        return Err(EngineError::Storage(format!(
            "dataset has no '{}' table",
            DATASET_TABLE
        )));
    }

    let row_count: u64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", DATASET_TABLE), [], |r| {
            r.get::<_, i64>(0)
        })
        .map(|c| c.max(0) as u64)
        .map_err(|e| EngineError::Storage(e.to_string()))?;

    let mut fields = IndexMap::new();
    for (name, nullable) in columns {
        let sample_sql = format!(
            "SELECT \"{}\" FROM {} WHERE \"{}\" IS NOT NULL AND CAST(\"{}\" AS TEXT) != '' LIMIT {}",
            name, DATASET_TABLE, name, name, SCHEMA_SAMPLE_LIMIT
        );
        let mut samples: Vec<String> = Vec::new();
        let mut stmt = conn
            .prepare(&sample_sql)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        let mut rows = stmt.query([]).map_err(|e| EngineError::Storage(e.to_string()))?;
        while let Some(row) = rows.next().map_err(|e| EngineError::Storage(e.to_string()))? {
            let value = row
                .get_ref(0)
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            match value_to_json(value) {
                serde_json::Value::Null => {}
                serde_json::Value::String(s) => samples.push(s),
                other => samples.push(other.to_string()),
            }
        }
        let field_type = infer_field_type(&samples);
        samples.truncate(5);
        fields.insert(
            name,
            FieldProfile {
                field_type,
                nullable,
                sample_values: samples,
            },
        );
    }

    Ok(DatasetSchema { fields, row_count })
}

#[async_trait]
impl DatasetStore for SqliteDatasetStore {
    async fn execute(&self, dataset_ref: &str, query: &str) -> EngineResult<QueryRows> {
        let path = self.dataset_path(dataset_ref)?;
        let query = query.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = Self::open_read_only(&path)?;
            run_query(&conn, &query)
        })
        .await
        .map_err(|e| EngineError::Storage(format!("query task failed: {}", e)))?
    }

    async fn schema(&self, dataset_ref: &str) -> EngineResult<DatasetSchema> {
        let path = self.dataset_path(dataset_ref)?;
        tokio::task::spawn_blocking(move || {
            let conn = Self::open_read_only(&path)?;
            read_schema(&conn)
        })
        .await
        .map_err(|e| EngineError::Storage(format!("schema task failed: {}", e)))?
    }
}

/// Test-oriented store used by the fault-injection and end-to-end
/// suites: fixed schema, scripted responses per call.
pub struct StaticDatasetStore {
    schema: DatasetSchema,
    handler: Box<dyn Fn(&str) -> EngineResult<QueryRows> + Send + Sync>,
}

impl StaticDatasetStore {
    pub fn new(
        schema: DatasetSchema,
        handler: impl Fn(&str) -> EngineResult<QueryRows> + Send + Sync + 'static,
    ) -> Self {
        Self {
            schema,
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl DatasetStore for StaticDatasetStore {
    async fn execute(&self, _dataset_ref: &str, query: &str) -> EngineResult<QueryRows> {
        (self.handler)(query)
    }

    async fn schema(&self, _dataset_ref: &str) -> EngineResult<DatasetSchema> {
        Ok(self.schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    fn fixture_store() -> (tempfile::TempDir, SqliteDatasetStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sales.db");
        let conn = Connection::open(&path).expect("create db");
        conn.execute_batch(
            "CREATE TABLE records (
                region TEXT NOT NULL,
                revenue REAL,
                closed_at TEXT,
                active TEXT
            );
            INSERT INTO records VALUES
                ('north', 120.5, '2024-01-10', 'yes'),
                ('south', 80.0, '2024-02-11', 'no'),
                ('east', 210.0, '2024-03-12', 'yes'),
                ('west', 95.25, '2024-04-13', 'no');",
        )
        .expect("seed db");
        let store = SqliteDatasetStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_execute_returns_ordered_columns() {
        let (_dir, store) = fixture_store();
        let result = store
            .execute("sales", "SELECT region, revenue FROM records ORDER BY revenue")
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 4);
        let first = &result.rows[0];
        let keys: Vec<&String> = first.keys().collect();
        assert_eq!(keys, vec!["region", "revenue"]);
        assert_eq!(first["region"], serde_json::json!("south"));
    }

    #[tokio::test]
    async fn test_execute_error_propagates_message() {
        let (_dir, store) = fixture_store();
        let err = store
            .execute("sales", "SELECT missing_column FROM records")
            .await
            .unwrap_err();
        match err {
            EngineError::Execution(msg) => assert!(msg.contains("missing_column")),
            other => panic!("expected execution error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writes_blocked_even_if_validator_missed() {
        let (_dir, store) = fixture_store();
        let err = store
            .execute("sales", "UPDATE records SET revenue = 0")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)));

        // The data is untouched.
        let result = store
            .execute("sales", "SELECT COUNT(*) AS n FROM records WHERE revenue = 0")
            .await
            .unwrap();
        assert_eq!(result.rows[0]["n"], serde_json::json!(0));
    }

    #[tokio::test]
    async fn test_execute_is_idempotent() {
        let (_dir, store) = fixture_store();
        let sql = "SELECT AVG(revenue) AS avg_revenue FROM records";
        let first = store.execute("sales", sql).await.unwrap();
        let second = store.execute("sales", sql).await.unwrap();
        assert_eq!(first.rows, second.rows);
    }

    #[tokio::test]
    async fn test_schema_inference() {
        let (_dir, store) = fixture_store();
        let schema = store.schema("sales").await.unwrap();
        assert_eq!(schema.row_count, 4);
        assert_eq!(schema.fields["region"].field_type, FieldType::Text);
        assert_eq!(schema.fields["revenue"].field_type, FieldType::Numeric);
        assert_eq!(schema.fields["closed_at"].field_type, FieldType::Date);
        assert_eq!(schema.fields["active"].field_type, FieldType::Boolean);
        assert!(!schema.fields["region"].nullable);
        assert!(schema.fields["revenue"].nullable);
    }

    #[tokio::test]
    async fn test_missing_dataset_is_storage_error() {
        let (_dir, store) = fixture_store();
        let err = store.execute("nope", "SELECT 1").await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, store) = fixture_store();
        let err = store.execute("../etc/passwd", "SELECT 1").await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
    }
}
