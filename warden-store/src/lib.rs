use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use async_trait::async_trait;
use thiserror::Error;
use warden_types::{DataSignature, MAX_SAMPLE_ROWS};

pub mod fixture;
pub use fixture::FixtureBackend;

pub mod readonly;
pub use readonly::ReadOnlyBackend;

pub mod sqlite;
pub use sqlite::SqliteBackend;

pub type ArrowBatch = RecordBatch;
pub type ArrowBatchHandle = Arc<ArrowBatch>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend rejected the statement: syntax error, unknown table or column.
    #[error("query error: {0}")]
    Query(String),
    /// The statement is not read-only.
    #[error("read-only backend refused statement: {0}")]
    ReadOnly(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<ArrowError> for BackendError {
    fn from(e: ArrowError) -> Self {
        BackendError::Query(e.to_string())
    }
}

/// Rows returned by the data backend: a schema plus zero or more Arrow batches.
#[derive(Clone, Debug)]
pub struct QueryResult {
    schema: SchemaRef,
    batches: Vec<ArrowBatchHandle>,
}

impl QueryResult {
    pub fn new(schema: SchemaRef, batches: Vec<ArrowBatchHandle>) -> Self {
        Self { schema, batches }
    }

    /// A result with the given columns and no rows.
    pub fn empty(columns: &[&str]) -> Self {
        Self::new(utf8_schema(columns), Vec::new())
    }

    /// Builds a single all-Utf8 batch from string rows. Short rows are padded with nulls.
    pub fn from_rows<R, S>(columns: &[&str], rows: R) -> Result<Self, BackendError>
    where
        R: IntoIterator<Item = Vec<S>>,
        S: Into<String>,
    {
        let rows: Vec<Vec<Option<String>>> = rows
            .into_iter()
            .map(|r| r.into_iter().map(|cell| Some(cell.into())).collect())
            .collect();
        Self::from_nullable_rows(columns, rows)
    }

    /// Same as [`QueryResult::from_rows`], with `None` cells stored as nulls.
    pub fn from_nullable_rows(columns: &[&str], rows: Vec<Vec<Option<String>>>) -> Result<Self, BackendError> {
        let schema = utf8_schema(columns);
        if rows.is_empty() {
            return Ok(Self::new(schema, Vec::new()));
        }
        let arrays: Vec<ArrayRef> = (0..columns.len())
            .map(|col| {
                let values: Vec<Option<&str>> = rows
                    .iter()
                    .map(|r| r.get(col).and_then(|cell| cell.as_deref()))
                    .collect();
                Arc::new(StringArray::from(values)) as ArrayRef
            })
            .collect();
        let batch = RecordBatch::try_new(Arc::clone(&schema), arrays)?;
        Ok(Self::new(schema, vec![Arc::new(batch)]))
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[ArrowBatchHandle] {
        &self.batches
    }

    pub fn row_count(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn column_names(&self) -> Vec<String> {
        self.schema.fields().iter().map(|f| f.name().clone()).collect()
    }

    /// Renders up to `limit` rows as display strings, in batch order.
    pub fn rows(&self, limit: usize) -> Result<Vec<Vec<String>>, BackendError> {
        let mut out = Vec::new();
        for batch in &self.batches {
            for row in 0..batch.num_rows() {
                if out.len() >= limit {
                    return Ok(out);
                }
                let mut cells = Vec::with_capacity(batch.num_columns());
                for col in batch.columns() {
                    if col.is_null(row) {
                        cells.push("NULL".to_string());
                    } else {
                        cells.push(array_value_to_string(col.as_ref(), row)?);
                    }
                }
                out.push(cells);
            }
        }
        Ok(out)
    }

    pub fn signature(&self) -> Result<DataSignature, BackendError> {
        Ok(DataSignature::new(
            self.row_count(),
            self.column_names(),
            self.rows(MAX_SAMPLE_ROWS)?,
        ))
    }

    /// Markdown table of the first `max_rows` rows with a truncation footer.
    pub fn to_markdown_table(&self, max_rows: usize) -> Result<String, BackendError> {
        let columns = self.column_names();
        if columns.is_empty() {
            return Ok("No data".into());
        }
        let mut lines = Vec::new();
        lines.push(format!("| {} |", columns.join(" | ")));
        lines.push(format!(
            "| {} |",
            columns.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
        ));
        for row in self.rows(max_rows)? {
            lines.push(format!("| {} |", row.join(" | ")));
        }
        let mut table = lines.join("\n");
        let total = self.row_count();
        if total > max_rows {
            table.push_str(&format!("\n\n*Showing {max_rows} of {total} rows*"));
        }
        Ok(table)
    }
}

fn utf8_schema(columns: &[&str]) -> SchemaRef {
    Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| Field::new(*c, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ))
}

/// The read-only tabular data source. Implementations must refuse writes
/// themselves; callers check statements before they get here too.
#[async_trait]
pub trait DataBackend: Send + Sync {
    async fn execute(&self, statement: &str) -> Result<QueryResult, BackendError>;
}

#[async_trait]
impl<T: DataBackend + ?Sized> DataBackend for Arc<T> {
    async fn execute(&self, statement: &str) -> Result<QueryResult, BackendError> {
        (**self).execute(statement).await
    }
}

/// Backend used when no data source is wired in.
pub struct NullBackend;

#[async_trait]
impl DataBackend for NullBackend {
    async fn execute(&self, _statement: &str) -> Result<QueryResult, BackendError> {
        Err(BackendError::Unavailable("NullBackend has no data".into()))
    }
}
