use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use crate::{BackendError, DataBackend, QueryResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A SQLite database opened read-only. Every column comes back as text;
/// SQL NULL stays null.
pub struct SqliteBackend {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Opens an existing database file. Missing files are an error, never created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags)
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", path.display())))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        tracing::info!(path = %path.display(), "opened sqlite database read-only");
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DataBackend for SqliteBackend {
    async fn execute(&self, statement: &str) -> Result<QueryResult, BackendError> {
        let conn = Arc::clone(&self.conn);
        let statement = statement.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| BackendError::Unavailable("sqlite connection poisoned".into()))?;
            query(&conn, &statement)
        })
        .await
        .map_err(|e| BackendError::Unavailable(format!("sqlite worker failed: {e}")))?
    }
}

fn query(conn: &Connection, statement: &str) -> Result<QueryResult, BackendError> {
    let mut stmt = conn.prepare(statement).map_err(query_error)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query([]).map_err(query_error)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(query_error)? {
        let cells = (0..columns.len())
            .map(|i| row.get_ref(i).map(text))
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_error)?;
        out.push(cells);
    }
    let names: Vec<&str> = columns.iter().map(String::as_str).collect();
    QueryResult::from_nullable_rows(&names, out)
}

fn text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Some(format!("<{} bytes>", bytes.len())),
    }
}

fn query_error(e: rusqlite::Error) -> BackendError {
    BackendError::Query(e.to_string())
}
