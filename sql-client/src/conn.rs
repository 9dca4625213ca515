use crate::error::ClientError;
use crate::formatter::QueryFormatter;
use common::{BackupValue, ServerType};

/// A column-bound buffer for a bulk insert, one element per row plus a
/// parallel "is this NULL" decision folded into `Option`. This is the
/// value the batch manager (`backup_core::batch`) hands to
/// `Statement::execute_batch` — the columnar equivalent of ODBC's
/// column-wise bulk binding (spec §4.4).
#[derive(Clone, Debug)]
pub enum ColumnBuffer {
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    Binary(Vec<Option<Vec<u8>>>),
    Bool(Vec<Option<bool>>),
}

impl ColumnBuffer {
    pub fn len(&self) -> usize {
        match self {
            ColumnBuffer::Int64(v) => v.len(),
            ColumnBuffer::Float64(v) => v.len(),
            ColumnBuffer::Text(v) => v.len(),
            ColumnBuffer::Binary(v) => v.len(),
            ColumnBuffer::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value_at(&self, row: usize) -> BackupValue {
        match self {
            ColumnBuffer::Int64(v) => v[row].map(BackupValue::Int).unwrap_or(BackupValue::Null),
            ColumnBuffer::Float64(v) => v[row].map(BackupValue::Float).unwrap_or(BackupValue::Null),
            ColumnBuffer::Text(v) => v[row].clone().map(BackupValue::Text).unwrap_or(BackupValue::Null),
            ColumnBuffer::Binary(v) => v[row].clone().map(BackupValue::Binary).unwrap_or(BackupValue::Null),
            ColumnBuffer::Bool(v) => v[row].map(BackupValue::Bool).unwrap_or(BackupValue::Null),
        }
    }
}

/// One connection, bound to exactly one dialect for its lifetime. Mirrors
/// spec §1's external boundary: `connect(string) → Conn`,
/// `conn.ServerType()`, `conn.QueryFormatter()`.
pub trait Conn: Send {
    fn server_type(&self) -> ServerType;
    fn query_formatter(&self) -> &dyn QueryFormatter;

    fn execute_direct(&mut self, sql: &str) -> Result<(), ClientError>;

    fn begin_transaction(&mut self) -> Result<(), ClientError>;
    fn commit(&mut self) -> Result<(), ClientError>;
    fn rollback(&mut self) -> Result<(), ClientError>;

    fn prepare<'c>(&'c mut self, sql: &str) -> Result<Box<dyn Statement + 'c>, ClientError>;

    /// Re-applies any dialect-specific per-connection setup (SQLite PRAGMAs,
    /// ...) after a reconnect triggered by the retry policy (spec §4.2).
    fn reapply_session_setup(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

/// `stmt.Prepare/ExecuteDirect/ExecuteBatch/FetchRow` from spec §1.
pub trait Statement {
    /// Executes a query with no parameters and materializes every result
    /// row. Used for paginated `SELECT`s, where the page size already
    /// bounds how much this holds in memory at once.
    fn query_all(&mut self) -> Result<Vec<Vec<BackupValue>>, ClientError>;

    /// Executes a statement that produces no rows (INSERT/UPDATE/DDL) and
    /// returns the number of affected rows.
    fn execute(&mut self) -> Result<u64, ClientError>;

    /// Executes the prepared statement once per row described by `columns`
    /// (`row_count` rows across all columns), as a single logical bulk
    /// insert (spec §4.4).
    fn execute_batch(&mut self, columns: &[ColumnBuffer], row_count: usize) -> Result<u64, ClientError>;
}
