use crate::conn::{ColumnBuffer, Conn, Statement};
use crate::error::{ClientError, SqlErrorKind};
use crate::formatter::{QueryFormatter, SqliteFormatter};
use common::{BackupValue, ServerType};
use rusqlite::types::ValueRef;
use rusqlite::Connection;

/// The one concrete, driver-backed `Conn` implementation in this crate.
/// Stands in for the out-of-scope multi-dialect driver layer (spec §1):
/// everything in `backup-core` talks to this through the `Conn`/`Statement`
/// traits only, never through `rusqlite` directly.
pub struct SqliteConn {
    conn: Connection,
    formatter: SqliteFormatter,
}

impl SqliteConn {
    pub fn open(path: &str) -> Result<Self, ClientError> {
        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        Ok(Self { conn, formatter: SqliteFormatter })
    }

    pub fn inner(&self) -> &Connection {
        &self.conn
    }
}

fn classify_sqlite_error(err: &rusqlite::Error) -> SqlErrorKind {
    match err {
        rusqlite::Error::SqliteFailure(code, msg) => {
            if code.code == rusqlite::ErrorCode::DatabaseBusy
                || code.code == rusqlite::ErrorCode::DatabaseLocked
                || msg.as_deref().is_some_and(|m| m.contains("database is locked"))
            {
                SqlErrorKind::Locked
            } else if code.code == rusqlite::ErrorCode::CannotOpen {
                SqlErrorKind::Connection
            } else {
                SqlErrorKind::Other
            }
        }
        _ => SqlErrorKind::Other,
    }
}

impl Conn for SqliteConn {
    fn server_type(&self) -> ServerType {
        ServerType::Sqlite
    }

    fn query_formatter(&self) -> &dyn QueryFormatter {
        &self.formatter
    }

    fn execute_direct(&mut self, sql: &str) -> Result<(), ClientError> {
        self.conn.execute_batch(sql).map_err(|e| {
            let kind = classify_sqlite_error(&e);
            ClientError::Sql { kind, message: e.to_string() }
        })
    }

    fn begin_transaction(&mut self) -> Result<(), ClientError> {
        self.execute_direct("BEGIN")
    }

    fn commit(&mut self) -> Result<(), ClientError> {
        self.execute_direct("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), ClientError> {
        self.execute_direct("ROLLBACK")
    }

    fn prepare<'c>(&'c mut self, sql: &str) -> Result<Box<dyn Statement + 'c>, ClientError> {
        Ok(Box::new(SqliteStatement { conn: &self.conn, sql: sql.to_string() }))
    }

    fn reapply_session_setup(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

struct SqliteStatement<'c> {
    conn: &'c Connection,
    sql: String,
}

fn value_ref_to_backup_value(value: ValueRef<'_>) -> BackupValue {
    match value {
        ValueRef::Null => BackupValue::Null,
        ValueRef::Integer(i) => BackupValue::Int(i),
        ValueRef::Real(f) => BackupValue::Float(f),
        ValueRef::Text(t) => BackupValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => BackupValue::Binary(b.to_vec()),
    }
}

impl<'c> Statement for SqliteStatement<'c> {
    fn query_all(&mut self) -> Result<Vec<Vec<BackupValue>>, ClientError> {
        let mut stmt = self.conn.prepare(&self.sql).map_err(|e| ClientError::Sql {
            kind: classify_sqlite_error(&e),
            message: e.to_string(),
        })?;
        let column_count = stmt.column_count();
        let mut rows = stmt
            .query([])
            .map_err(|e| ClientError::Sql { kind: classify_sqlite_error(&e), message: e.to_string() })?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| ClientError::Sql {
            kind: classify_sqlite_error(&e),
            message: e.to_string(),
        })? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value_ref = row.get_ref(i).map_err(|e| ClientError::Sql {
                    kind: classify_sqlite_error(&e),
                    message: e.to_string(),
                })?;
                values.push(value_ref_to_backup_value(value_ref));
            }
            out.push(values);
        }
        Ok(out)
    }

    fn execute(&mut self) -> Result<u64, ClientError> {
        self.conn
            .execute(&self.sql, [])
            .map(|n| n as u64)
            .map_err(|e| ClientError::Sql { kind: classify_sqlite_error(&e), message: e.to_string() })
    }

    fn execute_batch(&mut self, columns: &[ColumnBuffer], row_count: usize) -> Result<u64, ClientError> {
        let mut stmt = self.conn.prepare(&self.sql).map_err(|e| ClientError::Sql {
            kind: classify_sqlite_error(&e),
            message: e.to_string(),
        })?;
        let mut affected = 0u64;
        for row in 0..row_count {
            let params = columns
                .iter()
                .map(|c| backup_value_to_sql(&c.value_at(row)))
                .collect::<Vec<_>>();
            let param_refs = params.iter().map(|p| p as &dyn rusqlite::ToSql).collect::<Vec<_>>();
            affected += stmt
                .execute(param_refs.as_slice())
                .map(|n| n as u64)
                .map_err(|e| ClientError::Sql { kind: classify_sqlite_error(&e), message: e.to_string() })?;
        }
        Ok(affected)
    }
}

enum SqlParam {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl rusqlite::ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value};
        Ok(match self {
            SqlParam::Null => ToSqlOutput::Owned(Value::Null),
            SqlParam::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlParam::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlParam::Text(s) => ToSqlOutput::Owned(Value::Text(s.clone())),
            SqlParam::Blob(b) => ToSqlOutput::Owned(Value::Blob(b.clone())),
        })
    }
}

fn backup_value_to_sql(value: &BackupValue) -> SqlParam {
    match value {
        BackupValue::Null => SqlParam::Null,
        BackupValue::Bool(b) => SqlParam::Int(*b as i64),
        BackupValue::Int(i) => SqlParam::Int(*i),
        BackupValue::Float(f) => SqlParam::Float(*f),
        BackupValue::Text(s) => SqlParam::Text(s.clone()),
        BackupValue::Binary(b) => SqlParam::Blob(b.clone()),
    }
}

/// `connect(string) → Conn` from spec §1, specialized to the one dialect
/// this crate wires up end to end.
pub fn connect(connection_string: &str) -> Result<SqliteConn, ClientError> {
    SqliteConn::open(connection_string)
}
