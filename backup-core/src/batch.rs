//! Column-bound bulk insert buffering (spec §4.4), grounded in the
//! original `BatchManager`'s `PushRow`/`PushBatch`/`Flush` plus its
//! caller-supplied `BatchExecutor` closure.

use common::{BackupValue, ColumnType, ServerType};
use sql_client::{ClientError, ColumnBuffer, ColumnDescriptor, QueryFormatter};

/// Executes one bound batch and returns the affected row count. Kept as a
/// plain closure type rather than a trait so callers can close over their
/// `Conn`/`Statement` however fits the worker loop calling it.
pub type BatchExecutor<'a> = dyn FnMut(&[ColumnBuffer], usize) -> Result<u64, ClientError> + 'a;

/// Buffers rows column-wise until `capacity` is reached (or the caller asks
/// for an explicit flush), then drives one `execute_batch` call for the
/// whole buffer instead of one round trip per row.
pub struct BatchManager {
    server_type: ServerType,
    columns: Vec<ColumnDescriptor>,
    buffers: Vec<ColumnBuffer>,
    row_count: usize,
    capacity: usize,
    insert_sql: String,
}

fn empty_buffer_for(server_type: ServerType, column_type: &ColumnType) -> ColumnBuffer {
    match column_type {
        ColumnType::TinyInt | ColumnType::SmallInt | ColumnType::Integer | ColumnType::BigInt => {
            ColumnBuffer::Int64(Vec::new())
        }
        ColumnType::Float | ColumnType::Double => ColumnBuffer::Float64(Vec::new()),
        // MSSQL loses precision binding DECIMAL through its native numeric
        // bind; the original backs off to text + `CONVERT` on read, and the
        // write side mirrors that by binding decimal as text too (spec §4.4).
        ColumnType::Decimal { .. } if server_type == ServerType::Mssql => ColumnBuffer::Text(Vec::new()),
        ColumnType::Decimal { .. } => ColumnBuffer::Float64(Vec::new()),
        ColumnType::Boolean => ColumnBuffer::Bool(Vec::new()),
        ColumnType::Char { .. }
        | ColumnType::Varchar { .. }
        | ColumnType::Text
        | ColumnType::Date
        | ColumnType::DateTime
        | ColumnType::Timestamp
        | ColumnType::Guid => ColumnBuffer::Text(Vec::new()),
        // A declared size of 0 means "unbounded" for MSSQL LOB columns;
        // since buffers here are plain `Vec<u8>` rather than fixed-size
        // bind buffers there is no truncation to substitute around.
        ColumnType::Binary { .. } | ColumnType::Blob => ColumnBuffer::Binary(Vec::new()),
    }
}

fn push_value(buffer: &mut ColumnBuffer, value: &BackupValue) {
    match buffer {
        ColumnBuffer::Int64(v) => v.push(to_int64(value)),
        ColumnBuffer::Float64(v) => v.push(to_float64(value)),
        ColumnBuffer::Text(v) => v.push(to_text(value)),
        ColumnBuffer::Binary(v) => v.push(to_binary(value)),
        ColumnBuffer::Bool(v) => v.push(to_bool(value)),
    }
}

fn to_int64(value: &BackupValue) -> Option<i64> {
    match value {
        BackupValue::Null => None,
        BackupValue::Bool(b) => Some(*b as i64),
        BackupValue::Int(i) => Some(*i),
        BackupValue::Float(f) => Some(*f as i64),
        BackupValue::Text(s) => s.parse().ok(),
        BackupValue::Binary(_) => None,
    }
}

fn to_float64(value: &BackupValue) -> Option<f64> {
    match value {
        BackupValue::Null => None,
        BackupValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        BackupValue::Int(i) => Some(*i as f64),
        BackupValue::Float(f) => Some(*f),
        BackupValue::Text(s) => s.parse().ok(),
        BackupValue::Binary(_) => None,
    }
}

fn to_bool(value: &BackupValue) -> Option<bool> {
    match value {
        BackupValue::Null => None,
        BackupValue::Bool(b) => Some(*b),
        BackupValue::Int(i) => Some(*i != 0),
        BackupValue::Float(f) => Some(*f != 0.0),
        BackupValue::Text(s) => Some(s == "1" || s.eq_ignore_ascii_case("true")),
        BackupValue::Binary(_) => None,
    }
}

fn to_text(value: &BackupValue) -> Option<String> {
    match value {
        BackupValue::Null => None,
        other => Some(other.to_text_lossy()),
    }
}

fn to_binary(value: &BackupValue) -> Option<Vec<u8>> {
    match value {
        BackupValue::Null => None,
        BackupValue::Binary(b) => Some(b.clone()),
        BackupValue::Text(s) => Some(s.clone().into_bytes()),
        _ => None,
    }
}

fn clear_buffer(buffer: &mut ColumnBuffer) {
    match buffer {
        ColumnBuffer::Int64(v) => v.clear(),
        ColumnBuffer::Float64(v) => v.clear(),
        ColumnBuffer::Text(v) => v.clear(),
        ColumnBuffer::Binary(v) => v.clear(),
        ColumnBuffer::Bool(v) => v.clear(),
    }
}

impl BatchManager {
    pub fn new(
        server_type: ServerType,
        schema: &str,
        table: &str,
        columns: &[ColumnDescriptor],
        formatter: &dyn QueryFormatter,
        capacity: usize,
    ) -> Self {
        let field_names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let insert_sql = formatter.insert_statement(schema, table, &field_names);
        let buffers = columns.iter().map(|c| empty_buffer_for(server_type, &c.column_type)).collect();
        Self { server_type, columns: columns.to_vec(), buffers, row_count: 0, capacity: capacity.max(1), insert_sql }
    }

    pub fn insert_sql(&self) -> &str {
        &self.insert_sql
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn is_full(&self) -> bool {
        self.row_count >= self.capacity
    }

    /// Appends one row's values, in the same order as `columns` passed to
    /// [`Self::new`]. Does not flush by itself — callers check
    /// [`Self::is_full`] and call [`Self::flush`] between rows, mirroring
    /// `PushRow` in the original.
    pub fn push_row(&mut self, values: &[BackupValue]) {
        debug_assert_eq!(values.len(), self.buffers.len());
        for (buffer, value) in self.buffers.iter_mut().zip(values) {
            push_value(buffer, value);
        }
        self.row_count += 1;
    }

    /// Pushes every row in `rows`, flushing through `executor` whenever the
    /// buffer reaches capacity. Returns the total affected row count,
    /// including any trailing partial batch left unflushed by this call.
    pub fn push_batch(&mut self, rows: &[Vec<BackupValue>], executor: &mut BatchExecutor<'_>) -> Result<u64, ClientError> {
        let mut affected = 0u64;
        for row in rows {
            self.push_row(row);
            if self.is_full() {
                affected += self.flush(executor)?;
            }
        }
        Ok(affected)
    }

    /// Executes the buffered rows as one batch and clears the buffer. A
    /// no-op returning `Ok(0)` when the buffer is empty.
    pub fn flush(&mut self, executor: &mut BatchExecutor<'_>) -> Result<u64, ClientError> {
        if self.row_count == 0 {
            return Ok(0);
        }
        let affected = executor(&self.buffers, self.row_count)?;
        for buffer in &mut self.buffers {
            clear_buffer(buffer);
        }
        self.row_count = 0;
        Ok(affected)
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }
}
