//! Columnar MessagePack chunk codec (spec §4.1).
//!
//! Each chunk is `Array[numCols]` of `Map{"t": type, "d": data, "n": nulls}`.
//! `i64`/`f64` columns are packed into a single `Bin` of big-endian values;
//! the null mask (and, for parity with external producers, boolean data
//! columns) is packed into `Array(2)[count, Bin(packedBits)]`, bit `i` at
//! `packed[i/8]`, bit `7 - i%8`. A reader must still accept the legacy
//! `Array(N)[bool, bool, ...]` encoding of a boolean column.

use std::io::Cursor;

use common::BackupValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("malformed chunk: {0}")]
    Malformed(String),
}

type Result<T> = std::result::Result<T, ChunkError>;

/// One column's accumulated values, lazily typed from the first non-NULL
/// value written to it. Mirrors `ColumnBatch::ColumnData` (spec §4.1): a
/// closed set of five value-vector variants plus the "nothing written yet"
/// state.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnData {
    Uninit,
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Text(Vec<String>),
    Binary(Vec<Vec<u8>>),
    Bool(Vec<bool>),
}

impl ColumnData {
    fn type_tag(&self) -> &'static str {
        match self {
            ColumnData::Uninit => "nil",
            ColumnData::Int64(_) => "i64",
            ColumnData::Float64(_) => "f64",
            ColumnData::Text(_) => "str",
            ColumnData::Binary(_) => "bin",
            ColumnData::Bool(_) => "bool",
        }
    }
}

/// A batch of rows in column-oriented layout, with a parallel null mask per
/// column (spec §4.1's `ColumnBatch`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColumnBatch {
    pub row_count: usize,
    pub columns: Vec<ColumnData>,
    pub null_indicators: Vec<Vec<bool>>,
}

impl ColumnBatch {
    pub fn clear(&mut self) {
        self.row_count = 0;
        for col in &mut self.columns {
            *col = ColumnData::Uninit;
        }
        for nulls in &mut self.null_indicators {
            nulls.clear();
        }
    }

    /// Reconstructs row-oriented `BackupValue`s from this column-oriented
    /// batch, honoring each column's null mask. Used by restore to hand
    /// rows to the batch manager.
    pub fn to_rows(&self) -> Vec<Vec<BackupValue>> {
        let mut rows = vec![Vec::with_capacity(self.columns.len()); self.row_count];
        for (col_idx, col) in self.columns.iter().enumerate() {
            let nulls = &self.null_indicators[col_idx];
            for row_idx in 0..self.row_count {
                let is_null = nulls.get(row_idx).copied().unwrap_or(false);
                let value = if is_null {
                    BackupValue::Null
                } else {
                    match col {
                        ColumnData::Uninit => BackupValue::Null,
                        ColumnData::Int64(v) => BackupValue::Int(v[row_idx]),
                        ColumnData::Float64(v) => BackupValue::Float(v[row_idx]),
                        ColumnData::Text(v) => BackupValue::Text(v[row_idx].clone()),
                        ColumnData::Binary(v) => BackupValue::Binary(v[row_idx].clone()),
                        ColumnData::Bool(v) => BackupValue::Bool(v[row_idx]),
                    }
                };
                rows[row_idx].push(value);
            }
        }
        rows
    }
}

/// Appends one cell to a column, initializing its type on first write and
/// promoting it to `Text` on a type mismatch (spec §9's acknowledged lossy
/// promotion; binary values promote to the literal `"<binary>"`).
fn append_to_column(col: &mut ColumnData, nulls: &mut Vec<bool>, value: &BackupValue) {
    if matches!(value, BackupValue::Null) {
        nulls.push(true);
        match col {
            ColumnData::Uninit => {}
            ColumnData::Int64(v) => v.push(0),
            ColumnData::Float64(v) => v.push(0.0),
            ColumnData::Text(v) => v.push(String::new()),
            ColumnData::Binary(v) => v.push(Vec::new()),
            ColumnData::Bool(v) => v.push(false),
        }
        return;
    }
    nulls.push(false);

    if matches!(col, ColumnData::Uninit) {
        *col = match value {
            BackupValue::Bool(b) => ColumnData::Bool(vec![false; nulls.len() - 1].tap_push(*b)),
            BackupValue::Int(i) => ColumnData::Int64(vec![0; nulls.len() - 1].tap_push(*i)),
            BackupValue::Float(f) => ColumnData::Float64(vec![0.0; nulls.len() - 1].tap_push(*f)),
            BackupValue::Text(s) => ColumnData::Text(vec![String::new(); nulls.len() - 1].tap_push(s.clone())),
            BackupValue::Binary(b) => ColumnData::Binary(vec![Vec::new(); nulls.len() - 1].tap_push(b.clone())),
            BackupValue::Null => unreachable!(),
        };
        return;
    }

    match (&mut *col, value) {
        (ColumnData::Bool(v), BackupValue::Bool(b)) => v.push(*b),
        (ColumnData::Int64(v), BackupValue::Int(i)) => v.push(*i),
        (ColumnData::Float64(v), BackupValue::Float(f)) => v.push(*f),
        (ColumnData::Text(v), BackupValue::Text(s)) => v.push(s.clone()),
        (ColumnData::Binary(v), BackupValue::Binary(b)) => v.push(b.clone()),
        _ => promote_and_append(col, value),
    }
}

/// Converts the existing column to `Text` (if not already) and appends
/// `value`'s textual rendering.
fn promote_and_append(col: &mut ColumnData, value: &BackupValue) {
    if !matches!(col, ColumnData::Text(_)) {
        let as_strings: Vec<String> = match col {
            ColumnData::Uninit => Vec::new(),
            ColumnData::Int64(v) => v.iter().map(|x| x.to_string()).collect(),
            ColumnData::Float64(v) => v.iter().map(|x| x.to_string()).collect(),
            ColumnData::Bool(v) => v.iter().map(|x| x.to_string()).collect(),
            ColumnData::Binary(v) => v.iter().map(|_| "<binary>".to_string()).collect(),
            ColumnData::Text(v) => v.clone(),
        };
        *col = ColumnData::Text(as_strings);
    }
    if let ColumnData::Text(v) = col {
        match value {
            BackupValue::Binary(_) => v.push("<binary>".to_string()),
            other => v.push(other.to_text_lossy()),
        }
    }
}

/// Tiny builder helper: push one element onto an owned `Vec` and return it.
trait TapPush<T> {
    fn tap_push(self, value: T) -> Self;
}

impl<T> TapPush<T> for Vec<T> {
    fn tap_push(mut self, value: T) -> Self {
        self.push(value);
        self
    }
}

/// Buffers rows, serializing them to the packed columnar MessagePack layout
/// on `flush`. One writer produces one `data/<table>/chunk_NNNNN.msgpack`
/// archive entry.
pub struct ChunkWriter {
    limit_bytes: usize,
    batch: ColumnBatch,
    estimated_bytes: usize,
}

const MAX_ROWS_PER_CHUNK: usize = 100_000;

impl ChunkWriter {
    pub fn new(limit_bytes: usize) -> Self {
        Self { limit_bytes, batch: ColumnBatch::default(), estimated_bytes: 0 }
    }

    pub fn write_row(&mut self, row: &[BackupValue]) {
        if self.batch.columns.is_empty() {
            self.batch.columns = vec![ColumnData::Uninit; row.len()];
            self.batch.null_indicators = vec![Vec::new(); row.len()];
        }

        for (i, value) in row.iter().enumerate() {
            append_to_column(&mut self.batch.columns[i], &mut self.batch.null_indicators[i], value);
            self.estimated_bytes += match value {
                BackupValue::Text(s) => s.len() + 5,
                BackupValue::Binary(b) => b.len() + 5,
                BackupValue::Null => 1,
                _ => 9,
            };
        }
        self.batch.row_count += 1;
    }

    pub fn is_chunk_full(&self) -> bool {
        self.estimated_bytes >= self.limit_bytes || self.batch.row_count >= MAX_ROWS_PER_CHUNK
    }

    pub fn is_empty(&self) -> bool {
        self.batch.row_count == 0
    }

    pub fn clear(&mut self) {
        self.batch.clear();
        self.estimated_bytes = 0;
    }

    /// Serializes the buffered batch and clears internal state. Returns an
    /// empty `Vec` (callers should skip writing a zero-row chunk) when
    /// nothing has been written since the last flush.
    pub fn flush(&mut self) -> Result<Vec<u8>> {
        if self.batch.row_count == 0 {
            self.clear();
            return Ok(Vec::new());
        }

        let mut buffer = Vec::new();
        let num_cols = self.batch.columns.len();
        rmp::encode::write_array_len(&mut buffer, num_cols as u32).map_err(encode_err)?;

        for i in 0..num_cols {
            write_column(&mut buffer, &self.batch.columns[i], &self.batch.null_indicators[i])?;
        }

        self.clear();
        Ok(buffer)
    }
}

fn write_column(buffer: &mut Vec<u8>, col: &ColumnData, nulls: &[bool]) -> Result<()> {
    rmp::encode::write_map_len(buffer, 3).map_err(encode_err)?;

    rmp::encode::write_str(buffer, "t").map_err(encode_err)?;
    rmp::encode::write_str(buffer, col.type_tag()).map_err(encode_err)?;

    rmp::encode::write_str(buffer, "d").map_err(encode_err)?;
    match col {
        ColumnData::Uninit => rmp::encode::write_nil(buffer).map_err(encode_err)?,
        ColumnData::Int64(v) => write_packed_be(buffer, v, |x| x.to_be_bytes())?,
        ColumnData::Float64(v) => write_packed_be(buffer, v, |x| x.to_bits().to_be_bytes())?,
        ColumnData::Bool(v) => write_bit_packed(buffer, v)?,
        ColumnData::Text(v) => {
            rmp::encode::write_array_len(buffer, v.len() as u32).map_err(encode_err)?;
            for s in v {
                rmp::encode::write_str(buffer, s).map_err(encode_err)?;
            }
        }
        ColumnData::Binary(v) => {
            rmp::encode::write_array_len(buffer, v.len() as u32).map_err(encode_err)?;
            for b in v {
                rmp::encode::write_bin(buffer, b).map_err(encode_err)?;
            }
        }
    }

    rmp::encode::write_str(buffer, "n").map_err(encode_err)?;
    write_bit_packed(buffer, nulls)?;

    Ok(())
}

fn write_packed_be<T: Copy, const N: usize>(
    buffer: &mut Vec<u8>,
    values: &[T],
    to_be: impl Fn(T) -> [u8; N],
) -> Result<()> {
    let mut bytes = Vec::with_capacity(values.len() * N);
    for v in values {
        bytes.extend_from_slice(&to_be(*v));
    }
    rmp::encode::write_bin(buffer, &bytes).map_err(encode_err)
}

fn write_bit_packed(buffer: &mut Vec<u8>, bits: &[bool]) -> Result<()> {
    rmp::encode::write_array_len(buffer, 2).map_err(encode_err)?;
    rmp::encode::write_uint(buffer, bits.len() as u64).map_err(encode_err)?;

    let packed_len = bits.len().div_ceil(8);
    let mut packed = vec![0u8; packed_len];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            packed[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    rmp::encode::write_bin(buffer, &packed).map_err(encode_err)
}

fn encode_err(e: impl std::fmt::Debug) -> ChunkError {
    ChunkError::Malformed(format!("{e:?}"))
}

/// Reads chunks back out of a single archive entry's raw bytes.
pub struct ChunkReader {
    buffer: Vec<u8>,
    position: u64,
}

impl ChunkReader {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { buffer: bytes, position: 0 }
    }

    /// Reads the next batch, or `None` at end of stream.
    pub fn read_batch(&mut self) -> Result<Option<ColumnBatch>> {
        if self.position as usize >= self.buffer.len() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(self.buffer.as_slice());
        cursor.set_position(self.position);

        let num_cols = rmp::decode::read_array_len(&mut cursor).map_err(decode_err)? as usize;
        let mut columns = Vec::with_capacity(num_cols);
        let mut null_indicators = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let map_len = rmp::decode::read_map_len(&mut cursor).map_err(decode_err)?;
            let mut type_tag = String::new();
            let mut data = ColumnData::Uninit;
            let mut nulls = Vec::new();

            for _ in 0..map_len {
                let key = read_str(&mut cursor)?;
                match key.as_str() {
                    "t" => type_tag = read_str(&mut cursor)?,
                    "d" => data = read_column_data(&mut cursor, &type_tag)?,
                    "n" => nulls = read_bool_array(&mut cursor)?,
                    _ => return Err(ChunkError::Malformed(format!("unknown chunk column key '{key}'"))),
                }
            }

            columns.push(data);
            null_indicators.push(nulls);
        }

        self.position = cursor.position();

        let row_count = null_indicators.first().map(|n| n.len()).unwrap_or(0);
        Ok(Some(ColumnBatch { row_count, columns, null_indicators }))
    }
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = rmp::decode::read_str_len(cursor).map_err(decode_err)? as usize;
    let start = cursor.position() as usize;
    let end = start + len;
    let bytes = cursor.get_ref().get(start..end).ok_or_else(|| ChunkError::Malformed("unexpected EOF in string".into()))?;
    let s = String::from_utf8_lossy(bytes).into_owned();
    cursor.set_position(end as u64);
    Ok(s)
}

fn read_bin(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = rmp::decode::read_bin_len(cursor).map_err(decode_err)? as usize;
    let start = cursor.position() as usize;
    let end = start + len;
    let bytes = cursor.get_ref().get(start..end).ok_or_else(|| ChunkError::Malformed("unexpected EOF in binary".into()))?;
    cursor.set_position(end as u64);
    Ok(bytes.to_vec())
}

fn read_column_data(cursor: &mut Cursor<&[u8]>, type_tag: &str) -> Result<ColumnData> {
    match type_tag {
        "nil" => {
            rmp::decode::read_nil(cursor).map_err(decode_err)?;
            Ok(ColumnData::Uninit)
        }
        "i64" => {
            let bytes = read_bin(cursor)?;
            let values = bytes.chunks_exact(8).map(|c| i64::from_be_bytes(c.try_into().unwrap())).collect();
            Ok(ColumnData::Int64(values))
        }
        "f64" => {
            let bytes = read_bin(cursor)?;
            let values = bytes
                .chunks_exact(8)
                .map(|c| f64::from_bits(u64::from_be_bytes(c.try_into().unwrap())))
                .collect();
            Ok(ColumnData::Float64(values))
        }
        "str" => {
            let len = rmp::decode::read_array_len(cursor).map_err(decode_err)?;
            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                values.push(read_str(cursor)?);
            }
            Ok(ColumnData::Text(values))
        }
        "bin" => {
            let len = rmp::decode::read_array_len(cursor).map_err(decode_err)?;
            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                values.push(read_bin(cursor)?);
            }
            Ok(ColumnData::Binary(values))
        }
        "bool" => Ok(ColumnData::Bool(read_bool_array(cursor)?)),
        other => Err(ChunkError::Malformed(format!("unknown column type tag '{other}'"))),
    }
}

/// Reads either the packed `[count, Bin(packedBits)]` encoding this writer
/// always produces, or the legacy `[bool, bool, ...]` encoding an older
/// producer may have emitted (spec §8.2). Distinguished by peeking the
/// first element's marker only when the outer array has exactly 2 entries.
fn read_bool_array(cursor: &mut Cursor<&[u8]>) -> Result<Vec<bool>> {
    let len = rmp::decode::read_array_len(cursor).map_err(decode_err)?;

    let is_packed = if len == 2 {
        let pos = cursor.position() as usize;
        match cursor.get_ref().get(pos) {
            Some(marker) => *marker != 0xC2 && *marker != 0xC3,
            None => return Err(ChunkError::Malformed("unexpected EOF peeking bool array".into())),
        }
    } else {
        false
    };

    if is_packed {
        let count = rmp::decode::read_int::<u64, _>(cursor).map_err(decode_err)? as usize;
        let packed = read_bin(cursor)?;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let byte = packed.get(i / 8).copied().unwrap_or(0);
            out.push((byte >> (7 - (i % 8))) & 1 != 0);
        }
        Ok(out)
    } else {
        let mut out = Vec::with_capacity(len as usize);
        for _ in 0..len {
            out.push(rmp::decode::read_bool(cursor).map_err(decode_err)?);
        }
        Ok(out)
    }
}

fn decode_err(e: impl std::fmt::Debug) -> ChunkError {
    ChunkError::Malformed(format!("{e:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_homogeneous_int_column() {
        let mut writer = ChunkWriter::new(10 * 1024 * 1024);
        writer.write_row(&[BackupValue::Int(1), BackupValue::Null]);
        writer.write_row(&[BackupValue::Int(2), BackupValue::Text("x".into())]);
        let bytes = writer.flush().unwrap();

        let mut reader = ChunkReader::new(bytes);
        let batch = reader.read_batch().unwrap().unwrap();
        assert_eq!(batch.row_count, 2);
        assert_eq!(batch.columns[0], ColumnData::Int64(vec![1, 2]));
        assert_eq!(batch.null_indicators[0], vec![false, false]);
        assert_eq!(batch.null_indicators[1], vec![true, false]);
        assert!(reader.read_batch().unwrap().is_none());
    }

    #[test]
    fn round_trips_float_and_bool_and_binary_columns() {
        let mut writer = ChunkWriter::new(10 * 1024 * 1024);
        writer.write_row(&[BackupValue::Float(1.5), BackupValue::Bool(true), BackupValue::Binary(vec![1, 2, 3])]);
        writer.write_row(&[BackupValue::Float(-2.25), BackupValue::Bool(false), BackupValue::Binary(vec![])]);
        let bytes = writer.flush().unwrap();

        let mut reader = ChunkReader::new(bytes);
        let batch = reader.read_batch().unwrap().unwrap();
        assert_eq!(batch.columns[0], ColumnData::Float64(vec![1.5, -2.25]));
        assert_eq!(batch.columns[1], ColumnData::Bool(vec![true, false]));
        assert_eq!(batch.columns[2], ColumnData::Binary(vec![vec![1, 2, 3], vec![]]));
    }

    #[test]
    fn heterogeneous_column_promotes_to_text() {
        let mut writer = ChunkWriter::new(10 * 1024 * 1024);
        writer.write_row(&[BackupValue::Int(1)]);
        writer.write_row(&[BackupValue::Text("two".into())]);
        let bytes = writer.flush().unwrap();

        let mut reader = ChunkReader::new(bytes);
        let batch = reader.read_batch().unwrap().unwrap();
        assert_eq!(batch.columns[0], ColumnData::Text(vec!["1".to_string(), "two".to_string()]));
    }

    #[test]
    fn reads_legacy_bool_per_element_encoding() {
        let mut buffer = Vec::new();
        rmp::encode::write_array_len(&mut buffer, 3).unwrap();
        rmp::encode::write_bool(&mut buffer, true).unwrap();
        rmp::encode::write_bool(&mut buffer, false).unwrap();
        rmp::encode::write_bool(&mut buffer, true).unwrap();

        let mut cursor = Cursor::new(buffer.as_slice());
        let result = read_bool_array(&mut cursor).unwrap();
        assert_eq!(result, vec![true, false, true]);
    }

    #[test]
    fn legacy_and_packed_bool_encodings_agree() {
        let bits = vec![true, false, true, true, false, false, true, false, true];

        let mut packed_buffer = Vec::new();
        write_bit_packed(&mut packed_buffer, &bits).unwrap();
        let mut packed_cursor = Cursor::new(packed_buffer.as_slice());
        assert_eq!(read_bool_array(&mut packed_cursor).unwrap(), bits);

        let mut legacy_buffer = Vec::new();
        rmp::encode::write_array_len(&mut legacy_buffer, bits.len() as u32).unwrap();
        for b in &bits {
            rmp::encode::write_bool(&mut legacy_buffer, *b).unwrap();
        }
        let mut legacy_cursor = Cursor::new(legacy_buffer.as_slice());
        assert_eq!(read_bool_array(&mut legacy_cursor).unwrap(), bits);
    }

    #[test]
    fn empty_write_flushes_to_nothing() {
        let mut writer = ChunkWriter::new(1024);
        assert!(writer.is_empty());
        assert_eq!(writer.flush().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn to_rows_reconstructs_row_oriented_values_with_nulls() {
        let mut writer = ChunkWriter::new(10 * 1024 * 1024);
        writer.write_row(&[BackupValue::Int(1), BackupValue::Null]);
        writer.write_row(&[BackupValue::Int(2), BackupValue::Text("x".into())]);
        let bytes = writer.flush().unwrap();

        let mut reader = ChunkReader::new(bytes);
        let batch = reader.read_batch().unwrap().unwrap();
        let rows = batch.to_rows();
        assert_eq!(rows, vec![
            vec![BackupValue::Int(1), BackupValue::Null],
            vec![BackupValue::Int(2), BackupValue::Text("x".into())],
        ]);
    }

    #[test]
    fn chunk_becomes_full_past_row_limit() {
        let mut writer = ChunkWriter::new(usize::MAX);
        for i in 0..MAX_ROWS_PER_CHUNK {
            writer.write_row(&[BackupValue::Int(i as i64)]);
        }
        assert!(writer.is_chunk_full());
    }
}
