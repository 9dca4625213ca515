//! Shared value and settings types used across the SQL client boundary and
//! the backup/restore core. No I/O lives here, mirroring the teacher's
//! `common` crate: this is the vocabulary both sides agree on, not a place
//! for behavior.

use std::time::Duration;

/// One cell of a backed-up row.
///
/// A tagged variant with exactly one case populated at a time. Produced by
/// the SQL client's row fetcher, consumed by the chunk codec's column
/// batcher.
#[derive(Clone, Debug, PartialEq)]
pub enum BackupValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
}

impl BackupValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BackupValue::Null)
    }

    /// Textual rendering used by the chunk writer when a column is promoted
    /// to text after a type mismatch (see `backup_core::chunk`).
    pub fn to_text_lossy(&self) -> String {
        match self {
            BackupValue::Null => String::new(),
            BackupValue::Bool(b) => b.to_string(),
            BackupValue::Int(i) => i.to_string(),
            BackupValue::Float(f) => f.to_string(),
            BackupValue::Text(s) => s.clone(),
            BackupValue::Binary(_) => "<binary>".to_string(),
        }
    }
}

/// The dialect a connection speaks. Used to gate dialect-specific quirks
/// (MSSQL decimal-as-text binding, forcing `jobs = 1`, SQLite-only table
/// creation ordering, ...) without the core depending on driver crates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerType {
    Sqlite,
    Mssql,
    Postgres,
    MySql,
    Unknown,
}

impl ServerType {
    /// MSSQL's driver is not safe for concurrent connection establishment
    /// or concurrent query execution across connections; both backup and
    /// restore force worker concurrency down to 1 for this dialect.
    pub fn forces_single_worker(self) -> bool {
        matches!(self, ServerType::Mssql)
    }

    pub fn is_sqlite(self) -> bool {
        matches!(self, ServerType::Sqlite)
    }
}

/// Dialect-neutral column type as carried in the metadata sidecar.
///
/// An unrecognized source type is mapped to `Text` at the scanning layer
/// with a warning; this enum has no "unknown" case of its own — `Text` is
/// the position it falls back to per spec.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind")]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Double,
    Decimal { precision: u32, scale: u32 },
    Boolean,
    Char { size: u32 },
    Varchar { size: u32 },
    Text,
    Date,
    DateTime,
    Timestamp,
    Binary { size: u32 },
    Blob,
    Guid,
}

/// `{maxRetries, initialDelay, backoffMultiplier, maxDelay}` from spec §3.
///
/// Invariant: delay on attempt `k` (0-based) is
/// `min(maxDelay, initialDelay * backoffMultiplier^k)`.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetrySettings {
    /// `delay(k) = min(maxDelay, initialDelay * backoffMultiplier^k)`, 0-based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let scaled = Duration::from_secs_f64(scaled.max(0.0));
        scaled.min(self.max_delay)
    }
}

/// Archive-wide compression choice, applied per ZIP entry. Kept
/// dialect/library-neutral here; `backup-core::archive` maps this onto the
/// `zip` crate's `CompressionMethod`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompressionMethod {
    Stored,
    Deflate,
}

/// `{compressionMethod, compressionLevel (0-9), chunkSizeBytes}` from spec §3.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct BackupSettings {
    pub compression_method: CompressionMethod,
    pub compression_level: u8,
    pub chunk_size_bytes: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            compression_method: CompressionMethod::Deflate,
            compression_level: 6,
            chunk_size_bytes: 10 * 1024 * 1024,
        }
    }
}

/// `{batchSize (100-4000), cacheSizeKB, maxRowsPerCommit, memoryLimitBytes}`
/// from spec §3. When not supplied by the caller, `backup_core::resource`
/// derives this from available memory and worker count per spec §4.9.
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct RestoreSettings {
    pub batch_size: usize,
    pub cache_size_kb: u64,
    pub max_rows_per_commit: usize,
    pub memory_limit_bytes: Option<u64>,
}

impl RestoreSettings {
    /// Clamp to the `[100, 4000]` range spec §3 requires of `batchSize`.
    pub fn clamp_batch_size(value: usize) -> usize {
        value.clamp(100, 4000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_matches_formula() {
        let settings = RetrySettings {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(100),
        };

        assert_eq!(settings.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(settings.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(settings.delay_for_attempt(2), Duration::from_millis(40));
        assert_eq!(settings.delay_for_attempt(3), Duration::from_millis(80));
        // Capped by max_delay from attempt 4 onward (160ms would exceed 100ms).
        assert_eq!(settings.delay_for_attempt(4), Duration::from_millis(100));
    }

    #[test]
    fn batch_size_clamped_to_spec_range() {
        assert_eq!(RestoreSettings::clamp_batch_size(10), 100);
        assert_eq!(RestoreSettings::clamp_batch_size(10_000), 4000);
        assert_eq!(RestoreSettings::clamp_batch_size(500), 500);
    }
}
