use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use backup_core::{BackupOptions, NullProgressManager, RestoreOptions};
use common::{BackupSettings, CompressionMethod, RestoreSettings, RetrySettings};
use sql_client::{ClientError, ColumnBuffer, Conn, QueryFormatter, ServerType, SqlErrorKind, SqliteConn, Statement};
use tempfile::NamedTempFile;

/// Tests run with `RUST_LOG=backup_core=debug` print the same progress the
/// engine would emit to a production log, alongside the `ProgressManager`
/// events each scenario already asserts on.
pub fn init_logging() {
    let _ = env_logger::try_init();
}

pub fn temp_db_path() -> (NamedTempFile, String) {
    let file = NamedTempFile::new().expect("create temp db file");
    let path = file.path().to_string_lossy().into_owned();
    (file, path)
}

pub fn open(path: &str) -> Box<dyn Conn> {
    Box::new(SqliteConn::open(path).expect("open sqlite connection"))
}

pub fn connector(path: String) -> impl Fn() -> Result<Box<dyn Conn>, ClientError> + Sync {
    move || SqliteConn::open(&path).map(|c| Box::new(c) as Box<dyn Conn>)
}

pub fn fast_retry() -> RetrySettings {
    RetrySettings {
        max_retries: 3,
        initial_delay: std::time::Duration::from_millis(1),
        backoff_multiplier: 2.0,
        max_delay: std::time::Duration::from_millis(20),
    }
}

pub fn stored_backup_settings() -> BackupSettings {
    // Stored (no compression) so S7 can flip a byte in a chunk payload
    // without fighting Deflate's framing.
    stored_backup_settings_with_chunk_size(10 * 1024 * 1024)
}

pub fn stored_backup_settings_with_chunk_size(chunk_size_bytes: usize) -> BackupSettings {
    BackupSettings { compression_method: CompressionMethod::Stored, compression_level: 0, chunk_size_bytes }
}

pub fn backup_options<'a>(connection_string: &'a str, filter_spec: &'a str, backup: BackupSettings) -> BackupOptions<'a> {
    BackupOptions {
        connection_string,
        jobs: 2,
        schema_name: "main",
        filter_spec,
        retry: fast_retry(),
        backup,
        schema_only: false,
    }
}

pub fn restore_options<'a>(filter_spec: &'a str) -> RestoreOptions<'a> {
    RestoreOptions {
        jobs: 2,
        schema_name: None,
        filter_spec,
        retry: fast_retry(),
        restore: Some(RestoreSettings { batch_size: 200, cache_size_kb: 2048, max_rows_per_commit: 5000, memory_limit_bytes: None }),
    }
}

/// Runs a backup against `src_path` and returns the archive bytes plus the
/// progress events recorded along the way. The archive is staged through a
/// real temp file rather than an in-memory buffer since `backup` takes
/// ownership of its sink and hands nothing back.
pub fn backup_to_bytes(
    src_path: &str,
    filter_spec: &str,
    backup: BackupSettings,
    schema_only: bool,
) -> anyhow::Result<(Vec<u8>, NullProgressManager)> {
    let progress = NullProgressManager::new();
    let mut options = backup_options(src_path, filter_spec, backup);
    options.schema_only = schema_only;

    let archive_file = NamedTempFile::new()?;
    let sink = archive_file.reopen()?;
    let connect = connector(src_path.to_string());
    backup_core::backup(sink, connect, &progress, &options)?;

    let bytes = std::fs::read(archive_file.path())?;
    Ok((bytes, progress))
}

/// A `Conn` that forwards everything to a real `SqliteConn`, except it fails
/// the very first `execute_batch` call across every connection sharing its
/// `fail_once` flag with a `Concurrency`-classified error (S4: a transient
/// SQLSTATE 40001-shaped fault on the first insert attempt).
pub struct FaultingConn {
    inner: Box<dyn Conn>,
    fail_once: Arc<AtomicBool>,
}

impl FaultingConn {
    pub fn new(path: &str, fail_once: Arc<AtomicBool>) -> Result<Self, ClientError> {
        Ok(Self { inner: open(path), fail_once })
    }
}

impl Conn for FaultingConn {
    fn server_type(&self) -> ServerType {
        self.inner.server_type()
    }

    fn query_formatter(&self) -> &dyn QueryFormatter {
        self.inner.query_formatter()
    }

    fn execute_direct(&mut self, sql: &str) -> Result<(), ClientError> {
        self.inner.execute_direct(sql)
    }

    fn begin_transaction(&mut self) -> Result<(), ClientError> {
        self.inner.begin_transaction()
    }

    fn commit(&mut self) -> Result<(), ClientError> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), ClientError> {
        self.inner.rollback()
    }

    fn prepare<'c>(&'c mut self, sql: &str) -> Result<Box<dyn Statement + 'c>, ClientError> {
        let inner = self.inner.prepare(sql)?;
        Ok(Box::new(FaultingStatement { inner, fail_once: self.fail_once.clone() }))
    }

    fn reapply_session_setup(&mut self) -> Result<(), ClientError> {
        self.inner.reapply_session_setup()
    }
}

struct FaultingStatement<'c> {
    inner: Box<dyn Statement + 'c>,
    fail_once: Arc<AtomicBool>,
}

impl<'c> Statement for FaultingStatement<'c> {
    fn query_all(&mut self) -> Result<Vec<Vec<common::BackupValue>>, ClientError> {
        self.inner.query_all()
    }

    fn execute(&mut self) -> Result<u64, ClientError> {
        self.inner.execute()
    }

    fn execute_batch(&mut self, columns: &[ColumnBuffer], row_count: usize) -> Result<u64, ClientError> {
        if self.fail_once.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Sql { kind: SqlErrorKind::Concurrency, message: "40001 serialization failure".to_string() });
        }
        self.inner.execute_batch(columns, row_count)
    }
}
