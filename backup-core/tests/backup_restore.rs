//! End-to-end backup/restore scenarios run against the real SQLite backend
//! (`sql_client::SqliteConn`), through temp-file-backed source/target
//! databases and an in-memory ZIP archive. Mirrors the concrete scenarios
//! S1-S8 called out alongside the testable properties.

mod common;

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use backup_core::{ArchiveReader, NullProgressManager, ProgressState, RestoreError};
use common::*;
use rusqlite::Connection;
use sql_client::{ClientError, Conn};

fn seed(path: &str, setup: impl FnOnce(&Connection) -> rusqlite::Result<()>) -> Result<()> {
    let conn = Connection::open(path)?;
    setup(&conn)?;
    Ok(())
}

fn row_count(path: &str, table: &str) -> Result<i64> {
    let conn = Connection::open(path)?;
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
}

#[test]
fn s1_empty_table_round_trip() -> Result<()> {
    init_logging();
    let (_src_file, src_path) = temp_db_path();
    seed(&src_path, |conn| conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)"))?;

    let (bytes, backup_progress) = backup_to_bytes(&src_path, "*", stored_backup_settings(), false)?;
    assert_eq!(backup_progress.error_count(), 0);

    let mut reader = ArchiveReader::open(Cursor::new(bytes.clone()))?;
    let metadata = reader.read_metadata()?;
    assert_eq!(metadata.schema.len(), 1);
    assert_eq!(metadata.schema[0].rows, 0);
    assert!(reader.chunk_entries_by_table()?.get("t").map(|v| v.is_empty()).unwrap_or(true));

    let (_dst_file, dst_path) = temp_db_path();
    let restore_progress = NullProgressManager::new();
    let connect = connector(dst_path.clone());
    backup_core::restore(Cursor::new(bytes), connect, &restore_progress, &restore_options("*"))?;

    assert_eq!(row_count(&dst_path, "t")?, 0);
    assert_eq!(restore_progress.error_count(), 0);
    Ok(())
}

#[test]
fn s3_multi_chunk_resumption_preserves_row_count() -> Result<()> {
    init_logging();
    const ROWS: i64 = 2000;

    let (_src_file, src_path) = temp_db_path();
    seed(&src_path, |conn| {
        conn.execute_batch("CREATE TABLE l (id INTEGER PRIMARY KEY, v INTEGER NOT NULL)")?;
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO l (id, v) VALUES (?1, ?2)")?;
            for i in 0..ROWS {
                stmt.execute((i, i * 2))?;
            }
        }
        tx.commit()
    })?;

    // A tiny byte budget forces many small chunks instead of one.
    let backup_settings = common::stored_backup_settings_with_chunk_size(4096);
    let (bytes, backup_progress) = backup_to_bytes(&src_path, "*", backup_settings, false)?;
    assert_eq!(backup_progress.error_count(), 0);

    let mut reader = ArchiveReader::open(Cursor::new(bytes.clone()))?;
    reader.read_metadata()?;
    let chunks = reader.chunk_entries_by_table()?;
    assert!(chunks["l"].len() > 1, "expected more than one chunk, got {}", chunks["l"].len());

    let (_dst_file, dst_path) = temp_db_path();
    let restore_progress = NullProgressManager::new();
    let connect = connector(dst_path.clone());
    backup_core::restore(Cursor::new(bytes), connect, &restore_progress, &restore_options("*"))?;

    assert_eq!(row_count(&dst_path, "l")?, ROWS);
    assert_eq!(restore_progress.error_count(), 0);
    Ok(())
}

#[test]
fn s4_transient_fault_on_first_insert_retries_then_succeeds() -> Result<()> {
    init_logging();
    let (_src_file, src_path) = temp_db_path();
    seed(&src_path, |conn| {
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")?;
        conn.execute_batch("INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, 'c')")
    })?;

    let (bytes, _) = backup_to_bytes(&src_path, "*", stored_backup_settings(), false)?;

    let (_dst_file, dst_path) = temp_db_path();
    let restore_progress = NullProgressManager::new();
    let fail_once = Arc::new(AtomicBool::new(true));
    let connect = {
        let dst_path = dst_path.clone();
        move || -> Result<Box<dyn Conn>, ClientError> { Ok(Box::new(FaultingConn::new(&dst_path, fail_once.clone())?)) }
    };

    let mut options = restore_options("*");
    options.jobs = 1;
    backup_core::restore(Cursor::new(bytes), connect, &restore_progress, &options)?;

    assert_eq!(row_count(&dst_path, "t")?, 3);
    let warnings = restore_progress.events().iter().filter(|e| e.state == ProgressState::Warning).count();
    assert!(warnings >= 1, "expected the injected fault to produce at least one retry warning");
    Ok(())
}

#[test]
fn s5_composite_primary_key_order_is_preserved() -> Result<()> {
    init_logging();
    let (_src_file, src_path) = temp_db_path();
    seed(&src_path, |conn| {
        conn.execute_batch(
            "CREATE TABLE m (a INTEGER NOT NULL, b INTEGER NOT NULL, content TEXT, PRIMARY KEY (b, a))",
        )?;
        conn.execute_batch("INSERT INTO m (a, b, content) VALUES (1, 10, 'x'), (2, 20, 'y')")
    })?;

    let (bytes, _) = backup_to_bytes(&src_path, "*", stored_backup_settings(), false)?;

    let mut reader = ArchiveReader::open(Cursor::new(bytes))?;
    let metadata = reader.read_metadata()?;
    assert_eq!(metadata.schema[0].primary_keys, vec!["b".to_string(), "a".to_string()]);
    Ok(())
}

#[test]
fn s6_filter_precision_selects_expected_tables() -> Result<()> {
    init_logging();
    let (_src_file, src_path) = temp_db_path();
    seed(&src_path, |conn| {
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY);
             CREATE TABLE user_logs (id INTEGER PRIMARY KEY);
             CREATE TABLE audit_log (id INTEGER PRIMARY KEY);
             CREATE TABLE products (id INTEGER PRIMARY KEY);",
        )
    })?;

    let (bytes, _) = backup_to_bytes(&src_path, "user*,*_log", stored_backup_settings(), false)?;
    let mut reader = ArchiveReader::open(Cursor::new(bytes.clone()))?;
    let metadata = reader.read_metadata()?;
    let mut archived: Vec<&str> = metadata.schema.iter().map(|t| t.name.as_str()).collect();
    archived.sort();
    assert_eq!(archived, vec!["audit_log", "user_logs", "users"]);

    let (_dst_file, dst_path) = temp_db_path();
    let restore_progress = NullProgressManager::new();
    let connect = connector(dst_path.clone());
    backup_core::restore(Cursor::new(bytes), connect, &restore_progress, &restore_options("users"))?;

    let conn = Connection::open(&dst_path)?;
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let names: Vec<String> = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
    assert_eq!(names, vec!["users".to_string()]);
    Ok(())
}

#[test]
fn s7_checksum_mismatch_is_detected_and_chunk_rows_are_not_inserted() -> Result<()> {
    init_logging();
    let (_src_file, src_path) = temp_db_path();
    seed(&src_path, |conn| {
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")?;
        conn.execute_batch("INSERT INTO t VALUES (1, 'a'), (2, 'b')")
    })?;

    let (mut bytes, _) = backup_to_bytes(&src_path, "*", stored_backup_settings(), false)?;

    // Stored (uncompressed) entries mean the chunk payload appears verbatim
    // in the archive bytes, so a byte flip there survives re-parsing as a
    // valid (but wrong) ZIP entry rather than corrupting the container.
    let mut reader = ArchiveReader::open(Cursor::new(bytes.clone()))?;
    reader.read_metadata()?;
    let entry_path = reader.chunk_entries_by_table()?["t"][0].1.clone();
    let chunk = reader.read_chunk(&entry_path)?;
    let pos = bytes.windows(chunk.len()).position(|w| w == chunk.as_slice()).expect("locate chunk payload");
    bytes[pos] ^= 0xFF;

    let (_dst_file, dst_path) = temp_db_path();
    let restore_progress = NullProgressManager::new();
    let connect = connector(dst_path.clone());
    let result = backup_core::restore(Cursor::new(bytes), connect, &restore_progress, &restore_options("*"));

    assert!(matches!(result, Err(RestoreError::ChecksumMismatch)));
    assert!(restore_progress.error_count() >= 1);
    let has_message = restore_progress.events().iter().any(|e| e.message.contains("Checksum mismatch"));
    assert!(has_message, "expected an Error event mentioning 'Checksum mismatch'");
    assert_eq!(row_count(&dst_path, "t")?, 0);
    Ok(())
}

#[test]
fn s8_schema_only_restore_recreates_schema_without_rows() -> Result<()> {
    init_logging();
    let (_src_file, src_path) = temp_db_path();
    seed(&src_path, |conn| {
        conn.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER NOT NULL,
                 FOREIGN KEY (parent_id) REFERENCES parent (id));
             CREATE INDEX idx_child_parent ON child (parent_id);
             INSERT INTO parent VALUES (1, 'root');
             INSERT INTO child VALUES (1, 1);",
        )
    })?;

    let (bytes, backup_progress) = backup_to_bytes(&src_path, "*", stored_backup_settings(), true)?;
    assert_eq!(backup_progress.error_count(), 0);

    let (_dst_file, dst_path) = temp_db_path();
    let restore_progress = NullProgressManager::new();
    let connect = connector(dst_path.clone());
    backup_core::restore(Cursor::new(bytes), connect, &restore_progress, &restore_options("*"))?;

    assert_eq!(restore_progress.error_count(), 0);
    assert_eq!(row_count(&dst_path, "parent")?, 0);
    assert_eq!(row_count(&dst_path, "child")?, 0);

    let conn = Connection::open(&dst_path)?;
    let fk_count: i64 = conn.query_row("SELECT COUNT(*) FROM pragma_foreign_key_list('child')", [], |row| row.get(0))?;
    assert_eq!(fk_count, 1);
    let idx_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_child_parent'",
        [],
        |row| row.get(0),
    )?;
    assert_eq!(idx_count, 1);
    Ok(())
}
