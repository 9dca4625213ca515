//! The backup pipeline entry point (spec §4.5): connect, scan schema,
//! spawn workers that stream paginated rows into chunked archive entries,
//! write the metadata/checksum sidecars.

use std::collections::HashMap;
use std::io::{Seek, Write};
use std::sync::Mutex;

use common::{BackupSettings, RetrySettings};
use sql_client::{ClientError, Conn, ServerInfo, TableDescriptor};

use crate::archive::ArchiveWriter;
use crate::chunk::ChunkWriter;
use crate::error::BackupError;
use crate::filter::TableFilter;
use crate::metadata::Metadata;
use crate::progress::{ProgressEvent, ProgressManager, ProgressState};
use crate::queue::ThreadSafeQueue;
use crate::retry::retry_on_transient_error;

const PAGE_ROWS: usize = 1000;

pub struct BackupOptions<'a> {
    pub connection_string: &'a str,
    pub jobs: u32,
    pub schema_name: &'a str,
    pub filter_spec: &'a str,
    pub retry: RetrySettings,
    pub backup: BackupSettings,
    /// When true, only `metadata.json` is written; no row data or
    /// `checksums.json` (spec §4.5 stage 5, 9).
    pub schema_only: bool,
}

/// `Backup(out, conn, jobs, progress, schema, filter, retry, backup)` from
/// spec §1/§6. `connect` stands in for the out-of-scope driver's
/// `connect(string) → Conn`; it is called once for the main session and
/// again for each worker connection, sequentially, to avoid the ODBC
/// concurrent-connect race the original calls out.
pub fn backup<W, ConnectFn>(
    sink: W,
    connect: ConnectFn,
    progress: &dyn ProgressManager,
    options: &BackupOptions,
) -> Result<(), BackupError>
where
    W: Write + Seek + Send,
    ConnectFn: Fn() -> Result<Box<dyn Conn>, ClientError> + Sync,
{
    let filter = TableFilter::parse(options.filter_spec);

    let mut main_conn = connect()?;
    let server_type = main_conn.server_type();
    let jobs = if server_type.forces_single_worker() { 1 } else { options.jobs.max(1) };

    let mut max_name_len = 0usize;
    let tables = sql_client::read_all_tables(
        main_conn.as_mut(),
        options.schema_name,
        |name| {
            max_name_len = max_name_len.max(name.len());
            progress.update(ProgressEvent {
                state: ProgressState::InProgress,
                table_name: name.to_string(),
                current_rows: 0,
                total_rows: None,
                message: "Scanning schema".to_string(),
            });
        },
        |_descriptor: &TableDescriptor| {},
        |schema, table| filter.matches(schema, table),
    )?;
    progress.set_max_table_name_length(max_name_len);
    progress.set_total_items(tables.iter().map(|t| t.row_count_estimate).sum());
    drop(main_conn);

    let archive = Mutex::new(ArchiveWriter::new(sink, options.backup.compression_method, options.backup.compression_level));

    let queue: ThreadSafeQueue<TableDescriptor> = ThreadSafeQueue::new();
    for table in &tables {
        queue.push(table.clone());
    }
    queue.mark_finished();

    let mut worker_connections = Vec::new();
    if !options.schema_only {
        for _ in 0..jobs {
            let conn = retry_on_transient_error(|| connect(), &options.retry, progress, "connect")?;
            worker_connections.push(conn);
        }
    }

    let mut worker_error: Mutex<Option<BackupError>> = Mutex::new(None);
    let connect = &connect;

    if !options.schema_only {
        std::thread::scope(|scope| {
            for mut conn in worker_connections {
                let queue = &queue;
                let archive = &archive;
                let worker_error = &worker_error;
                scope.spawn(move || {
                    while let Some(table) = queue.wait_and_pop() {
                        if let Err(e) = process_table_backup(conn.as_mut(), connect, &table, archive, options, progress) {
                            let mut slot = worker_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                });
            }
        });
    }

    if let Some(err) = worker_error.get_mut().unwrap().take() {
        return Err(err);
    }

    let server_info = ServerInfo {
        name: format!("{server_type:?}"),
        version: String::new(),
        driver: "sql-client".to_string(),
        full_version: None,
    };
    let row_counts: HashMap<String, u64> =
        tables.iter().map(|t| (t.name.clone(), t.row_count_estimate)).collect();
    let metadata = Metadata::build(&tables, &row_counts, options.connection_string, options.schema_name, server_info);

    let writer = archive.into_inner().unwrap();
    writer.finish(&metadata, !options.schema_only)?;

    progress.all_done();
    Ok(())
}

fn process_table_backup<W: Write + Seek, ConnectFn>(
    conn: &mut dyn Conn,
    connect: &ConnectFn,
    table: &TableDescriptor,
    archive: &Mutex<ArchiveWriter<W>>,
    options: &BackupOptions,
    progress: &dyn ProgressManager,
) -> Result<(), BackupError>
where
    ConnectFn: Fn() -> Result<Box<dyn Conn>, ClientError> + Sync,
{
    progress.update(ProgressEvent {
        state: ProgressState::Started,
        table_name: table.name.clone(),
        current_rows: 0,
        total_rows: Some(table.row_count_estimate),
        message: String::new(),
    });

    let order_by = table.order_by_columns();
    let mut writer = ChunkWriter::new(options.backup.chunk_size_bytes);
    let mut chunk_index = 0u32;
    let mut offset = 0usize;
    let mut rows_written = 0u64;
    let mut live_conn: Option<Box<dyn Conn>> = None;

    loop {
        let rows = fetch_page(conn, table, &order_by, offset, &options.retry, progress, connect, &mut live_conn)?;
        let page_len = rows.len();

        for row in &rows {
            writer.write_row(row);
            rows_written += 1;
            if writer.is_chunk_full() {
                flush_chunk(&mut writer, &table.name, &mut chunk_index, archive)?;
            }
        }

        progress.update(ProgressEvent {
            state: ProgressState::InProgress,
            table_name: table.name.clone(),
            current_rows: rows_written,
            total_rows: Some(table.row_count_estimate),
            message: String::new(),
        });

        if page_len < PAGE_ROWS {
            break;
        }
        offset += PAGE_ROWS;
    }

    if !writer.is_empty() {
        flush_chunk(&mut writer, &table.name, &mut chunk_index, archive)?;
    }

    progress.update(ProgressEvent {
        state: ProgressState::Finished,
        table_name: table.name.clone(),
        current_rows: rows_written,
        total_rows: Some(table.row_count_estimate),
        message: String::new(),
    });
    progress.on_items_processed(rows_written);

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn fetch_page<ConnectFn>(
    conn: &mut dyn Conn,
    table: &TableDescriptor,
    order_by: &[String],
    offset: usize,
    retry: &RetrySettings,
    progress: &dyn ProgressManager,
    connect: &ConnectFn,
    live_conn: &mut Option<Box<dyn Conn>>,
) -> Result<Vec<Vec<common::BackupValue>>, BackupError>
where
    ConnectFn: Fn() -> Result<Box<dyn Conn>, ClientError> + Sync,
{
    // Page size (row count) and chunk flush threshold (byte size, see
    // `ChunkWriter::is_chunk_full`) are deliberately independent knobs.
    let sql = conn.query_formatter().paginated_select(&table.schema, table, order_by, PAGE_ROWS, offset);

    let rows = retry_on_transient_error(
        || {
            let active: &mut dyn Conn = match live_conn {
                Some(c) => c.as_mut(),
                None => &mut *conn,
            };
            let mut stmt = match active.prepare(&sql) {
                Ok(stmt) => stmt,
                Err(err) => {
                    if crate::retry::is_transient(&err) {
                        if let Ok(fresh) = connect() {
                            *live_conn = Some(fresh);
                        }
                    }
                    return Err(err);
                }
            };
            stmt.query_all()
        },
        retry,
        progress,
        &table.name,
    )?;
    Ok(rows)
}

fn flush_chunk<W: Write + Seek>(
    writer: &mut ChunkWriter,
    table_name: &str,
    chunk_index: &mut u32,
    archive: &Mutex<ArchiveWriter<W>>,
) -> Result<(), BackupError> {
    let bytes = writer.flush()?;
    if bytes.is_empty() {
        return Ok(());
    }
    let mut archive = archive.lock().unwrap();
    archive.write_chunk(table_name, *chunk_index, &bytes)?;
    *chunk_index += 1;
    Ok(())
}
