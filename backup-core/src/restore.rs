//! The restore pipeline entry point (spec §4.6): open the archive read-only,
//! recreate schema in FK-safe order, replay chunks through workers, then
//! apply foreign keys and indexes once every table has drained.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use common::{RestoreSettings, RetrySettings};
use sql_client::{ClientError, ColumnBuffer, Conn, ServerType, TableDescriptor};

use crate::archive::ArchiveReader;
use crate::batch::{BatchExecutor, BatchManager};
use crate::chunk::ChunkReader;
use crate::error::RestoreError;
use crate::filter::TableFilter;
use crate::progress::{ProgressEvent, ProgressManager, ProgressState};
use crate::queue::ThreadSafeQueue;
use crate::resource;
use crate::retry::retry_on_transient_error;

pub struct RestoreOptions<'a> {
    pub jobs: u32,
    /// `None` restores into `metadata.schema_name`; `Some` overrides it.
    pub schema_name: Option<&'a str>,
    pub filter_spec: &'a str,
    pub retry: RetrySettings,
    /// `None` derives settings from available memory (spec §4.9).
    pub restore: Option<RestoreSettings>,
}

/// `Restore(in, conn, jobs, progress, schema, filter, retry, restore)` from
/// spec §1/§6.
pub fn restore<R, ConnectFn>(
    source: R,
    connect: ConnectFn,
    progress: &dyn ProgressManager,
    options: &RestoreOptions,
) -> Result<(), RestoreError>
where
    R: Read + Seek + Send,
    ConnectFn: Fn() -> Result<Box<dyn Conn>, ClientError> + Sync,
{
    let mut archive = ArchiveReader::open(source)?;
    let metadata = archive.read_metadata()?;
    let schema_name = options.schema_name.unwrap_or(&metadata.schema_name);

    let filter = TableFilter::parse(options.filter_spec);
    let tables: HashMap<String, TableDescriptor> = metadata
        .table_map(schema_name)
        .into_iter()
        .filter(|(_, t)| filter.matches(&t.schema, &t.name))
        .collect();

    let mut main_conn = connect()?;
    let server_type = main_conn.server_type();
    let jobs = if server_type.forces_single_worker() { 1 } else { options.jobs.max(1) };

    let created = recreate_schema(main_conn.as_mut(), &tables, server_type, progress)?;
    drop(main_conn);

    for name in &created {
        progress.update(ProgressEvent {
            state: ProgressState::Started,
            table_name: name.clone(),
            current_rows: 0,
            total_rows: Some(tables[name].row_count_estimate),
            message: String::new(),
        });
    }

    let entries_by_table = archive.chunk_entries_by_table()?;
    let queue: ThreadSafeQueue<(String, String)> = ThreadSafeQueue::new();
    let mut chunk_counts: HashMap<String, u64> = HashMap::new();
    for name in &created {
        let entries = entries_by_table.get(name).cloned().unwrap_or_default();
        chunk_counts.insert(name.clone(), entries.len() as u64);
        for (_, path) in entries {
            queue.push((name.clone(), path));
        }
    }
    queue.mark_finished();

    progress.set_max_table_name_length(created.iter().map(|n| n.len()).max().unwrap_or(0));
    progress.set_total_items(created.iter().map(|n| tables[n].row_count_estimate).sum());

    let restore_settings = options.restore.unwrap_or_else(|| resource::auto_detect_settings(jobs));
    let rows_done: HashMap<String, AtomicU64> = created.iter().map(|n| (n.clone(), AtomicU64::new(0))).collect();
    let chunks_done: HashMap<String, AtomicU64> = created.iter().map(|n| (n.clone(), AtomicU64::new(0))).collect();

    let mut worker_connections = Vec::new();
    for _ in 0..jobs {
        let mut conn = retry_on_transient_error(|| connect(), &options.retry, progress, "connect")?;
        apply_sqlite_pragmas(conn.as_mut(), restore_settings.cache_size_kb)?;
        worker_connections.push(conn);
    }

    let archive_mutex = Mutex::new(archive);
    let worker_error: Mutex<Option<RestoreError>> = Mutex::new(None);

    {
        let connect = &connect;
        std::thread::scope(|scope| {
            for mut conn in worker_connections {
                let queue = &queue;
                let archive_mutex = &archive_mutex;
                let worker_error = &worker_error;
                let tables = &tables;
                let rows_done = &rows_done;
                let chunks_done = &chunks_done;
                let chunk_counts = &chunk_counts;
                let restore_settings = &restore_settings;
                scope.spawn(move || {
                    while let Some((table_name, entry_path)) = queue.wait_and_pop() {
                        let result = process_chunk(
                            &mut conn,
                            connect,
                            &table_name,
                            &entry_path,
                            tables,
                            archive_mutex,
                            rows_done,
                            chunks_done,
                            chunk_counts,
                            restore_settings,
                            &options.retry,
                            server_type,
                            progress,
                        );
                        if let Err(e) = result {
                            progress.update(ProgressEvent {
                                state: ProgressState::Error,
                                table_name: table_name.clone(),
                                current_rows: 0,
                                total_rows: None,
                                message: e.to_string(),
                            });
                            let mut slot = worker_error.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            // Consistency guard: a fatal chunk error aborts this
                            // worker rather than continuing on to the table's
                            // remaining chunks. Other workers' dispatched chunks
                            // for other tables still run to completion.
                            return;
                        }
                    }
                });
            }
        });
    }

    let archive = archive_mutex.into_inner().unwrap();
    drop(archive);

    if let Some(err) = worker_error.into_inner().unwrap() {
        return Err(err);
    }

    let mut final_conn = connect()?;
    apply_constraints_and_indexes(final_conn.as_mut(), &tables, &created, server_type)?;

    progress.all_done();
    Ok(())
}

/// Selects table creation order. SQLite embeds `FOREIGN KEY` clauses inline
/// in `CREATE TABLE` (it has no `ALTER TABLE ... ADD CONSTRAINT`), so a
/// referenced table must already exist; other dialects add constraints
/// later (stage 9) and can be created in any order (spec §4.6 stage 4a).
fn topological_order(tables: &HashMap<String, TableDescriptor>) -> Vec<String> {
    let mut remaining: Vec<String> = tables.keys().cloned().collect();
    remaining.sort();
    let mut created_set: HashSet<String> = HashSet::new();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let mut next_remaining = Vec::new();
        let mut progressed = false;
        for name in &remaining {
            let table = &tables[name];
            let ready = table
                .foreign_keys
                .iter()
                .all(|fk| !tables.contains_key(&fk.referenced_table) || created_set.contains(&fk.referenced_table));
            if ready {
                created_set.insert(name.clone());
                order.push(name.clone());
                progressed = true;
            } else {
                next_remaining.push(name.clone());
            }
        }
        if !progressed {
            // Cycle among the remaining tables: emit them as-is and let the
            // database reject any inline FK it can't yet satisfy.
            order.extend(next_remaining);
            break;
        }
        remaining = next_remaining;
    }
    order
}

fn recreate_schema(
    conn: &mut dyn Conn,
    tables: &HashMap<String, TableDescriptor>,
    server_type: ServerType,
    progress: &dyn ProgressManager,
) -> Result<Vec<String>, RestoreError> {
    let order = if server_type.is_sqlite() {
        topological_order(tables)
    } else {
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    };

    if !server_type.is_sqlite() {
        for table in tables.values() {
            for fk in &table.foreign_keys {
                let table_name = conn.query_formatter().format_table_name(&table.schema, &table.name);
                let constraint = conn.query_formatter().quote_identifier(&fk.name);
                let _ = conn.execute_direct(&format!("ALTER TABLE {table_name} DROP CONSTRAINT {constraint}"));
            }
        }
    }

    let mut created = Vec::with_capacity(order.len());
    for name in order {
        let table = &tables[&name];
        let drop_sql = conn.query_formatter().drop_table_if_exists(&table.schema, &table.name);
        let create_sql = conn.query_formatter().create_table_sql(&table.schema, table);
        let result = conn.execute_direct(&drop_sql).and_then(|_| conn.execute_direct(&create_sql));
        match result {
            Ok(()) => created.push(name),
            Err(err) => progress.update(ProgressEvent {
                state: ProgressState::Error,
                table_name: name,
                current_rows: 0,
                total_rows: None,
                message: format!("schema recreation failed: {err}"),
            }),
        }
    }
    Ok(created)
}

fn apply_sqlite_pragmas(conn: &mut dyn Conn, cache_size_kb: u64) -> Result<(), RestoreError> {
    if !conn.server_type().is_sqlite() {
        return Ok(());
    }
    conn.execute_direct("PRAGMA synchronous=OFF")?;
    conn.execute_direct("PRAGMA journal_mode=WAL")?;
    conn.execute_direct("PRAGMA foreign_keys=OFF")?;
    conn.execute_direct(&format!("PRAGMA cache_size=-{cache_size_kb}"))?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_chunk<R, ConnectFn>(
    conn: &mut Box<dyn Conn>,
    connect: &ConnectFn,
    table_name: &str,
    entry_path: &str,
    tables: &HashMap<String, TableDescriptor>,
    archive: &Mutex<ArchiveReader<R>>,
    rows_done: &HashMap<String, AtomicU64>,
    chunks_done: &HashMap<String, AtomicU64>,
    chunk_counts: &HashMap<String, u64>,
    restore_settings: &RestoreSettings,
    retry_settings: &RetrySettings,
    server_type: ServerType,
    progress: &dyn ProgressManager,
) -> Result<(), RestoreError>
where
    R: Read + Seek + Send,
    ConnectFn: Fn() -> Result<Box<dyn Conn>, ClientError> + Sync,
{
    let table = tables.get(table_name).ok_or_else(|| RestoreError::UnknownTableInArchive(table_name.to_string()))?;

    let bytes = archive.lock().unwrap().read_chunk(entry_path)?;

    let mut reader = ChunkReader::new(bytes);
    let mut batches = Vec::new();
    while let Some(batch) = reader.read_batch()? {
        if batch.columns.len() != table.columns.len() {
            return Err(RestoreError::MalformedEntryPath(format!(
                "{entry_path}: {} columns in chunk, {} in schema",
                batch.columns.len(),
                table.columns.len()
            )));
        }
        batches.push(batch);
    }
    let total_rows: u64 = batches.iter().map(|b| b.row_count as u64).sum();

    retry_on_transient_error(
        || write_chunk_to_db(conn, connect, table, server_type, restore_settings, &batches),
        retry_settings,
        progress,
        table_name,
    )?;

    rows_done[table_name].fetch_add(total_rows, Ordering::SeqCst);
    let done = chunks_done[table_name].fetch_add(1, Ordering::SeqCst) + 1;
    progress.update(ProgressEvent {
        state: ProgressState::InProgress,
        table_name: table_name.to_string(),
        current_rows: rows_done[table_name].load(Ordering::SeqCst),
        total_rows: Some(table.row_count_estimate),
        message: String::new(),
    });
    progress.on_items_processed(total_rows);

    if done >= chunk_counts.get(table_name).copied().unwrap_or(0) {
        progress.update(ProgressEvent {
            state: ProgressState::Finished,
            table_name: table_name.to_string(),
            current_rows: rows_done[table_name].load(Ordering::SeqCst),
            total_rows: Some(table.row_count_estimate),
            message: String::new(),
        });
    }
    Ok(())
}

/// Runs one chunk's writes inside a fresh connection attempt; on a transient
/// failure it rolls back, reconnects in place, and lets the retry wrapper
/// redo the whole chunk from scratch (archive reads are idempotent).
fn write_chunk_to_db<ConnectFn>(
    conn: &mut Box<dyn Conn>,
    connect: &ConnectFn,
    table: &TableDescriptor,
    server_type: ServerType,
    restore_settings: &RestoreSettings,
    batches: &[crate::chunk::ColumnBatch],
) -> Result<(), ClientError>
where
    ConnectFn: Fn() -> Result<Box<dyn Conn>, ClientError> + Sync,
{
    let result = write_chunk_to_db_inner(conn.as_mut(), table, server_type, restore_settings, batches);
    if let Err(err) = &result {
        if crate::retry::is_transient(err) {
            let _ = conn.as_mut().rollback();
            if let Ok(fresh) = connect() {
                *conn = fresh;
                let _ = conn.as_mut().reapply_session_setup();
                if server_type.is_sqlite() {
                    let _ = apply_sqlite_pragmas(conn.as_mut(), restore_settings.cache_size_kb);
                }
            }
        }
    }
    result
}

fn write_chunk_to_db_inner(
    conn: &mut dyn Conn,
    table: &TableDescriptor,
    server_type: ServerType,
    restore_settings: &RestoreSettings,
    batches: &[crate::chunk::ColumnBatch],
) -> Result<(), ClientError> {
    conn.begin_transaction()?;

    let has_identity = table.columns.iter().any(|c| c.is_auto_increment);
    if server_type == ServerType::Mssql && has_identity {
        if let Some(sql) = conn.query_formatter().set_identity_insert(&table.schema, &table.name, true) {
            conn.execute_direct(&sql)?;
        }
    }

    let mut batch_manager =
        BatchManager::new(server_type, &table.schema, &table.name, &table.columns, conn.query_formatter(), restore_settings.batch_size);
    let insert_sql = batch_manager.insert_sql().to_string();

    let mut rows_since_commit = 0usize;
    for batch in batches {
        let rows = batch.to_rows();
        let row_count = rows.len();
        {
            let mut executor: Box<BatchExecutor<'_>> = Box::new(|cols: &[ColumnBuffer], n: usize| {
                let mut stmt = conn.prepare(&insert_sql)?;
                stmt.execute_batch(cols, n)
            });
            batch_manager.push_batch(&rows, &mut *executor)?;
        }
        rows_since_commit += row_count;

        if server_type.is_sqlite() && restore_settings.max_rows_per_commit > 0 && rows_since_commit >= restore_settings.max_rows_per_commit {
            {
                let mut executor: Box<BatchExecutor<'_>> = Box::new(|cols: &[ColumnBuffer], n: usize| {
                    let mut stmt = conn.prepare(&insert_sql)?;
                    stmt.execute_batch(cols, n)
                });
                batch_manager.flush(&mut *executor)?;
            }
            conn.commit()?;
            conn.begin_transaction()?;
            rows_since_commit = 0;
        }
    }
    {
        let mut executor: Box<BatchExecutor<'_>> = Box::new(|cols: &[ColumnBuffer], n: usize| {
            let mut stmt = conn.prepare(&insert_sql)?;
            stmt.execute_batch(cols, n)
        });
        batch_manager.flush(&mut *executor)?;
    }

    if server_type == ServerType::Mssql && has_identity {
        if let Some(sql) = conn.query_formatter().set_identity_insert(&table.schema, &table.name, false) {
            let _ = conn.execute_direct(&sql);
        }
    }

    conn.commit()
}

fn apply_constraints_and_indexes(
    conn: &mut dyn Conn,
    tables: &HashMap<String, TableDescriptor>,
    created: &[String],
    server_type: ServerType,
) -> Result<(), RestoreError> {
    if !server_type.is_sqlite() {
        for name in created {
            let table = &tables[name];
            for fk in &table.foreign_keys {
                let sql = conn.query_formatter().add_foreign_key_sql(&table.schema, &table.name, fk);
                conn.execute_direct(&sql)?;
            }
        }
    }
    for name in created {
        let table = &tables[name];
        for idx in &table.indexes {
            let sql = conn.query_formatter().create_index_sql(&table.schema, &table.name, idx);
            conn.execute_direct(&sql)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sql_client::{ColumnDescriptor, ForeignKeyDescriptor};

    fn table(name: &str, fks: Vec<ForeignKeyDescriptor>) -> TableDescriptor {
        TableDescriptor {
            schema: "main".to_string(),
            name: name.to_string(),
            columns: vec![ColumnDescriptor {
                name: "id".to_string(),
                column_type: common::ColumnType::Integer,
                is_primary_key: true,
                is_auto_increment: true,
                is_nullable: false,
                is_unique: true,
                default_value: None,
            }],
            primary_keys: vec!["id".to_string()],
            foreign_keys: fks,
            indexes: vec![],
            row_count_estimate: 0,
        }
    }

    #[test]
    fn orders_referenced_tables_before_dependents() {
        let mut tables = HashMap::new();
        tables.insert(
            "orders".to_string(),
            table(
                "orders",
                vec![ForeignKeyDescriptor {
                    name: "fk_user".to_string(),
                    columns: vec!["user_id".to_string()],
                    referenced_table: "users".to_string(),
                    referenced_columns: vec!["id".to_string()],
                }],
            ),
        );
        tables.insert("users".to_string(), table("users", vec![]));

        let order = topological_order(&tables);
        assert_eq!(order, vec!["users".to_string(), "orders".to_string()]);
    }

    #[test]
    fn breaks_unresolvable_cycles_by_emitting_remaining_tables() {
        let mut tables = HashMap::new();
        tables.insert(
            "a".to_string(),
            table(
                "a",
                vec![ForeignKeyDescriptor {
                    name: "fk_b".to_string(),
                    columns: vec!["b_id".to_string()],
                    referenced_table: "b".to_string(),
                    referenced_columns: vec!["id".to_string()],
                }],
            ),
        );
        tables.insert(
            "b".to_string(),
            table(
                "b",
                vec![ForeignKeyDescriptor {
                    name: "fk_a".to_string(),
                    columns: vec!["a_id".to_string()],
                    referenced_table: "a".to_string(),
                    referenced_columns: vec!["id".to_string()],
                }],
            ),
        );

        let order = topological_order(&tables);
        assert_eq!(order.len(), 2);
        assert!(order.contains(&"a".to_string()));
        assert!(order.contains(&"b".to_string()));
    }
}
