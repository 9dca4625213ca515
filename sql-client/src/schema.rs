use crate::conn::Conn;
use crate::error::ClientError;
use crate::types::{ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, TableDescriptor};
use common::{BackupValue, ColumnType, ServerType};

fn expect_text(value: &BackupValue) -> String {
    match value {
        BackupValue::Text(s) => s.clone(),
        BackupValue::Int(i) => i.to_string(),
        BackupValue::Null => String::new(),
        other => other.to_text_lossy(),
    }
}

fn expect_i64(value: &BackupValue) -> i64 {
    match value {
        BackupValue::Int(i) => *i,
        BackupValue::Bool(b) => *b as i64,
        _ => 0,
    }
}

/// Maps a SQLite declared type affinity string to a dialect-neutral
/// `ColumnType`. Unrecognized types fall back to `Text` per spec §6 ("Unknown
/// column `type` values are warned-about and mapped to `text`").
fn sqlite_type_to_column_type(declared: &str) -> ColumnType {
    let upper = declared.to_uppercase();
    if upper.contains("INT") {
        ColumnType::BigInt
    } else if upper.contains("BOOL") {
        ColumnType::Boolean
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        ColumnType::Double
    } else if upper.contains("BLOB") {
        ColumnType::Blob
    } else if upper.contains("DATETIME") || upper.contains("TIMESTAMP") {
        ColumnType::Timestamp
    } else if upper.contains("DATE") {
        ColumnType::Date
    } else if upper.contains("DECIMAL") || upper.contains("NUMERIC") {
        ColumnType::Decimal { precision: 38, scale: 10 }
    } else if upper.contains("CHAR") || upper.contains("TEXT") || upper.contains("CLOB") || upper.is_empty() {
        ColumnType::Text
    } else {
        log::warn!("unrecognized sqlite column type '{declared}', mapping to text");
        ColumnType::Text
    }
}

fn read_tables_sqlite(conn: &mut dyn Conn) -> Result<Vec<String>, ClientError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    Ok(stmt.query_all()?.into_iter().map(|row| expect_text(&row[0])).collect())
}

fn read_columns_sqlite(conn: &mut dyn Conn, table: &str) -> Result<(Vec<ColumnDescriptor>, Vec<String>), ClientError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let rows = stmt.query_all()?;

    let mut columns = Vec::with_capacity(rows.len());
    // (cid, name, type, notnull, dflt_value, pk)
    let mut pk_order: Vec<(i64, String)> = Vec::new();
    for row in &rows {
        let name = expect_text(&row[1]);
        let declared_type = expect_text(&row[2]);
        let not_null = expect_i64(&row[3]) != 0;
        let default_value = match &row[4] {
            BackupValue::Null => None,
            other => Some(expect_text(other)),
        };
        let pk_index = expect_i64(&row[5]);
        if pk_index > 0 {
            pk_order.push((pk_index, name.clone()));
        }
        columns.push(ColumnDescriptor {
            name,
            column_type: sqlite_type_to_column_type(&declared_type),
            is_primary_key: pk_index > 0,
            // A lone INTEGER PRIMARY KEY aliases sqlite's rowid and behaves
            // as an auto-increment column even without explicit
            // AUTOINCREMENT; that is the only case wired up here.
            is_auto_increment: pk_index == 1 && declared_type.to_uppercase().contains("INT"),
            is_nullable: !not_null,
            is_unique: pk_index > 0,
            default_value,
        });
    }
    pk_order.sort_by_key(|(idx, _)| *idx);
    let primary_keys = pk_order.into_iter().map(|(_, name)| name).collect();
    Ok((columns, primary_keys))
}

fn read_foreign_keys_sqlite(conn: &mut dyn Conn, table: &str) -> Result<Vec<ForeignKeyDescriptor>, ClientError> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list(\"{table}\")"))?;
    let rows = stmt.query_all()?;
    // (id, seq, table, from, to, on_update, on_delete, match)
    use std::collections::BTreeMap;
    let mut grouped: BTreeMap<i64, (String, Vec<String>, Vec<String>)> = BTreeMap::new();
    for row in &rows {
        let id = expect_i64(&row[0]);
        let referenced_table = expect_text(&row[2]);
        let from_col = expect_text(&row[3]);
        let to_col = expect_text(&row[4]);
        let entry = grouped.entry(id).or_insert_with(|| (referenced_table, Vec::new(), Vec::new()));
        entry.1.push(from_col);
        entry.2.push(to_col);
    }
    Ok(grouped
        .into_iter()
        .map(|(id, (referenced_table, columns, referenced_columns))| ForeignKeyDescriptor {
            name: format!("fk_{table}_{id}"),
            columns,
            referenced_table,
            referenced_columns,
        })
        .collect())
}

fn read_indexes_sqlite(conn: &mut dyn Conn, table: &str) -> Result<Vec<IndexDescriptor>, ClientError> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list(\"{table}\")"))?;
    let rows = stmt.query_all()?;
    let mut indexes = Vec::new();
    // (seq, name, unique, origin, partial)
    for row in &rows {
        let name = expect_text(&row[1]);
        let is_unique = expect_i64(&row[2]) != 0;
        let origin = expect_text(&row[3]);
        // Skip auto-indexes backing PK/UNIQUE constraints; those are
        // recreated implicitly by CREATE TABLE.
        if origin == "pk" || origin == "u" {
            continue;
        }
        let mut info_stmt = conn.prepare(&format!("PRAGMA index_info(\"{name}\")"))?;
        let info_rows = info_stmt.query_all()?;
        let columns = info_rows.into_iter().map(|r| expect_text(&r[2])).collect();
        indexes.push(IndexDescriptor { name, columns, is_unique });
    }
    Ok(indexes)
}

fn row_count_sqlite(conn: &mut dyn Conn, table: &str) -> Result<u64, ClientError> {
    let mut stmt = conn.prepare(&format!("SELECT COUNT(*) FROM \"{table}\""))?;
    let rows = stmt.query_all()?;
    Ok(rows.first().map(|r| expect_i64(&r[0]) as u64).unwrap_or(0))
}

/// `schema.ReadAllTables(conn, db, schema, onScanProgress, onTableReady,
/// includeTablePredicate)` from spec §1.
///
/// `db`/`schema` select the catalog to scan; `include` is the table filter
/// predicate (kept generic here — `backup_core::TableFilter::matches` is
/// the concrete caller). Dispatches on the connection's dialect; only
/// SQLite is wired to a live implementation in this crate.
pub fn read_all_tables(
    conn: &mut dyn Conn,
    schema: &str,
    mut on_scan_progress: impl FnMut(&str),
    mut on_table_ready: impl FnMut(&TableDescriptor),
    include: impl Fn(&str, &str) -> bool,
) -> Result<Vec<TableDescriptor>, ClientError> {
    match conn.server_type() {
        ServerType::Sqlite => {
            let table_names = read_tables_sqlite(conn)?;
            let mut tables = Vec::new();
            for name in table_names {
                on_scan_progress(&name);
                if !include(schema, &name) {
                    continue;
                }
                let (columns, primary_keys) = read_columns_sqlite(conn, &name)?;
                let foreign_keys = read_foreign_keys_sqlite(conn, &name)?;
                let indexes = read_indexes_sqlite(conn, &name)?;
                let row_count_estimate = row_count_sqlite(conn, &name)?;
                let descriptor = TableDescriptor {
                    schema: schema.to_string(),
                    name,
                    columns,
                    primary_keys,
                    foreign_keys,
                    indexes,
                    row_count_estimate,
                };
                on_table_ready(&descriptor);
                tables.push(descriptor);
            }
            Ok(tables)
        }
        other => Err(ClientError::Unsupported(format!("schema scanning not implemented for {other:?}"))),
    }
}
