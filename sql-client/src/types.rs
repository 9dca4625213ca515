use common::ColumnType;

/// One column as read off the live schema (scan time) or recorded in the
/// metadata sidecar (restore time) — spec §4.8.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
    pub is_nullable: bool,
    pub is_unique: bool,
    pub default_value: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForeignKeyDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

/// A scanned (or restored) table: column declarations in insertion order,
/// FK list, index list, and PK order — spec §3 "TableInfo".
#[derive(Clone, Debug, PartialEq)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    /// Authoritative PK column order (spec §4.8): a column's
    /// `is_primary_key` without being listed here is treated as a
    /// single-column PK by the metadata builder.
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
    pub indexes: Vec<IndexDescriptor>,
    pub row_count_estimate: u64,
}

impl TableDescriptor {
    /// Column names in declaration order, the order data is written/read in.
    pub fn field_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Index (0-based) of each binary column, used by restore to decide
    /// whether a value needs the MSSQL LOB-size workaround.
    pub fn binary_column_mask(&self) -> Vec<bool> {
        self.columns
            .iter()
            .map(|c| matches!(c.column_type, ColumnType::Binary { .. } | ColumnType::Blob))
            .collect()
    }

    /// Primary key columns used for the deterministic backup `ORDER BY`.
    /// Falls back to the first column when no PK is declared (spec §4.5.8b).
    pub fn order_by_columns(&self) -> Vec<String> {
        if !self.primary_keys.is_empty() {
            self.primary_keys.clone()
        } else if let Some(first) = self.columns.first() {
            vec![first.name.clone()]
        } else {
            Vec::new()
        }
    }
}

/// `server: {name, version, driver, full_version?}` from spec §4.8.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub driver: String,
    pub full_version: Option<String>,
}
