//! The `metadata.json` sidecar: schema snapshot, server identification, and
//! format version (spec §4.8). Built from `sql_client::TableDescriptor` on
//! backup, parsed back into the same shape on restore.

use std::collections::HashMap;

use chrono::Utc;
use common::ColumnType;
use serde::{Deserialize, Serialize};
use sql_client::{ColumnDescriptor, ForeignKeyDescriptor, IndexDescriptor, ServerInfo, TableDescriptor};

use crate::error::RestoreError;

pub const FORMAT_VERSION: &str = "1.0";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub format_version: String,
    pub creation_time: String,
    pub original_connection_string: String,
    pub schema_name: String,
    pub server: ServerInfo,
    pub schema: Vec<MetadataTable>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataTable {
    pub name: String,
    pub rows: u64,
    pub columns: Vec<MetadataColumn>,
    pub foreign_keys: Vec<MetadataForeignKey>,
    pub indexes: Vec<MetadataIndex>,
    pub primary_keys: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataColumn {
    pub name: String,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
    pub is_nullable: bool,
    pub is_unique: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataForeignKey {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

fn column_type_to_metadata(ct: &ColumnType) -> (String, Option<u32>, Option<u32>, Option<u32>) {
    match ct {
        ColumnType::TinyInt => ("tinyint".into(), None, None, None),
        ColumnType::SmallInt => ("smallint".into(), None, None, None),
        ColumnType::Integer => ("integer".into(), None, None, None),
        ColumnType::BigInt => ("bigint".into(), None, None, None),
        ColumnType::Float => ("float".into(), None, None, None),
        ColumnType::Double => ("double".into(), None, None, None),
        ColumnType::Decimal { precision, scale } => ("decimal".into(), None, Some(*precision), Some(*scale)),
        ColumnType::Boolean => ("boolean".into(), None, None, None),
        ColumnType::Char { size } => ("char".into(), Some(*size), None, None),
        ColumnType::Varchar { size } => ("varchar".into(), Some(*size), None, None),
        ColumnType::Text => ("text".into(), None, None, None),
        ColumnType::Date => ("date".into(), None, None, None),
        ColumnType::DateTime => ("datetime".into(), None, None, None),
        ColumnType::Timestamp => ("timestamp".into(), None, None, None),
        ColumnType::Binary { size } => ("binary".into(), Some(*size), None, None),
        ColumnType::Blob => ("blob".into(), None, None, None),
        ColumnType::Guid => ("guid".into(), None, None, None),
    }
}

/// Unknown `type` values are warned-about and mapped to `Text`, permitting
/// best-effort restore (spec §6).
fn metadata_to_column_type(type_name: &str, size: Option<u32>, precision: Option<u32>, scale: Option<u32>) -> ColumnType {
    match type_name {
        "tinyint" => ColumnType::TinyInt,
        "smallint" => ColumnType::SmallInt,
        "integer" => ColumnType::Integer,
        "bigint" => ColumnType::BigInt,
        "float" => ColumnType::Float,
        "double" => ColumnType::Double,
        "decimal" => ColumnType::Decimal { precision: precision.unwrap_or(38), scale: scale.unwrap_or(0) },
        "boolean" => ColumnType::Boolean,
        "char" => ColumnType::Char { size: size.unwrap_or(1) },
        "varchar" => ColumnType::Varchar { size: size.unwrap_or(255) },
        "text" => ColumnType::Text,
        "date" => ColumnType::Date,
        "datetime" => ColumnType::DateTime,
        "timestamp" => ColumnType::Timestamp,
        "binary" => ColumnType::Binary { size: size.unwrap_or(0) },
        "blob" => ColumnType::Blob,
        "guid" => ColumnType::Guid,
        other => {
            log::warn!("unrecognized metadata column type '{other}', mapping to text");
            ColumnType::Text
        }
    }
}

impl From<&ColumnDescriptor> for MetadataColumn {
    fn from(col: &ColumnDescriptor) -> Self {
        let (type_name, size, precision, scale) = column_type_to_metadata(&col.column_type);
        Self {
            name: col.name.clone(),
            is_primary_key: col.is_primary_key,
            is_auto_increment: col.is_auto_increment,
            is_nullable: col.is_nullable,
            is_unique: col.is_unique,
            default_value: col.default_value.clone(),
            type_name,
            size,
            precision,
            scale,
        }
    }
}

impl From<&MetadataColumn> for ColumnDescriptor {
    fn from(col: &MetadataColumn) -> Self {
        Self {
            name: col.name.clone(),
            column_type: metadata_to_column_type(&col.type_name, col.size, col.precision, col.scale),
            is_primary_key: col.is_primary_key,
            is_auto_increment: col.is_auto_increment,
            is_nullable: col.is_nullable,
            is_unique: col.is_unique,
            default_value: col.default_value.clone(),
        }
    }
}

impl From<&ForeignKeyDescriptor> for MetadataForeignKey {
    fn from(fk: &ForeignKeyDescriptor) -> Self {
        Self {
            name: fk.name.clone(),
            columns: fk.columns.clone(),
            referenced_table: fk.referenced_table.clone(),
            referenced_columns: fk.referenced_columns.clone(),
        }
    }
}

impl From<&MetadataForeignKey> for ForeignKeyDescriptor {
    fn from(fk: &MetadataForeignKey) -> Self {
        Self {
            name: fk.name.clone(),
            columns: fk.columns.clone(),
            referenced_table: fk.referenced_table.clone(),
            referenced_columns: fk.referenced_columns.clone(),
        }
    }
}

impl From<&IndexDescriptor> for MetadataIndex {
    fn from(idx: &IndexDescriptor) -> Self {
        Self { name: idx.name.clone(), columns: idx.columns.clone(), is_unique: idx.is_unique }
    }
}

impl From<&MetadataIndex> for IndexDescriptor {
    fn from(idx: &MetadataIndex) -> Self {
        Self { name: idx.name.clone(), columns: idx.columns.clone(), is_unique: idx.is_unique }
    }
}

impl MetadataTable {
    fn from_descriptor(table: &TableDescriptor, row_count: u64) -> Self {
        // A column's `is_primary_key` without being listed in `primary_keys`
        // is treated as a single-column PK — normalize that here so the
        // array is always authoritative on the way out (spec §4.8).
        let primary_keys = if table.primary_keys.is_empty() {
            table.columns.iter().filter(|c| c.is_primary_key).map(|c| c.name.clone()).collect()
        } else {
            table.primary_keys.clone()
        };

        Self {
            name: table.name.clone(),
            rows: row_count,
            columns: table.columns.iter().map(MetadataColumn::from).collect(),
            foreign_keys: table.foreign_keys.iter().map(MetadataForeignKey::from).collect(),
            indexes: table.indexes.iter().map(MetadataIndex::from).collect(),
            primary_keys,
        }
    }

    pub fn to_descriptor(&self, schema: &str) -> TableDescriptor {
        TableDescriptor {
            schema: schema.to_string(),
            name: self.name.clone(),
            columns: self.columns.iter().map(ColumnDescriptor::from).collect(),
            primary_keys: self.primary_keys.clone(),
            foreign_keys: self.foreign_keys.iter().map(ForeignKeyDescriptor::from).collect(),
            indexes: self.indexes.iter().map(IndexDescriptor::from).collect(),
            row_count_estimate: self.rows,
        }
    }
}

impl Metadata {
    pub fn build(
        tables: &[TableDescriptor],
        row_counts: &HashMap<String, u64>,
        connection_string: &str,
        schema_name: &str,
        server: ServerInfo,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            creation_time: Utc::now().to_rfc3339(),
            original_connection_string: connection_string.to_string(),
            schema_name: schema_name.to_string(),
            server,
            schema: tables
                .iter()
                .map(|t| MetadataTable::from_descriptor(t, row_counts.get(&t.name).copied().unwrap_or(0)))
                .collect(),
        }
    }

    pub fn validate_format_version(&self) -> Result<(), RestoreError> {
        if self.format_version != FORMAT_VERSION {
            return Err(RestoreError::UnsupportedFormatVersion(self.format_version.clone()));
        }
        Ok(())
    }

    /// `name → TableInfo` map (spec §4.6.3), keyed by bare table name.
    pub fn table_map(&self, schema: &str) -> HashMap<String, TableDescriptor> {
        self.schema.iter().map(|t| (t.name.clone(), t.to_descriptor(schema))).collect()
    }
}
