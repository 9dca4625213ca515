use crate::types::{ForeignKeyDescriptor, IndexDescriptor, TableDescriptor};
use common::ColumnType;

/// Dialect-specific SQL text generation. One implementation per
/// `ServerType`; only `SqliteFormatter` is wired to a live driver in this
/// crate, but the trait's shape (and the MSSQL-specific methods below)
/// mirrors the quirks spec §4.4/§4.5/§4.6 call out, so `backup-core`
/// exercises the same code paths it would against a real MSSQL/Postgres
/// implementation.
pub trait QueryFormatter: Send + Sync {
    fn quote_identifier(&self, ident: &str) -> String;

    fn format_table_name(&self, schema: &str, table: &str) -> String {
        if schema.is_empty() {
            self.quote_identifier(table)
        } else {
            format!("{}.{}", self.quote_identifier(schema), self.quote_identifier(table))
        }
    }

    /// Wraps a column read expression for dialect-specific precision
    /// preservation. MSSQL wraps decimal columns in
    /// `CONVERT(VARCHAR, ...)` (spec §4.4, §4.5.8c); every other dialect is
    /// the identity function.
    fn decimal_read_wrap(&self, column_expr: &str, column_type: &ColumnType) -> String {
        let _ = column_type;
        column_expr.to_string()
    }

    /// Builds `SELECT ... ORDER BY <pk> LIMIT n OFFSET m` for deterministic
    /// pagination (spec §4.5.8c). Without a deterministic `ORDER BY`,
    /// pagination and resumption are undefined.
    fn paginated_select(
        &self,
        schema: &str,
        table: &TableDescriptor,
        order_by: &[String],
        limit: usize,
        offset: usize,
    ) -> String {
        let columns = table
            .columns
            .iter()
            .map(|c| self.decimal_read_wrap(&self.quote_identifier(&c.name), &c.column_type))
            .collect::<Vec<_>>()
            .join(", ");
        let order = order_by
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let table_name = self.format_table_name(schema, &table.name);
        if order.is_empty() {
            format!("SELECT {columns} FROM {table_name} LIMIT {limit} OFFSET {offset}")
        } else {
            format!("SELECT {columns} FROM {table_name} ORDER BY {order} LIMIT {limit} OFFSET {offset}")
        }
    }

    fn drop_table_if_exists(&self, schema: &str, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.format_table_name(schema, table))
    }

    fn column_type_sql(&self, column_type: &ColumnType) -> String;

    fn create_table_sql(&self, schema: &str, table: &TableDescriptor) -> String {
        let mut column_defs = Vec::with_capacity(table.columns.len());
        for col in &table.columns {
            let mut def = format!("{} {}", self.quote_identifier(&col.name), self.column_type_sql(&col.column_type));
            if !col.is_nullable {
                def.push_str(" NOT NULL");
            }
            if col.is_auto_increment {
                def.push_str(&self.auto_increment_suffix());
            }
            column_defs.push(def);
        }
        if !table.primary_keys.is_empty() {
            let pk_cols = table
                .primary_keys
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            column_defs.push(format!("PRIMARY KEY ({pk_cols})"));
        }
        format!(
            "CREATE TABLE {} ({})",
            self.format_table_name(schema, &table.name),
            column_defs.join(", ")
        )
    }

    fn auto_increment_suffix(&self) -> String {
        String::new()
    }

    fn add_foreign_key_sql(&self, schema: &str, table: &str, fk: &ForeignKeyDescriptor) -> String {
        let cols = fk
            .columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let ref_cols = fk
            .referenced_columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({cols}) REFERENCES {} ({ref_cols})",
            self.format_table_name(schema, table),
            self.quote_identifier(&fk.name),
            self.format_table_name(schema, &fk.referenced_table),
        )
    }

    fn create_index_sql(&self, schema: &str, table: &str, idx: &IndexDescriptor) -> String {
        let unique = if idx.is_unique { "UNIQUE " } else { "" };
        let cols = idx
            .columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE {unique}INDEX {} ON {} ({cols})",
            self.quote_identifier(&idx.name),
            self.format_table_name(schema, table),
        )
    }

    /// MSSQL requires `SET IDENTITY_INSERT <table> ON|OFF` around inserts
    /// that supply explicit identity-column values (spec §4.6.8d). `None`
    /// for dialects with no such toggle.
    fn set_identity_insert(&self, schema: &str, table: &str, on: bool) -> Option<String> {
        let _ = (schema, table, on);
        None
    }

    fn insert_statement(&self, schema: &str, table: &str, fields: &[String]) -> String {
        let columns = fields
            .iter()
            .map(|f| self.quote_identifier(f))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (0..fields.len()).map(|_| "?").collect::<Vec<_>>().join(", ");
        format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            self.format_table_name(schema, table)
        )
    }
}

/// The one concrete, wired-up dialect in this crate.
pub struct SqliteFormatter;

impl QueryFormatter for SqliteFormatter {
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn column_type_sql(&self, column_type: &ColumnType) -> String {
        match column_type {
            ColumnType::TinyInt
            | ColumnType::SmallInt
            | ColumnType::Integer
            | ColumnType::BigInt
            | ColumnType::Boolean => "INTEGER".to_string(),
            ColumnType::Float | ColumnType::Double => "REAL".to_string(),
            ColumnType::Decimal { .. } => "TEXT".to_string(),
            ColumnType::Char { .. } | ColumnType::Varchar { .. } | ColumnType::Text => "TEXT".to_string(),
            ColumnType::Date | ColumnType::DateTime | ColumnType::Timestamp => "TEXT".to_string(),
            ColumnType::Binary { .. } | ColumnType::Blob => "BLOB".to_string(),
            ColumnType::Guid => "TEXT".to_string(),
        }
    }

    fn auto_increment_suffix(&self) -> String {
        " PRIMARY KEY AUTOINCREMENT".to_string()
    }

    fn create_table_sql(&self, schema: &str, table: &TableDescriptor) -> String {
        // SQLite's AUTOINCREMENT must be attached directly to the single
        // INTEGER PRIMARY KEY column; a trailing `PRIMARY KEY (...)` clause
        // cannot coexist with it, so the generic default impl is overridden.
        let has_single_auto_increment_pk =
            table.primary_keys.len() == 1 && table.columns.iter().any(|c| c.is_auto_increment && c.is_primary_key);

        let mut column_defs = Vec::with_capacity(table.columns.len());
        for col in &table.columns {
            let mut def = format!("{} {}", self.quote_identifier(&col.name), self.column_type_sql(&col.column_type));
            if col.is_auto_increment && col.is_primary_key && has_single_auto_increment_pk {
                def.push_str(&self.auto_increment_suffix());
            } else if !col.is_nullable {
                def.push_str(" NOT NULL");
            }
            column_defs.push(def);
        }
        if !has_single_auto_increment_pk && !table.primary_keys.is_empty() {
            let pk_cols = table
                .primary_keys
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            column_defs.push(format!("PRIMARY KEY ({pk_cols})"));
        }
        // SQLite has no `ALTER TABLE ... ADD CONSTRAINT`, so foreign keys
        // must be declared inline here rather than added after the fact —
        // this is why table creation order matters for this dialect.
        for fk in &table.foreign_keys {
            let cols = fk.columns.iter().map(|c| self.quote_identifier(c)).collect::<Vec<_>>().join(", ");
            let ref_cols =
                fk.referenced_columns.iter().map(|c| self.quote_identifier(c)).collect::<Vec<_>>().join(", ");
            column_defs.push(format!(
                "FOREIGN KEY ({cols}) REFERENCES {} ({ref_cols})",
                self.format_table_name(schema, &fk.referenced_table)
            ));
        }
        format!(
            "CREATE TABLE {} ({})",
            self.format_table_name(schema, &table.name),
            column_defs.join(", ")
        )
    }
}
