// 📐 Shape Layer - Table Manifests
// Static column manifests drive record typing and every SQL statement.
// Identifiers only ever come from these manifests, values are always bound.

use crate::attributes::{normalize_column_name, AttributeType, Value};
use crate::error::UpsertError;
use std::collections::{BTreeMap, HashMap};

/// A flat incoming record: column name → raw value
pub type Record = BTreeMap<String, serde_json::Value>;

/// Bookkeeping columns present on every versioned table
pub const BOOKKEEPING_COLUMNS: [&str; 5] =
    ["created_at", "updated_at", "valid_from", "valid_to", "is_current"];

// ============================================================================
// COLUMN & TABLE DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: AttributeType,
}

impl ColumnDef {
    pub const fn new(name: &'static str, ty: AttributeType) -> Self {
        ColumnDef { name, ty }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Descriptive entity (holders, policies), always SCD2
    Dimension,
    /// Measurements keyed by several dimensions
    Fact,
}

/// Static description of one destination table
#[derive(Debug)]
pub struct TableManifest {
    pub name: &'static str,
    pub kind: TableKind,
    /// Ordered business key columns
    pub business_key: &'static [ColumnDef],
    /// Descriptive columns compared for change detection
    pub attributes: &'static [ColumnDef],
}

/// A record coerced against a manifest, aligned to its column order
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    pub key: Vec<Value>,
    pub attributes: Vec<Value>,
}

impl TableManifest {
    /// Coerce a raw record into typed key + attribute values.
    ///
    /// Record column names are normalized before lookup and columns the
    /// manifest does not know are ignored. A key column that is absent, null
    /// or blank is a `MissingKey`; optional attributes may be null.
    pub fn normalize(&self, record: &Record) -> Result<TypedRecord, UpsertError> {
        let normalized: HashMap<String, &serde_json::Value> = record
            .iter()
            .map(|(name, value)| (normalize_column_name(name), value))
            .collect();

        let mut key = Vec::with_capacity(self.business_key.len());
        for column in self.business_key {
            let value = self.coerce_column(column, normalized.get(column.name).copied())?;
            if value.is_null() {
                return Err(UpsertError::MissingKey {
                    table: self.name,
                    column: column.name,
                });
            }
            key.push(value);
        }

        let attributes = self
            .attributes
            .iter()
            .map(|column| self.coerce_column(column, normalized.get(column.name).copied()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TypedRecord { key, attributes })
    }

    /// Type positional key parts (CLI, URLs) against the business key columns
    pub fn parse_key(&self, parts: &[String]) -> Result<Vec<Value>, UpsertError> {
        if parts.len() > self.business_key.len() {
            return Err(UpsertError::KeyArity {
                table: self.name,
                expected: self.business_key.len(),
                got: parts.len(),
            });
        }

        let record: Record = self
            .business_key
            .iter()
            .zip(parts)
            .map(|(column, part)| (column.name.to_string(), serde_json::Value::String(part.clone())))
            .collect();

        Ok(self.normalize(&record)?.key)
    }

    fn coerce_column(
        &self,
        column: &ColumnDef,
        raw: Option<&serde_json::Value>,
    ) -> Result<Value, UpsertError> {
        Value::coerce(raw, column.ty).map_err(|value| UpsertError::TypeMismatch {
            table: self.name,
            column: column.name,
            expected: column.ty,
            value,
        })
    }

    /// Human-readable key, used in logs and errors: `(holder_id=H1)`
    pub fn describe_key(&self, key: &[Value]) -> String {
        let parts: Vec<String> = self
            .business_key
            .iter()
            .zip(key)
            .map(|(column, value)| format!("{}={}", column.name, value))
            .collect();
        format!("({})", parts.join(", "))
    }

    /// All declared column names (key, attributes)
    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.business_key
            .iter()
            .chain(self.attributes.iter())
            .map(|column| column.name)
    }

    pub fn is_fact(&self) -> bool {
        self.kind == TableKind::Fact
    }

    // ========================================================================
    // DDL
    // ========================================================================

    /// `CREATE TABLE IF NOT EXISTS` for this manifest
    pub fn create_table_sql(&self) -> String {
        let mut columns = vec!["version_id INTEGER PRIMARY KEY AUTOINCREMENT".to_string()];

        for column in self.business_key {
            columns.push(format!("{} {} NOT NULL", column.name, column.ty.sql_type()));
        }
        for column in self.attributes {
            columns.push(format!("{} {}", column.name, column.ty.sql_type()));
        }

        columns.push("created_at TEXT NOT NULL".to_string());
        columns.push("updated_at TEXT NOT NULL".to_string());
        columns.push("valid_from TEXT NOT NULL".to_string());
        columns.push("valid_to TEXT".to_string());
        columns.push(
            "is_current INTEGER NOT NULL DEFAULT 1 CHECK (is_current IN (0, 1))".to_string(),
        );

        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name,
            columns.join(",\n    ")
        )
    }

    /// Index statements: a lookup index on the key and a partial unique
    /// index that lets the store itself refuse a second current row
    pub fn index_sql(&self) -> Vec<String> {
        let key_list = self.key_list();
        vec![
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_key ON {table} ({keys})",
                table = self.name,
                keys = key_list
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS ux_{table}_current ON {table} ({keys}) WHERE is_current = 1",
                table = self.name,
                keys = key_list
            ),
        ]
    }

    // ========================================================================
    // DML (rowid aliases version_id, and exists on script-created tables too)
    // ========================================================================

    /// Params: key values. Columns: rowid, created_at, valid_from, attributes...
    pub(crate) fn select_current_sql(&self) -> String {
        format!(
            "SELECT rowid, created_at, valid_from, {attrs} FROM {table} WHERE {cond} AND is_current = 1",
            attrs = self.attribute_list(),
            table = self.name,
            cond = self.key_condition(1)
        )
    }

    /// Params: ?1 = now, ?2 = rowid
    pub(crate) fn close_sql(&self) -> String {
        format!(
            "UPDATE {} SET is_current = 0, valid_to = ?1, updated_at = ?1 WHERE rowid = ?2 AND is_current = 1",
            self.name
        )
    }

    /// Params: key values, attribute values, created_at, now
    pub(crate) fn insert_sql(&self) -> String {
        let n = self.business_key.len() + self.attributes.len();
        let placeholders: Vec<String> = (1..=n).map(|i| format!("?{}", i)).collect();

        format!(
            "INSERT INTO {table} ({cols}, created_at, updated_at, valid_from, valid_to, is_current) \
             VALUES ({vals}, ?{created}, ?{now}, ?{now}, NULL, 1)",
            table = self.name,
            cols = self.column_names().collect::<Vec<_>>().join(", "),
            vals = placeholders.join(", "),
            created = n + 1,
            now = n + 2
        )
    }

    /// Params: attribute values, now, rowid
    pub(crate) fn overwrite_sql(&self) -> String {
        let n = self.attributes.len();
        let assignments: Vec<String> = self
            .attributes
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", column.name, i + 1))
            .collect();

        format!(
            "UPDATE {table} SET {sets}, updated_at = ?{now} WHERE rowid = ?{row} AND is_current = 1",
            table = self.name,
            sets = assignments.join(", "),
            now = n + 1,
            row = n + 2
        )
    }

    /// Columns: rowid, keys..., attributes..., created_at, updated_at,
    /// valid_from, valid_to, is_current. `filter` is built from the manifest.
    pub(crate) fn select_versions_sql(&self, filter: VersionFilter) -> String {
        let condition = match filter {
            VersionFilter::Key => self.key_condition(1),
            VersionFilter::Current => "is_current = 1".to_string(),
            VersionFilter::All => "1 = 1".to_string(),
        };

        format!(
            "SELECT rowid, {cols}, created_at, updated_at, valid_from, valid_to, is_current \
             FROM {table} WHERE {cond} ORDER BY {keys}, rowid",
            cols = self.column_names().collect::<Vec<_>>().join(", "),
            table = self.name,
            cond = condition,
            keys = self.key_list()
        )
    }

    fn key_list(&self) -> String {
        self.business_key
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn attribute_list(&self) -> String {
        self.attributes
            .iter()
            .map(|column| column.name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `k1 = ?start AND k2 = ?start+1 ...`
    fn key_condition(&self, start: usize) -> String {
        self.business_key
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", column.name, start + i))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VersionFilter {
    Key,
    Current,
    All,
}

// ============================================================================
// TESTS
// ============================================================================
