use crate::attributes::{AttributeType, Value};
use crate::entities;
use crate::error::UpsertError;
use crate::schema::{TableManifest, VersionFilter};
use crate::temporal::parse_timestamp;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params_from_iter, Connection, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// How long a writer waits for another connection's write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// One stored version of a business key
#[derive(Debug, Clone, Serialize)]
pub struct VersionRow {
    pub version_id: i64,
    pub key: Vec<Value>,
    pub attributes: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

/// Row counts for one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub table: String,
    pub total_versions: i64,
    pub current_rows: i64,
    pub closed_rows: i64,
}

// ============================================================================
// CONNECTION & BOOTSTRAP
// ============================================================================

/// Open the destination store: WAL journal + busy timeout so concurrent
/// writers queue on the write lock instead of failing
pub fn open_database(path: &Path) -> Result<Connection, UpsertError> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<(), UpsertError> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

/// Create the destination tables from the built-in manifests (idempotent)
pub fn bootstrap(conn: &Connection) -> Result<(), UpsertError> {
    for manifest in entities::ALL {
        create_table(conn, manifest)?;
    }
    Ok(())
}

/// Create only the tables that do not exist yet.
///
/// Tables made by `run_sql_script` keep their own DDL and indexes.
pub fn ensure_tables(conn: &Connection) -> Result<Vec<&'static str>, UpsertError> {
    let mut created = Vec::new();
    for manifest in entities::ALL {
        if !table_exists(conn, manifest.name)? {
            create_table(conn, manifest)?;
            created.push(manifest.name);
        }
    }
    Ok(created)
}

fn create_table(conn: &Connection, manifest: &TableManifest) -> Result<(), UpsertError> {
    conn.execute(&manifest.create_table_sql(), [])?;
    for index in manifest.index_sql() {
        conn.execute(&index, [])?;
    }
    info!(table = manifest.name, "table ready");
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, UpsertError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Execute an external DDL script once, in a single transaction
pub fn run_sql_script(conn: &mut Connection, script_path: &Path) -> Result<()> {
    let script = std::fs::read_to_string(script_path)
        .with_context(|| format!("Failed to read SQL script {}", script_path.display()))?;

    let tx = conn.transaction()?;
    tx.execute_batch(&script)
        .with_context(|| format!("Failed to execute SQL script {}", script_path.display()))?;
    tx.commit()?;

    info!(script = %script_path.display(), "schema script executed");
    Ok(())
}

// ============================================================================
// ROW DECODING
// ============================================================================

pub(crate) fn read_value(row: &Row<'_>, idx: usize, ty: AttributeType) -> rusqlite::Result<Value> {
    let raw = row.get_ref(idx)?;
    Value::decode(ty, raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, raw.data_type(), Box::new(e)))
}

pub(crate) fn read_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_timestamp(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn read_optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        parse_timestamp(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn map_version_row(manifest: &TableManifest, row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    let key_len = manifest.business_key.len();
    let attr_len = manifest.attributes.len();
    let tail = 1 + key_len + attr_len;

    let key = manifest
        .business_key
        .iter()
        .enumerate()
        .map(|(i, column)| read_value(row, 1 + i, column.ty))
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut attributes = BTreeMap::new();
    for (i, column) in manifest.attributes.iter().enumerate() {
        attributes.insert(
            column.name.to_string(),
            read_value(row, 1 + key_len + i, column.ty)?,
        );
    }

    Ok(VersionRow {
        version_id: row.get(0)?,
        key,
        attributes,
        created_at: read_timestamp(row, tail)?,
        updated_at: read_timestamp(row, tail + 1)?,
        valid_from: read_timestamp(row, tail + 2)?,
        valid_to: read_optional_timestamp(row, tail + 3)?,
        is_current: row.get(tail + 4)?,
    })
}

// ============================================================================
// QUERIES
// ============================================================================

fn query_versions(
    conn: &Connection,
    manifest: &TableManifest,
    filter: VersionFilter,
    key: &[Value],
) -> Result<Vec<VersionRow>, UpsertError> {
    let mut stmt = conn.prepare(&manifest.select_versions_sql(filter))?;

    let rows = stmt
        .query_map(params_from_iter(key.iter()), |row| map_version_row(manifest, row))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows)
}

/// Every version of one business key, oldest first
pub fn fetch_history(
    conn: &Connection,
    manifest: &TableManifest,
    key: &[Value],
) -> Result<Vec<VersionRow>, UpsertError> {
    if let Some(column) = manifest.business_key.get(key.len()) {
        return Err(UpsertError::MissingKey {
            table: manifest.name,
            column: column.name,
        });
    }
    query_versions(conn, manifest, VersionFilter::Key, key)
}

/// Current version of every business key
pub fn fetch_current(conn: &Connection, manifest: &TableManifest) -> Result<Vec<VersionRow>, UpsertError> {
    query_versions(conn, manifest, VersionFilter::Current, &[])
}

/// Whole table, grouped by key, each key oldest first
pub fn fetch_all_versions(
    conn: &Connection,
    manifest: &TableManifest,
) -> Result<Vec<VersionRow>, UpsertError> {
    query_versions(conn, manifest, VersionFilter::All, &[])
}

pub fn table_stats(conn: &Connection, manifest: &TableManifest) -> Result<TableStats, UpsertError> {
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN is_current = 1 THEN 1 ELSE 0 END), 0) FROM {}",
        manifest.name
    );
    let (total, current): (i64, i64) = conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;

    Ok(TableStats {
        table: manifest.name.to_string(),
        total_versions: total,
        current_rows: current,
        closed_rows: total - current,
    })
}
