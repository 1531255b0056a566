// 🧑 Agents Dimension - policy holders
// Keyed by holder_id; name, age, contact and income change over time.

use crate::attributes::AttributeType;
use crate::config::LoadOptions;
use crate::error::UpsertError;
use crate::loader::{load_batch, BatchOutcome};
use crate::parser::project;
use crate::schema::{ColumnDef, Record, TableKind, TableManifest};
use rusqlite::Connection;

pub static AGENTS: TableManifest = TableManifest {
    name: "agents",
    kind: TableKind::Dimension,
    business_key: &[ColumnDef::new("holder_id", AttributeType::Text)],
    attributes: &[
        ColumnDef::new("holder_name", AttributeType::Text),
        ColumnDef::new("holder_age", AttributeType::Integer),
        ColumnDef::new("holder_phone_number", AttributeType::Text),
        ColumnDef::new("holder_incomes", AttributeType::Decimal),
        ColumnDef::new("holder_address", AttributeType::Text),
    ],
};

/// Keep only the holder columns of extracted rows
pub fn transform_agents(records: &[Record]) -> Vec<Record> {
    project(records, &AGENTS)
}

pub fn load_agents(
    conn: &mut Connection,
    records: &[Record],
    options: &LoadOptions,
) -> Result<BatchOutcome, UpsertError> {
    load_batch(conn, &AGENTS, records, options)
}
