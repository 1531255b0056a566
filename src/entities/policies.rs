// 📄 Policies Dimension
// Keyed by policy_id; coverage dates and carrier are versioned.

use crate::attributes::AttributeType;
use crate::config::LoadOptions;
use crate::error::UpsertError;
use crate::loader::{load_batch, BatchOutcome};
use crate::parser::project;
use crate::schema::{ColumnDef, Record, TableKind, TableManifest};
use rusqlite::Connection;

pub static POLICIES: TableManifest = TableManifest {
    name: "policies",
    kind: TableKind::Dimension,
    business_key: &[ColumnDef::new("policy_id", AttributeType::Text)],
    attributes: &[
        ColumnDef::new("start_date", AttributeType::Date),
        ColumnDef::new("end_date", AttributeType::Date),
        ColumnDef::new("carrier_name", AttributeType::Text),
    ],
};

pub fn transform_policies(records: &[Record]) -> Vec<Record> {
    project(records, &POLICIES)
}

pub fn load_policies(
    conn: &mut Connection,
    records: &[Record],
    options: &LoadOptions,
) -> Result<BatchOutcome, UpsertError> {
    load_batch(conn, &POLICIES, records, options)
}
