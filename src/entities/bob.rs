// 💵 Book of Business - payment/commission facts
// One row per (holder, policy). SCD2 by default; in-place overwrite is
// available through `LoadOptions::fact_versioning`.

use crate::attributes::AttributeType;
use crate::config::LoadOptions;
use crate::error::UpsertError;
use crate::loader::{load_batch, BatchOutcome};
use crate::parser::project;
use crate::schema::{ColumnDef, Record, TableKind, TableManifest};
use rusqlite::Connection;

pub static BOB: TableManifest = TableManifest {
    name: "bob",
    kind: TableKind::Fact,
    business_key: &[
        ColumnDef::new("holder_id", AttributeType::Text),
        ColumnDef::new("policy_id", AttributeType::Text),
    ],
    attributes: &[
        ColumnDef::new("days_of_payment_delay", AttributeType::Integer),
        ColumnDef::new("commission_amount", AttributeType::Decimal),
        ColumnDef::new("members", AttributeType::Integer),
    ],
};

pub fn transform_bob(records: &[Record]) -> Vec<Record> {
    project(records, &BOB)
}

pub fn load_bob(
    conn: &mut Connection,
    records: &[Record],
    options: &LoadOptions,
) -> Result<BatchOutcome, UpsertError> {
    load_batch(conn, &BOB, records, options)
}
