// Entity Models
// Three entity kinds share one engine; each module owns its manifest,
// its projection from the extracted file and its load operation.

pub mod agents;
pub mod bob;
pub mod policies;

pub use agents::{load_agents, transform_agents, AGENTS};
pub use bob::{load_bob, transform_bob, BOB};
pub use policies::{load_policies, transform_policies, POLICIES};

use crate::config::LoadOptions;
use crate::error::UpsertError;
use crate::loader::{load_batch, BatchOutcome};
use crate::parser::project;
use crate::schema::{Record, TableManifest};
use rusqlite::Connection;

/// Every destination table, in load order
pub static ALL: [&TableManifest; 3] = [&AGENTS, &POLICIES, &BOB];

/// Look up a manifest by table name
pub fn manifest_for(table: &str) -> Option<&'static TableManifest> {
    ALL.iter().copied().find(|manifest| manifest.name == table)
}

/// Project full extracted rows onto `manifest` and load them
pub fn load_extracted(
    conn: &mut Connection,
    manifest: &TableManifest,
    extracted: &[Record],
    options: &LoadOptions,
) -> Result<BatchOutcome, UpsertError> {
    let records = project(extracted, manifest);
    load_batch(conn, manifest, &records, options)
}
