// 📦 Batch Loader
// One write transaction per batch. Record-level rejects are collected
// (or abort in strict mode); fatal errors roll the whole batch back.

use crate::config::LoadOptions;
use crate::error::{RecordError, UpsertError};
use crate::schema::{Record, TableManifest};
use crate::temporal::{Scd2Engine, VersionOutcome};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

// ============================================================================
// BATCH OUTCOME
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// Correlates log lines of one batch
    pub batch_id: String,
    pub table: String,
    pub received: usize,
    /// New versions written (first versions + superseding versions)
    pub inserted: usize,
    /// Versions closed by a superseding version
    pub closed: usize,
    pub unchanged: usize,
    pub overwritten: usize,
    pub rejected: Vec<RecordError>,
}

impl BatchOutcome {
    fn new(table: &str, received: usize) -> Self {
        BatchOutcome {
            batch_id: Uuid::new_v4().to_string(),
            table: table.to_string(),
            received,
            ..BatchOutcome::default()
        }
    }

    fn record(&mut self, outcome: VersionOutcome) {
        self.inserted += outcome.versions_inserted();
        self.closed += outcome.versions_closed();
        match outcome {
            VersionOutcome::Unchanged { .. } => self.unchanged += 1,
            VersionOutcome::Overwritten { .. } => self.overwritten += 1,
            _ => {}
        }
    }

    /// Every record was applied
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} received, {} inserted, {} closed, {} unchanged, {} overwritten, {} rejected",
            self.table,
            self.received,
            self.inserted,
            self.closed,
            self.unchanged,
            self.overwritten,
            self.rejected.len()
        )
    }
}

// ============================================================================
// LOADING
// ============================================================================

/// Apply a batch of records to `manifest`'s table
pub fn load_batch(
    conn: &mut Connection,
    manifest: &TableManifest,
    records: &[Record],
    options: &LoadOptions,
) -> Result<BatchOutcome, UpsertError> {
    let engine = Scd2Engine::new(manifest, options);
    apply_batch(&engine, conn, records, options.strict)
}

/// Apply a batch through an existing engine (custom clock, shared config)
pub fn apply_batch(
    engine: &Scd2Engine<'_>,
    conn: &mut Connection,
    records: &[Record],
    strict: bool,
) -> Result<BatchOutcome, UpsertError> {
    let manifest = engine.manifest();
    let mut outcome = BatchOutcome::new(manifest.name, records.len());

    let span = info_span!("load_batch", table = manifest.name, batch_id = %outcome.batch_id);
    let _guard = span.enter();

    // Dropping `tx` on any early return rolls the batch back
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    for (index, record) in records.iter().enumerate() {
        let typed = match manifest.normalize(record) {
            Ok(typed) => typed,
            Err(e) if strict => {
                warn!(index, error = %e, "strict mode: rolling back batch");
                return Err(e);
            }
            Err(e) => {
                warn!(index, error = %e, "record rejected");
                outcome.rejected.push(RecordError::new(index, &e));
                continue;
            }
        };

        let applied = engine.apply_typed(&tx, &typed)?;
        outcome.record(applied);
    }

    tx.commit()?;
    info!("{}", outcome.summary());

    Ok(outcome)
}

// ============================================================================
// TESTS
// ============================================================================
