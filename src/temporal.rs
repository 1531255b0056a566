// ⏰ Temporal Model - SCD2 Upsert Engine
//
// Every business key has a chain of versions:
//   ABSENT → CURRENT → (close + open) → ... → CURRENT
//
// A superseded version is closed (is_current = 0, valid_to = now) and a new
// current version is inserted in the same transaction, stamped with the same
// `now`, so closed.valid_to == superseding.valid_from.

use crate::attributes::Value;
use crate::config::LoadOptions;
use crate::db::{read_timestamp, read_value};
use crate::error::UpsertError;
use crate::schema::{Record, TableManifest, TypedRecord};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Timestamp layout written by older loaders (naive, UTC)
const LEGACY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ============================================================================
// TIME
// ============================================================================

/// Source of "now" for version stamping
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// RFC 3339, microseconds, `Z` suffix: sorts lexicographically in time order
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp (RFC 3339, or the legacy `YYYY-MM-DD HH:MM:SS`)
pub fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(text) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(rfc_err) => NaiveDateTime::parse_from_str(text, LEGACY_TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(|_| rfc_err),
    }
}

// ============================================================================
// POLICIES
// ============================================================================

/// What to do when an incoming record equals the current version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// No write when attributes are unchanged
    #[default]
    SuppressUnchanged,
    /// Every apply writes a new version, changed or not
    AppendAlways,
}

/// How a changed record is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Versioning {
    /// Close the current version, insert a new one
    #[default]
    Scd2,
    /// Rewrite the current version's attributes in place (no history)
    Overwrite,
}

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionOutcome {
    /// First version of a new business key
    Created { version_id: i64 },
    /// Previous version closed, new version inserted
    Superseded { closed: i64, inserted: i64 },
    /// Same attributes as the current version, nothing written
    Unchanged { version_id: i64 },
    /// Current version rewritten in place
    Overwritten { version_id: i64 },
}

impl VersionOutcome {
    pub fn versions_inserted(&self) -> usize {
        match self {
            VersionOutcome::Created { .. } | VersionOutcome::Superseded { .. } => 1,
            _ => 0,
        }
    }

    pub fn versions_closed(&self) -> usize {
        match self {
            VersionOutcome::Superseded { .. } => 1,
            _ => 0,
        }
    }

    /// Row that is current after the apply
    pub fn current_version_id(&self) -> i64 {
        match *self {
            VersionOutcome::Created { version_id }
            | VersionOutcome::Unchanged { version_id }
            | VersionOutcome::Overwritten { version_id } => version_id,
            VersionOutcome::Superseded { inserted, .. } => inserted,
        }
    }
}

/// The current row of one business key, as needed by the engine
#[derive(Debug, Clone)]
struct CurrentVersion {
    row_id: i64,
    created_at: DateTime<Utc>,
    valid_from: DateTime<Utc>,
    attributes: Vec<Value>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// SCD2 upsert for one table
///
/// Dimensions are always versioned. Fact tables follow
/// `LoadOptions::fact_versioning`.
pub struct Scd2Engine<'m> {
    manifest: &'m TableManifest,
    policy: ChangePolicy,
    versioning: Versioning,
    clock: Arc<dyn Clock>,
}

impl<'m> Scd2Engine<'m> {
    pub fn new(manifest: &'m TableManifest, options: &LoadOptions) -> Self {
        let versioning = if manifest.is_fact() {
            options.fact_versioning
        } else {
            Versioning::Scd2
        };

        Scd2Engine {
            manifest,
            policy: options.change_policy,
            versioning,
            clock: Arc::new(SystemClock),
        }
    }

    /// Builder: replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn manifest(&self) -> &'m TableManifest {
        self.manifest
    }

    pub fn versioning(&self) -> Versioning {
        self.versioning
    }

    /// Apply one record in its own write transaction.
    ///
    /// The record is typed before the transaction opens, so a `MissingKey`
    /// or `TypeMismatch` never writes anything.
    pub fn apply(
        &self,
        conn: &mut Connection,
        record: &Record,
    ) -> Result<VersionOutcome, UpsertError> {
        let typed = self.manifest.normalize(record)?;

        // IMMEDIATE takes the write lock before the current-row lookup
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = self.apply_typed(&tx, &typed)?;
        tx.commit()?;

        Ok(outcome)
    }

    /// Apply an already typed record inside the caller's transaction
    pub fn apply_typed(
        &self,
        tx: &Transaction<'_>,
        record: &TypedRecord,
    ) -> Result<VersionOutcome, UpsertError> {
        let table = self.manifest.name;

        let current = match self.lookup_current(tx, &record.key)? {
            None => {
                let now = self.clock.now();
                let version_id = self.insert_version(tx, record, now, now)?;
                debug!(table, key = %self.manifest.describe_key(&record.key), version_id, "created");
                return Ok(VersionOutcome::Created { version_id });
            }
            Some(current) => current,
        };

        if self.policy == ChangePolicy::SuppressUnchanged && current.attributes == record.attributes {
            debug!(table, key = %self.manifest.describe_key(&record.key), "unchanged");
            return Ok(VersionOutcome::Unchanged {
                version_id: current.row_id,
            });
        }

        // One `now` for close and insert; never earlier than the version it supersedes
        let now = self.clock.now().max(current.valid_from);

        match self.versioning {
            Versioning::Scd2 => {
                self.close_version(tx, current.row_id, now)?;
                let inserted = self.insert_version(tx, record, current.created_at, now)?;
                debug!(
                    table,
                    key = %self.manifest.describe_key(&record.key),
                    closed = current.row_id,
                    inserted,
                    "superseded"
                );
                Ok(VersionOutcome::Superseded {
                    closed: current.row_id,
                    inserted,
                })
            }
            Versioning::Overwrite => {
                self.overwrite_version(tx, current.row_id, record, now)?;
                debug!(table, key = %self.manifest.describe_key(&record.key), version_id = current.row_id, "overwritten");
                Ok(VersionOutcome::Overwritten {
                    version_id: current.row_id,
                })
            }
        }
    }

    fn lookup_current(
        &self,
        conn: &Connection,
        key: &[Value],
    ) -> Result<Option<CurrentVersion>, UpsertError> {
        let attributes = self.manifest.attributes;
        let mut stmt = conn.prepare_cached(&self.manifest.select_current_sql())?;

        let mut rows = stmt
            .query_map(params_from_iter(key.iter()), |row| {
                let values = attributes
                    .iter()
                    .enumerate()
                    .map(|(i, column)| read_value(row, i + 3, column.ty))
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                Ok(CurrentVersion {
                    row_id: row.get(0)?,
                    created_at: read_timestamp(row, 1)?,
                    valid_from: read_timestamp(row, 2)?,
                    attributes: values,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            count => {
                let key = self.manifest.describe_key(key);
                error!(table = self.manifest.name, %key, count, "multiple current rows");
                Err(UpsertError::InvariantViolation {
                    table: self.manifest.name,
                    key,
                    count,
                })
            }
        }
    }

    fn close_version(
        &self,
        conn: &Connection,
        row_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), UpsertError> {
        let mut stmt = conn.prepare_cached(&self.manifest.close_sql())?;
        stmt.execute(params![format_timestamp(now), row_id])?;
        Ok(())
    }

    fn insert_version(
        &self,
        conn: &Connection,
        record: &TypedRecord,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64, UpsertError> {
        let created_at = format_timestamp(created_at);
        let now = format_timestamp(now);

        let mut values: Vec<&dyn ToSql> =
            Vec::with_capacity(record.key.len() + record.attributes.len() + 2);
        values.extend(record.key.iter().map(|v| v as &dyn ToSql));
        values.extend(record.attributes.iter().map(|v| v as &dyn ToSql));
        values.push(&created_at);
        values.push(&now);

        let mut stmt = conn.prepare_cached(&self.manifest.insert_sql())?;
        stmt.execute(params_from_iter(values))?;

        Ok(conn.last_insert_rowid())
    }

    fn overwrite_version(
        &self,
        conn: &Connection,
        row_id: i64,
        record: &TypedRecord,
        now: DateTime<Utc>,
    ) -> Result<(), UpsertError> {
        let now = format_timestamp(now);

        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(record.attributes.len() + 2);
        values.extend(record.attributes.iter().map(|v| v as &dyn ToSql));
        values.push(&now);
        values.push(&row_id);

        let mut stmt = conn.prepare_cached(&self.manifest.overwrite_sql())?;
        stmt.execute(params_from_iter(values))?;
        Ok(())
    }
}

// ============================================================================
// TEST CLOCK
// ============================================================================


// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::test_clock::ManualClock;
    use super::*;
    use crate::db::{bootstrap, fetch_history, table_stats};
    use crate::entities::{AGENTS, BOB};
    use chrono::Duration;
    use serde_json::json;

    fn setup() -> (Connection, Arc<ManualClock>) {
        let conn = Connection::open_in_memory().unwrap();
        bootstrap(&conn).unwrap();
        (conn, Arc::new(ManualClock::starting_2024()))
    }

    fn agent(holder_id: &str, name: &str) -> Record {
        let mut record = Record::new();
        record.insert("holder_id".to_string(), json!(holder_id));
        record.insert("holder_name".to_string(), json!(name));
        record.insert("holder_age".to_string(), json!("34"));
        record
    }

    fn bob(holder_id: &str, policy_id: &str, delay: i64) -> Record {
        let mut record = Record::new();
        record.insert("holder_id".to_string(), json!(holder_id));
        record.insert("policy_id".to_string(), json!(policy_id));
        record.insert("days_of_payment_delay".to_string(), json!(delay));
        record.insert("commission_amount".to_string(), json!("120.50"));
        record.insert("members".to_string(), json!(2));
        record
    }

    fn key(parts: &[&str]) -> Vec<Value> {
        parts.iter().map(|p| Value::Text(p.to_string())).collect()
    }

    #[test]
    fn test_first_version_then_superseding_version() {
        let (mut conn, clock) = setup();
        let engine = Scd2Engine::new(&AGENTS, &LoadOptions::default()).with_clock(clock.clone());

        let first = engine.apply(&mut conn, &agent("H1", "Ana")).unwrap();
        assert!(matches!(first, VersionOutcome::Created { .. }));

        let history = fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_current);
        assert!(history[0].valid_to.is_none());

        clock.advance(Duration::minutes(5));
        let second = engine.apply(&mut conn, &agent("H1", "Ana María")).unwrap();
        assert_eq!(second.versions_inserted(), 1);
        assert_eq!(second.versions_closed(), 1);

        let history = fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap();
        assert_eq!(history.len(), 2);

        let (old, new) = (&history[0], &history[1]);
        assert!(!old.is_current);
        assert!(old.valid_to.is_some());
        assert_eq!(old.attributes["holder_name"], Value::Text("Ana".to_string()));
        assert!(new.is_current);
        assert!(new.valid_to.is_none());
        assert_eq!(new.attributes["holder_name"], Value::Text("Ana María".to_string()));

        // Shared creation time, no gap between versions
        assert_eq!(old.created_at, new.created_at);
        assert_eq!(old.valid_to, Some(new.valid_from));
        assert_eq!(old.updated_at, new.valid_from);
    }

    #[test]
    fn test_suppress_unchanged_keeps_single_version() {
        let (mut conn, clock) = setup();
        let engine = Scd2Engine::new(&AGENTS, &LoadOptions::default()).with_clock(clock.clone());

        let first = engine.apply(&mut conn, &agent("H1", "Ana")).unwrap();
        clock.advance(Duration::seconds(30));
        let second = engine.apply(&mut conn, &agent("H1", "Ana")).unwrap();

        assert_eq!(
            second,
            VersionOutcome::Unchanged {
                version_id: first.current_version_id()
            }
        );
        assert_eq!(fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap().len(), 1);
    }

    #[test]
    fn test_append_always_writes_identical_versions() {
        let (mut conn, clock) = setup();
        let options = LoadOptions {
            change_policy: ChangePolicy::AppendAlways,
            ..LoadOptions::default()
        };
        let engine = Scd2Engine::new(&AGENTS, &options).with_clock(clock.clone());

        engine.apply(&mut conn, &agent("H1", "Ana")).unwrap();
        clock.advance(Duration::seconds(30));
        engine.apply(&mut conn, &agent("H1", "Ana")).unwrap();

        let history = fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].attributes, history[1].attributes);
        assert_ne!(history[0].valid_from, history[1].valid_from);
        assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);
    }

    #[test]
    fn test_created_at_stable_across_many_versions() {
        let (mut conn, clock) = setup();
        let engine = Scd2Engine::new(&AGENTS, &LoadOptions::default()).with_clock(clock.clone());

        for i in 0..5 {
            engine.apply(&mut conn, &agent("H1", &format!("Name {}", i))).unwrap();
            clock.advance(Duration::hours(1));
        }

        let history = fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap();
        assert_eq!(history.len(), 5);
        assert!(history.iter().all(|v| v.created_at == history[0].created_at));
        for pair in history.windows(2) {
            assert_eq!(pair[0].valid_to, Some(pair[1].valid_from));
        }
        assert_eq!(history.iter().filter(|v| v.is_current).count(), 1);
        assert!(history[4].is_current);
    }

    #[test]
    fn test_missing_key_writes_nothing() {
        let (mut conn, clock) = setup();
        let engine = Scd2Engine::new(&AGENTS, &LoadOptions::default()).with_clock(clock);

        let mut record = agent("H1", "Ana");
        record.remove("holder_id");

        let err = engine.apply(&mut conn, &record).unwrap_err();
        assert!(matches!(err, UpsertError::MissingKey { column: "holder_id", .. }));
        assert_eq!(table_stats(&conn, &AGENTS).unwrap().total_versions, 0);
    }

    #[test]
    fn test_null_optional_attribute_is_stored_as_null() {
        let (mut conn, clock) = setup();
        let engine = Scd2Engine::new(&AGENTS, &LoadOptions::default()).with_clock(clock);

        let mut record = agent("H1", "Ana");
        record.insert("holder_address".to_string(), json!(null));
        engine.apply(&mut conn, &record).unwrap();

        let history = fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap();
        assert_eq!(history[0].attributes["holder_address"], Value::Null);
        assert_eq!(history[0].attributes["holder_incomes"], Value::Null);
    }

    #[test]
    fn test_composite_key_isolation() {
        let (mut conn, clock) = setup();
        let engine = Scd2Engine::new(&BOB, &LoadOptions::default()).with_clock(clock.clone());

        engine.apply(&mut conn, &bob("A", "1", 0)).unwrap();
        engine.apply(&mut conn, &bob("A", "2", 0)).unwrap();
        engine.apply(&mut conn, &bob("B", "1", 0)).unwrap();

        clock.advance(Duration::days(1));
        let outcome = engine.apply(&mut conn, &bob("A", "1", 15)).unwrap();
        assert!(matches!(outcome, VersionOutcome::Superseded { .. }));

        assert_eq!(fetch_history(&conn, &BOB, &key(&["A", "1"])).unwrap().len(), 2);
        for other in [["A", "2"], ["B", "1"]] {
            let history = fetch_history(&conn, &BOB, &key(&other)).unwrap();
            assert_eq!(history.len(), 1);
            assert!(history[0].is_current);
            assert_eq!(history[0].updated_at, history[0].created_at);
        }
    }

    #[test]
    fn test_clock_skew_never_inverts_interval() {
        let (mut conn, clock) = setup();
        let engine = Scd2Engine::new(&AGENTS, &LoadOptions::default()).with_clock(clock.clone());

        engine.apply(&mut conn, &agent("H1", "Ana")).unwrap();
        let first_from = fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap()[0].valid_from;

        // Clock jumps backwards
        clock.set(first_from - Duration::hours(2));
        engine.apply(&mut conn, &agent("H1", "Ana María")).unwrap();

        let history = fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap();
        assert_eq!(history[0].valid_to, Some(first_from));
        assert_eq!(history[1].valid_from, first_from);
    }

    #[test]
    fn test_fact_overwrite_mode_mutates_in_place() {
        let (mut conn, clock) = setup();
        let options = LoadOptions {
            fact_versioning: Versioning::Overwrite,
            ..LoadOptions::default()
        };
        let engine = Scd2Engine::new(&BOB, &options).with_clock(clock.clone());
        assert_eq!(engine.versioning(), Versioning::Overwrite);

        let first = engine.apply(&mut conn, &bob("H1", "P1", 0)).unwrap();
        clock.advance(Duration::days(1));
        let second = engine.apply(&mut conn, &bob("H1", "P1", 30)).unwrap();

        assert_eq!(
            second,
            VersionOutcome::Overwritten {
                version_id: first.current_version_id()
            }
        );

        let history = fetch_history(&conn, &BOB, &key(&["H1", "P1"])).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_current);
        assert_eq!(history[0].attributes["days_of_payment_delay"], Value::Integer(30));
        assert!(history[0].updated_at > history[0].valid_from);
        assert_eq!(history[0].created_at, history[0].valid_from);
    }

    #[test]
    fn test_dimensions_ignore_fact_versioning() {
        let options = LoadOptions {
            fact_versioning: Versioning::Overwrite,
            ..LoadOptions::default()
        };
        assert_eq!(Scd2Engine::new(&AGENTS, &options).versioning(), Versioning::Scd2);
    }

    #[test]
    fn test_multiple_current_rows_is_invariant_violation() {
        let (mut conn, clock) = setup();
        let engine = Scd2Engine::new(&AGENTS, &LoadOptions::default()).with_clock(clock);

        // Simulate prior corruption: drop the guard index, duplicate the current row
        engine.apply(&mut conn, &agent("H1", "Ana")).unwrap();
        conn.execute_batch(
            "DROP INDEX ux_agents_current;
             INSERT INTO agents (holder_id, holder_name, created_at, updated_at, valid_from, is_current)
             SELECT holder_id, 'Dup', created_at, updated_at, valid_from, 1 FROM agents;",
        )
        .unwrap();

        let err = engine.apply(&mut conn, &agent("H1", "Ana María")).unwrap_err();
        match err {
            UpsertError::InvariantViolation { table, key, count } => {
                assert_eq!(table, "agents");
                assert_eq!(key, "(holder_id=H1)");
                assert_eq!(count, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // Nothing closed, nothing added
        let history = fetch_history(&conn, &AGENTS, &key(&["H1"])).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|v| v.is_current));
    }

    #[test]
    fn test_timestamp_round_trip_and_legacy_format() {
        let ts = Utc::now();
        let parsed = parse_timestamp(&format_timestamp(ts)).unwrap();
        assert_eq!(parsed.timestamp_micros(), ts.timestamp_micros());

        let legacy = parse_timestamp("2024-11-16 09:30:00").unwrap();
        assert_eq!(format_timestamp(legacy), "2024-11-16T09:30:00.000000Z");

        assert!(parse_timestamp("yesterday").is_err());
    }
}
