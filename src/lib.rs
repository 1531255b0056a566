// Insurance SCD2 Loader - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod attributes;   // Semantic types + value coercion
pub mod config;       // Per-run load options
pub mod data_quality; // History audit
pub mod db;           // Connection, bootstrap, history queries
pub mod entities;     // agents / policies / bob manifests
pub mod error;        // Error taxonomy
pub mod loader;       // Batch loading
pub mod parser;       // CSV/JSON extraction
pub mod schema;       // Table manifests + SQL generation
pub mod temporal;     // SCD2 engine

// Re-export commonly used types
pub use attributes::{AttributeType, Value};
pub use config::LoadOptions;
pub use data_quality::{audit_table, AuditReport, QualityIssue, Severity};
pub use db::{
    bootstrap, ensure_tables, fetch_all_versions, fetch_current, fetch_history, open_database,
    run_sql_script, table_stats, TableStats, VersionRow,
};
pub use entities::{
    load_agents, load_bob, load_extracted, load_policies, manifest_for, AGENTS, BOB, POLICIES,
};
pub use error::{RecordError, RejectKind, UpsertError};
pub use loader::{apply_batch, load_batch, BatchOutcome};
pub use parser::{extract_records, project, read_csv};
pub use schema::{Record, TableKind, TableManifest, TypedRecord};
pub use temporal::{
    ChangePolicy, Clock, Scd2Engine, SystemClock, VersionOutcome, Versioning,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
