use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use insurance_scd2::entities::ALL;
use insurance_scd2::{
    audit_table, bootstrap, ensure_tables, extract_records, fetch_history, load_extracted, manifest_for,
    open_database, run_sql_script, table_stats, ChangePolicy, LoadOptions, TableManifest,
    Versioning,
};

#[derive(Parser, Debug)]
#[command(name = "insurance-scd2", version, about = "SCD2 loader for insurance holder/policy data")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "SCD2_DB_PATH", default_value = "insurance.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the agents, policies and bob tables
    Bootstrap {
        /// Run this DDL script instead of the built-in schema
        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// Extract a source file and load every (or one) table
    Load {
        #[arg(long, env = "SCD2_CSV_PATH", default_value = "insurance_data.csv")]
        csv: PathBuf,

        /// agents, policies or bob
        #[arg(long)]
        entity: Option<String>,

        #[command(flatten)]
        options: LoadArgs,
    },

    /// Print every version of one business key
    History {
        #[arg(long)]
        entity: String,

        /// Business key parts, in key order (bob: holder_id policy_id)
        #[arg(long, num_args = 1..)]
        key: Vec<String>,
    },

    /// Check stored history for broken invariants
    Audit {
        #[arg(long)]
        entity: Option<String>,
    },
}

#[derive(Args, Debug)]
struct LoadArgs {
    #[arg(long, value_enum, env = "SCD2_CHANGE_POLICY", default_value_t = ChangePolicy::SuppressUnchanged)]
    policy: ChangePolicy,

    /// Abort the whole table load on the first rejected record
    #[arg(long, env = "SCD2_STRICT")]
    strict: bool,

    /// Versioning of the bob fact table
    #[arg(long, value_enum, env = "SCD2_FACT_VERSIONING", default_value_t = Versioning::Scd2)]
    fact_versioning: Versioning,
}

impl From<LoadArgs> for LoadOptions {
    fn from(args: LoadArgs) -> Self {
        LoadOptions {
            change_policy: args.policy,
            strict: args.strict,
            fact_versioning: args.fact_versioning,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Bootstrap { script } => run_bootstrap(&cli.db, script),
        Command::Load { csv, entity, options } => run_load(&cli.db, &csv, entity.as_deref(), options.into()),
        Command::History { entity, key } => run_history(&cli.db, &entity, &key),
        Command::Audit { entity } => run_audit(&cli.db, entity.as_deref()),
    }
}

fn resolve(entity: Option<&str>) -> Result<Vec<&'static TableManifest>> {
    match entity {
        Some(name) => manifest_for(name)
            .map(|manifest| vec![manifest])
            .ok_or_else(|| anyhow!("Unknown entity `{}` (expected agents, policies or bob)", name)),
        None => Ok(ALL.to_vec()),
    }
}

fn run_bootstrap(db: &Path, script: Option<PathBuf>) -> Result<()> {
    println!("🔧 Bootstrapping {}", db.display());
    let mut conn = open_database(db)?;

    match script {
        Some(script) => run_sql_script(&mut conn, &script)?,
        None => bootstrap(&conn)?,
    }

    for manifest in ALL {
        let stats = table_stats(&conn, manifest)?;
        println!("✓ {:<9} {} versions", stats.table, stats.total_versions);
    }
    Ok(())
}

fn run_load(db: &Path, source: &Path, entity: Option<&str>, options: LoadOptions) -> Result<()> {
    let manifests = resolve(entity)?;

    println!("📂 Extracting {}", source.display());
    let extracted = extract_records(source)?;
    println!("✓ {} source rows", extracted.len());

    let mut conn = open_database(db)?;
    for table in ensure_tables(&conn)? {
        println!("✓ created missing table {}", table);
    }

    // Each table loads independently; one failure does not stop the others
    let mut failed = Vec::new();
    for manifest in manifests {
        match load_extracted(&mut conn, manifest, &extracted, &options) {
            Ok(outcome) => {
                println!("✓ {}", outcome.summary());
                for rejected in outcome.rejected.iter().take(5) {
                    println!("    row {}: {}", rejected.index, rejected.message);
                }
                if outcome.rejected.len() > 5 {
                    println!("    ... {} more rejected", outcome.rejected.len() - 5);
                }
            }
            Err(e) => {
                error!(table = manifest.name, error = %e, "table load failed");
                println!("✗ {}: {}", manifest.name, e);
                failed.push(manifest.name);
            }
        }
    }

    if !failed.is_empty() {
        bail!("Load failed for: {}", failed.join(", "));
    }
    info!("load complete");
    Ok(())
}

fn run_history(db: &Path, entity: &str, key: &[String]) -> Result<()> {
    let manifest = resolve(Some(entity))?[0];
    let conn = open_database(db)?;

    let key = manifest.parse_key(key)?;
    let history = fetch_history(&conn, manifest, &key)?;

    println!("📜 {} {} - {} versions", manifest.name, manifest.describe_key(&key), history.len());
    for version in &history {
        let attributes: Vec<String> = version
            .attributes
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        let valid_to = version
            .valid_to
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "∞".to_string());

        println!(
            "{} #{} [{} → {}] {}",
            if version.is_current { "●" } else { "○" },
            version.version_id,
            version.valid_from.to_rfc3339(),
            valid_to,
            attributes.join(", ")
        );
    }
    Ok(())
}

fn run_audit(db: &Path, entity: Option<&str>) -> Result<()> {
    let manifests = resolve(entity)?;
    let conn = open_database(db)?;

    let mut critical = false;
    for manifest in manifests {
        let report = audit_table(&conn, manifest)?;
        println!("{} {}", if report.is_clean() { "✓" } else { "⚠" }, report.summary());
        for issue in &report.issues {
            println!("    [{:?}] {} {}: {}", issue.severity, issue.rule, issue.key, issue.issue);
        }
        critical |= report.has_critical_issues();
    }

    if critical {
        bail!("History audit found critical issues");
    }
    Ok(())
}
