// ✅ Data Quality - history audit
// Re-checks stored history per business key: exactly one current row,
// contiguous validity windows, stable created_at.

use crate::db::{fetch_all_versions, VersionRow};
use crate::error::UpsertError;
use crate::schema::TableManifest;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::warn;

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // A history invariant is broken
    Warning,  // History is readable but inconsistent
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityIssue {
    pub severity: Severity,
    pub rule: String,
    pub key: String,
    pub issue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    pub table: String,
    pub keys_checked: usize,
    pub versions_checked: usize,
    pub issues: Vec<QualityIssue>,
}

impl AuditReport {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} keys, {} versions, {} issues ({} critical)",
            self.table,
            self.keys_checked,
            self.versions_checked,
            self.issues.len(),
            self.issues
                .iter()
                .filter(|i| i.severity == Severity::Critical)
                .count()
        )
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == Severity::Critical)
    }
}

// ============================================================================
// AUDIT
// ============================================================================

/// Audit every business key of one table
pub fn audit_table(conn: &Connection, manifest: &TableManifest) -> Result<AuditReport, UpsertError> {
    let versions = fetch_all_versions(conn, manifest)?;

    let mut report = AuditReport {
        table: manifest.name.to_string(),
        keys_checked: 0,
        versions_checked: versions.len(),
        issues: Vec::new(),
    };

    // Rows arrive grouped by key, oldest first
    for history in group_by_key(&versions) {
        report.keys_checked += 1;
        let key = manifest.describe_key(&history[0].key);
        report.issues.extend(check_history(&key, history));
    }

    for issue in report.issues.iter().filter(|i| i.severity == Severity::Critical) {
        warn!(table = manifest.name, key = %issue.key, rule = %issue.rule, "{}", issue.issue);
    }

    Ok(report)
}

fn group_by_key(versions: &[VersionRow]) -> Vec<&[VersionRow]> {
    let mut groups = Vec::new();
    let mut start = 0;

    for i in 1..=versions.len() {
        if i == versions.len() || versions[i].key != versions[start].key {
            if i > start {
                groups.push(&versions[start..i]);
            }
            start = i;
        }
    }

    groups
}

/// Check one key's history (oldest first)
pub fn check_history(key: &str, history: &[VersionRow]) -> Vec<QualityIssue> {
    let mut issues = Vec::new();

    let current = history.iter().filter(|v| v.is_current).count();
    match current {
        1 => {}
        0 => issues.push(issue(
            Severity::Critical,
            "no_current_version",
            key,
            format!("{} versions, none current", history.len()),
        )),
        n => issues.push(issue(
            Severity::Critical,
            "multiple_current_versions",
            key,
            format!("{} current versions", n),
        )),
    }

    if let Some(last) = history.last() {
        if !last.is_current && current > 0 {
            issues.push(issue(
                Severity::Critical,
                "current_not_latest",
                key,
                format!("latest version {} is closed", last.version_id),
            ));
        }
    }

    for version in history {
        match (version.is_current, version.valid_to) {
            (true, Some(valid_to)) => issues.push(issue(
                Severity::Critical,
                "current_with_valid_to",
                key,
                format!("version {} is current but closed at {}", version.version_id, valid_to),
            )),
            (false, None) => issues.push(issue(
                Severity::Critical,
                "closed_without_valid_to",
                key,
                format!("version {} is closed without valid_to", version.version_id),
            )),
            _ => {}
        }

        if let Some(valid_to) = version.valid_to {
            if valid_to < version.valid_from {
                issues.push(issue(
                    Severity::Warning,
                    "inverted_window",
                    key,
                    format!("version {} ends before it starts", version.version_id),
                ));
            }
        }
    }

    for pair in history.windows(2) {
        let (older, newer) = (&pair[0], &pair[1]);

        if let Some(valid_to) = older.valid_to {
            if valid_to != newer.valid_from {
                issues.push(issue(
                    Severity::Warning,
                    "window_gap",
                    key,
                    format!(
                        "version {} ends at {} but version {} starts at {}",
                        older.version_id, valid_to, newer.version_id, newer.valid_from
                    ),
                ));
            }
        }

        if older.created_at != newer.created_at {
            issues.push(issue(
                Severity::Warning,
                "created_at_drift",
                key,
                format!(
                    "created_at changed between versions {} and {}",
                    older.version_id, newer.version_id
                ),
            ));
        }
    }

    issues
}

fn issue(severity: Severity, rule: &str, key: &str, message: String) -> QualityIssue {
    QualityIssue {
        severity,
        rule: rule.to_string(),
        key: key.to_string(),
        issue: message,
    }
}
