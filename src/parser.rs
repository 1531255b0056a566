// 📥 Extraction - source files to loose records
// Headers are normalized (trim, lowercase, spaces -> `_`); blank cells become null.

use crate::attributes::normalize_column_name;
use crate::schema::{Record, TableManifest};
use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, Trim};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

// ============================================================================
// SOURCE FORMATS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    /// A JSON array of objects
    Json,
}

impl SourceFormat {
    /// Detect format from the file extension
    pub fn detect(path: &Path) -> Result<SourceFormat> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match extension.as_deref() {
            Some("csv") | Some("txt") => Ok(SourceFormat::Csv),
            Some("json") => Ok(SourceFormat::Json),
            _ => Err(anyhow!("Unsupported source file: {}", path.display())),
        }
    }
}

/// Read every row of a source file as a loose record
pub fn extract_records(path: &Path) -> Result<Vec<Record>> {
    let format = SourceFormat::detect(path)?;
    let file = File::open(path)
        .with_context(|| format!("Failed to open source file: {}", path.display()))?;
    let reader = BufReader::new(file);

    let records = match format {
        SourceFormat::Csv => read_csv(reader)
            .with_context(|| format!("Failed to parse CSV file: {}", path.display()))?,
        SourceFormat::Json => read_json(reader)
            .with_context(|| format!("Failed to parse JSON file: {}", path.display()))?,
    };

    info!(path = %path.display(), rows = records.len(), "extracted source records");
    Ok(records)
}

/// Parse CSV with a header row
pub fn read_csv<R: Read>(reader: R) -> Result<Vec<Record>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(normalize_column_name)
        .collect();

    let mut records = Vec::new();
    for (line_num, row) in reader.records().enumerate() {
        // +2: 1-indexed plus the header row
        let row = row.with_context(|| format!("Failed to parse CSV line {}", line_num + 2))?;

        let record: Record = headers
            .iter()
            .zip(row.iter())
            .map(|(header, cell)| {
                let value = if cell.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::String(cell.to_string())
                };
                (header.clone(), value)
            })
            .collect();

        records.push(record);
    }

    Ok(records)
}

pub fn read_json<R: Read>(reader: R) -> Result<Vec<Record>> {
    let raw: Vec<Record> = serde_json::from_reader(reader)?;

    Ok(raw
        .into_iter()
        .map(|record| {
            record
                .into_iter()
                .map(|(name, value)| (normalize_column_name(&name), value))
                .collect()
        })
        .collect())
}

// ============================================================================
// PROJECTION
// ============================================================================

/// Keep only the columns a table knows about
pub fn project(records: &[Record], manifest: &TableManifest) -> Vec<Record> {
    let columns: Vec<&str> = manifest.column_names().collect();

    records
        .iter()
        .map(|record| {
            record
                .iter()
                .filter(|(name, _)| columns.contains(&normalize_column_name(name).as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{AGENTS, BOB};
    use serde_json::json;
    use std::io::Write;

    const SAMPLE: &str = "Holder ID,Holder Name,Holder Age,Policy ID,Commission Amount\n\
                          H1, Ana ,34,P1,\"1,250.50\"\n\
                          H2,Luis,,P2,80\n";

    #[test]
    fn test_csv_headers_are_normalized() {
        let records = read_csv(SAMPLE.as_bytes()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["holder_id"], json!("H1"));
        assert_eq!(records[0]["holder_name"], json!("Ana"));
        assert_eq!(records[0]["commission_amount"], json!("1,250.50"));
    }

    #[test]
    fn test_blank_cells_become_null() {
        let records = read_csv(SAMPLE.as_bytes()).unwrap();
        assert_eq!(records[1]["holder_age"], serde_json::Value::Null);
    }

    #[test]
    fn test_project_per_table() {
        let records = read_csv(SAMPLE.as_bytes()).unwrap();

        let agents = project(&records, &AGENTS);
        assert!(agents[0].contains_key("holder_name"));
        assert!(!agents[0].contains_key("policy_id"));

        let bob = project(&records, &BOB);
        assert!(bob[0].contains_key("policy_id"));
        assert!(bob[0].contains_key("commission_amount"));
        assert!(!bob[0].contains_key("holder_name"));
    }

    #[test]
    fn test_read_json_records() {
        let input = r#"[{"Holder ID": "H1", "holder_age": 34}]"#;
        let records = read_json(input.as_bytes()).unwrap();
        assert_eq!(records[0]["holder_id"], json!("H1"));
        assert_eq!(records[0]["holder_age"], json!(34));
    }

    #[test]
    fn test_extract_from_file() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let records = extract_records(file.path()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = extract_records(Path::new("/nonexistent/insurance_data.csv")).unwrap_err();
        assert!(err.to_string().contains("Failed to open source file"));
    }

    #[test]
    fn test_unsupported_extension() {
        assert!(SourceFormat::detect(Path::new("data.xlsx")).is_err());
        assert_eq!(SourceFormat::detect(Path::new("DATA.CSV")).unwrap(), SourceFormat::Csv);
    }
}
