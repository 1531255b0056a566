// ⚠️ Error Taxonomy
// Record-level errors reject one record, table-level errors abort the batch.

use serde::{Deserialize, Serialize};

use crate::attributes::AttributeType;

// ============================================================================
// UPSERT ERROR
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum UpsertError {
    /// The incoming record lacks (or has a blank) business-key attribute
    #[error("table `{table}`: record is missing business key `{column}`")]
    MissingKey {
        table: &'static str,
        column: &'static str,
    },

    /// More than one current row for one business key
    #[error("table `{table}`: {count} current rows for key {key}")]
    InvariantViolation {
        table: &'static str,
        key: String,
        count: usize,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// A value cannot be coerced to the column's semantic type
    #[error("table `{table}`: column `{column}` expects {expected}, got `{value}`")]
    TypeMismatch {
        table: &'static str,
        column: &'static str,
        expected: AttributeType,
        value: String,
    },

    /// A lookup key with more parts than the table's business key
    #[error("table `{table}`: business key has {expected} part(s), got {got}")]
    KeyArity {
        table: &'static str,
        expected: usize,
        got: usize,
    },
}

impl UpsertError {
    /// Errors that abort the whole batch regardless of strict mode
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UpsertError::InvariantViolation { .. } | UpsertError::Persistence(_)
        )
    }

    pub fn kind(&self) -> RejectKind {
        match self {
            UpsertError::MissingKey { .. } => RejectKind::MissingKey,
            UpsertError::TypeMismatch { .. } => RejectKind::TypeMismatch,
            UpsertError::InvariantViolation { .. } => RejectKind::InvariantViolation,
            UpsertError::Persistence(_) => RejectKind::Persistence,
            UpsertError::KeyArity { .. } => RejectKind::KeyArity,
        }
    }
}

// ============================================================================
// RECORD ERROR (lenient mode)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectKind {
    MissingKey,
    TypeMismatch,
    InvariantViolation,
    Persistence,
    KeyArity,
}

/// A record that was rejected while the rest of the batch went on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    /// Position of the record in the incoming batch
    pub index: usize,
    pub kind: RejectKind,
    pub message: String,
}

impl RecordError {
    pub fn new(index: usize, error: &UpsertError) -> Self {
        RecordError {
            index,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let missing = UpsertError::MissingKey {
            table: "agents",
            column: "holder_id",
        };
        let corrupt = UpsertError::InvariantViolation {
            table: "agents",
            key: "(H1)".to_string(),
            count: 2,
        };

        assert!(!missing.is_fatal());
        assert!(corrupt.is_fatal());
        assert!(UpsertError::Persistence(rusqlite::Error::InvalidQuery).is_fatal());
    }

    #[test]
    fn test_record_error_carries_message() {
        let err = UpsertError::TypeMismatch {
            table: "agents",
            column: "holder_age",
            expected: AttributeType::Integer,
            value: "forty".to_string(),
        };

        let record_error = RecordError::new(3, &err);
        assert_eq!(record_error.index, 3);
        assert_eq!(record_error.kind, RejectKind::TypeMismatch);
        assert!(record_error.message.contains("holder_age"));
        assert!(record_error.message.contains("forty"));
    }
}
