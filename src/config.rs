// ⚙️ Load Configuration
// Knobs the orchestration layer sets per run. Missing fields take defaults.

use crate::temporal::{ChangePolicy, Versioning};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// No-op handling when a record equals the current version
    pub change_policy: ChangePolicy,

    /// Reject the whole batch on the first MissingKey/TypeMismatch
    pub strict: bool,

    /// Versioning of the fact table (`bob`); dimensions are always SCD2
    pub fact_versioning: Versioning,
}

impl LoadOptions {
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}
