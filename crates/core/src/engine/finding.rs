use serde::{Deserialize, Serialize};

use crate::model::{Category, Scope};

/// A scored conclusion about one procedure (or the binary as a whole) in one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub location: Scope,
    /// Lowest address among the contributing facts.
    pub address: u64,
    /// Composite rule that fused this finding, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    pub title: String,
    /// Registry-ordered, never empty.
    pub contributing_signatures: Vec<String>,
    pub confidence: f64,
    /// Sorted, de-duplicated fact descriptions.
    pub evidence: Vec<String>,
}

impl Finding {
    pub fn is_composite(&self) -> bool {
        self.contributing_signatures.len() > 1
    }
}
