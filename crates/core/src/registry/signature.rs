use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::model::{Category, InstructionPattern};

/// Which fact text a regex clause is applied to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegexTarget {
    /// Symbol names and named cross-reference targets.
    Symbol,
    /// String literal values.
    #[default]
    String,
}

impl RegexTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegexTarget::Symbol => "symbol",
            RegexTarget::String => "string",
        }
    }
}

/// One element of an opcode window. Operand text, when given, is a substring test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeStep {
    pub mnemonic: String,
    pub operands: Option<String>,
}

impl OpcodeStep {
    pub fn matches(&self, insn: &InstructionPattern) -> bool {
        insn.mnemonic == self.mnemonic
            && self.operands.as_deref().map_or(true, |needle| insn.operands.contains(needle))
    }
}

/// Set and/or inclusive interval membership over numeric constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericPattern {
    pub values: BTreeSet<u64>,
    pub range: Option<RangeInclusive<u64>>,
}

impl NumericPattern {
    pub fn contains(&self, value: u64) -> bool {
        self.values.contains(&value) || self.range.as_ref().is_some_and(|r| r.contains(&value))
    }
}

/// A single clause of a signature. Every clause of a signature must hit inside the same
/// procedure for the signature to match.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Case-sensitive exact symbol names (imports, exports, named call targets).
    ExactName(BTreeSet<String>),
    /// Case-sensitive substrings searched for in string literals.
    StringContains(Vec<String>),
    Regex { target: RegexTarget, regex: Regex },
    Numeric(NumericPattern),
    /// Contiguous instruction window within one procedure.
    OpcodeSequence(Vec<OpcodeStep>),
}

impl Pattern {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Pattern::ExactName(_) => "symbols",
            Pattern::StringContains(_) => "strings",
            Pattern::Regex { .. } => "regex",
            Pattern::Numeric(_) => "numbers",
            Pattern::OpcodeSequence(_) => "opcodes",
        }
    }

    /// Compact human-readable rendering for listings.
    pub fn summary(&self) -> String {
        match self {
            Pattern::ExactName(names) => {
                format!("symbols [{}]", names.iter().cloned().collect::<Vec<_>>().join(", "))
            }
            Pattern::StringContains(needles) => format!("strings {:?}", needles),
            Pattern::Regex { target, regex } => {
                format!("regex on {}: /{}/", target.as_str(), regex.as_str())
            }
            Pattern::Numeric(num) => {
                let mut parts: Vec<String> = num.values.iter().map(|v| format!("0x{v:x}")).collect();
                if let Some(range) = &num.range {
                    parts.push(format!("0x{:x}..=0x{:x}", range.start(), range.end()));
                }
                format!("numbers [{}]", parts.join(", "))
            }
            Pattern::OpcodeSequence(steps) => {
                let rendered: Vec<String> = steps
                    .iter()
                    .map(|s| match &s.operands {
                        Some(ops) => format!("{} *{}*", s.mnemonic, ops),
                        None => s.mnemonic.clone(),
                    })
                    .collect();
                format!("opcodes [{}]", rendered.join("; "))
            }
        }
    }
}

/// A validated, immutable technique signature.
#[derive(Debug, Clone)]
pub struct Signature {
    pub id: String,
    pub category: Category,
    pub description: String,
    /// Base weight in `(0, 1]`.
    pub weight: f64,
    pub clauses: Vec<Pattern>,
    /// Position in the registry; used for deterministic tie-breaks.
    pub order: usize,
}

impl Signature {
    pub fn is_multi_clause(&self) -> bool {
        self.clauses.len() > 1
    }
}

/// Declared fusion of co-occurring signatures (same category, same procedure) into one
/// finding.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeRule {
    pub id: String,
    pub category: Category,
    pub description: String,
    pub signatures: Vec<String>,
    /// Extra independent weight in `[0, 1)` folded in when the rule fires.
    pub boost: f64,
    pub order: usize,
}
