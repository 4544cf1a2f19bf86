//! On-disk catalogue format and its validation into [`Signature`] / [`CompositeRule`].

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::signature::{
    CompositeRule, NumericPattern, OpcodeStep, Pattern, RegexTarget, Signature,
};
use super::RegistryLoadError;
use crate::model::Category;

/// Catalogue format version this crate understands.
pub const CATALOGUE_VERSION: u32 = 1;

/// One catalogue document (typically one YAML file per category).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CatalogueFile {
    pub version: u32,
    /// Category identifier; validated separately so unknown names get a precise error.
    pub category: String,
    #[serde(default)]
    pub signatures: Vec<RawSignature>,
    #[serde(default)]
    pub rules: Vec<RawRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSignature {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub weight: f64,
    #[serde(rename = "match", default)]
    pub clauses: Vec<RawClause>,
}

/// Exactly one pattern kind must be set per clause.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawClause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<RegexTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numbers: Option<RawNumbers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opcodes: Option<Vec<RawOpcodeStep>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawNumbers {
    #[serde(default)]
    pub values: Vec<u64>,
    #[serde(default)]
    pub min: Option<u64>,
    #[serde(default)]
    pub max: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawOpcodeStep {
    Mnemonic(String),
    Detailed {
        mnemonic: String,
        #[serde(default)]
        operands: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRule {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub signatures: Vec<String>,
    #[serde(default)]
    pub boost: f64,
}

impl CatalogueFile {
    /// Parse a YAML (or JSON, which is valid YAML) catalogue document.
    pub fn parse(source_name: &str, body: &str) -> Result<Self, RegistryLoadError> {
        let file: CatalogueFile = serde_yaml::from_str(body).map_err(|e| {
            RegistryLoadError::Parse { source_name: source_name.to_string(), message: e.to_string() }
        })?;
        if file.version != CATALOGUE_VERSION {
            return Err(RegistryLoadError::UnsupportedVersion {
                source_name: source_name.to_string(),
                found: file.version,
                supported: CATALOGUE_VERSION,
            });
        }
        Ok(file)
    }

    pub fn category(&self, source_name: &str) -> Result<Category, RegistryLoadError> {
        self.category.parse::<Category>().map_err(|_| RegistryLoadError::UnknownCategory {
            source_name: source_name.to_string(),
            category: self.category.clone(),
        })
    }
}

impl RawSignature {
    pub fn validate(self, category: Category, order: usize) -> Result<Signature, RegistryLoadError> {
        let id = self.id.trim().to_string();
        if id.is_empty() {
            return Err(RegistryLoadError::MalformedSignature {
                id: format!("<unnamed #{order}>"),
                reason: "signature id must not be empty".into(),
            });
        }
        if !(self.weight > 0.0 && self.weight <= 1.0) {
            return Err(RegistryLoadError::InvalidWeight { id, weight: self.weight });
        }
        if self.clauses.is_empty() {
            return Err(RegistryLoadError::EmptyPattern(id));
        }

        let clauses = self
            .clauses
            .into_iter()
            .map(|clause| clause.validate(&id))
            .collect::<Result<Vec<_>, _>>()?;

        let description = if self.description.trim().is_empty() {
            id.clone()
        } else {
            self.description.trim().to_string()
        };

        Ok(Signature { id, category, description, weight: self.weight, clauses, order })
    }
}

impl RawClause {
    fn kinds_set(&self) -> usize {
        [
            self.symbols.is_some(),
            self.strings.is_some(),
            self.regex.is_some(),
            self.numbers.is_some(),
            self.opcodes.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    fn validate(self, id: &str) -> Result<Pattern, RegistryLoadError> {
        let malformed = |reason: &str| RegistryLoadError::MalformedSignature {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        match self.kinds_set() {
            0 => return Err(RegistryLoadError::EmptyPattern(id.to_string())),
            1 => {}
            _ => return Err(malformed("a match clause must set exactly one pattern kind")),
        }
        if self.on.is_some() && self.regex.is_none() {
            return Err(malformed("'on' is only valid alongside 'regex'"));
        }

        if let Some(symbols) = self.symbols {
            let names: BTreeSet<String> = non_blank(symbols);
            if names.is_empty() {
                return Err(RegistryLoadError::EmptyPattern(id.to_string()));
            }
            return Ok(Pattern::ExactName(names));
        }

        if let Some(strings) = self.strings {
            let needles: Vec<String> = non_blank(strings).into_iter().collect();
            if needles.is_empty() {
                return Err(RegistryLoadError::EmptyPattern(id.to_string()));
            }
            return Ok(Pattern::StringContains(needles));
        }

        if let Some(pattern) = self.regex {
            if pattern.is_empty() {
                return Err(RegistryLoadError::EmptyPattern(id.to_string()));
            }
            let regex = Regex::new(&pattern).map_err(|e| RegistryLoadError::InvalidRegex {
                id: id.to_string(),
                message: e.to_string(),
            })?;
            return Ok(Pattern::Regex { target: self.on.unwrap_or_default(), regex });
        }

        if let Some(numbers) = self.numbers {
            let range = match (numbers.min, numbers.max) {
                (None, None) => None,
                (min, max) => {
                    let (lo, hi) = (min.unwrap_or(0), max.unwrap_or(u64::MAX));
                    if lo > hi {
                        return Err(malformed("numeric range has min greater than max"));
                    }
                    Some(lo..=hi)
                }
            };
            if numbers.values.is_empty() && range.is_none() {
                return Err(RegistryLoadError::EmptyPattern(id.to_string()));
            }
            let values = numbers.values.into_iter().collect();
            return Ok(Pattern::Numeric(NumericPattern { values, range }));
        }

        let steps = self.opcodes.unwrap_or_default();
        if steps.is_empty() {
            return Err(RegistryLoadError::EmptyPattern(id.to_string()));
        }
        let steps = steps
            .into_iter()
            .map(|step| {
                let (mnemonic, operands) = match step {
                    RawOpcodeStep::Mnemonic(m) => (m, None),
                    RawOpcodeStep::Detailed { mnemonic, operands } => (mnemonic, operands),
                };
                let mnemonic = mnemonic.trim().to_lowercase();
                if mnemonic.is_empty() {
                    return Err(RegistryLoadError::EmptyPattern(id.to_string()));
                }
                let operands = operands
                    .map(|o| o.trim().to_lowercase())
                    .filter(|o| !o.is_empty());
                Ok(OpcodeStep { mnemonic, operands })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Pattern::OpcodeSequence(steps))
    }
}

impl RawRule {
    pub fn validate(self, category: Category, order: usize) -> Result<CompositeRule, RegistryLoadError> {
        let id = self.id.trim().to_string();
        let invalid = |reason: String| RegistryLoadError::InvalidRule {
            rule: if id.is_empty() { format!("<unnamed #{order}>") } else { id.clone() },
            reason,
        };
        if id.is_empty() {
            return Err(invalid("rule id must not be empty".into()));
        }

        let mut seen = BTreeSet::new();
        let mut signatures = Vec::new();
        for sig in self.signatures {
            let sig = sig.trim().to_string();
            if sig.is_empty() {
                continue;
            }
            if !seen.insert(sig.clone()) {
                return Err(invalid(format!("signature '{sig}' listed twice")));
            }
            signatures.push(sig);
        }
        if signatures.len() < 2 {
            return Err(invalid("a composite rule needs at least two signatures".into()));
        }
        if !(0.0..1.0).contains(&self.boost) {
            return Err(invalid(format!("boost {} must lie in [0, 1)", self.boost)));
        }

        let description = if self.description.trim().is_empty() {
            id.clone()
        } else {
            self.description.trim().to_string()
        };

        Ok(CompositeRule { id, category, description, signatures, boost: self.boost, order })
    }
}

fn non_blank(values: Vec<String>) -> BTreeSet<String> {
    values.into_iter().filter(|v| !v.trim().is_empty()).collect()
}
