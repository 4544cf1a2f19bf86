//! Signature Registry: the declarative catalogue of technique signatures and composite rules.
//!
//! The registry is built once (from the embedded default catalogue or a directory of YAML
//! files), validated as a whole, and never mutated afterwards. Per-category match indexes
//! (hash sets, automata, compiled regex sets) are precomputed here so every run reuses them.

pub mod catalogue;
pub mod signature;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use thiserror::Error;
use tracing::debug;

use crate::engine::matcher::SignatureIndex;
use crate::model::Category;

pub use catalogue::{CatalogueFile, CATALOGUE_VERSION};
pub use signature::{CompositeRule, NumericPattern, OpcodeStep, Pattern, RegexTarget, Signature};

/// Embedded default catalogue, one document per category in canonical order.
const DEFAULT_CATALOGUE: [(&str, &str); 12] = [
    ("anti-debug.yaml", include_str!("../../signatures/anti-debug.yaml")),
    ("c2.yaml", include_str!("../../signatures/c2.yaml")),
    ("file-ops.yaml", include_str!("../../signatures/file-ops.yaml")),
    ("keychain.yaml", include_str!("../../signatures/keychain.yaml")),
    ("mach-ipc.yaml", include_str!("../../signatures/mach-ipc.yaml")),
    ("network.yaml", include_str!("../../signatures/network.yaml")),
    ("persistence.yaml", include_str!("../../signatures/persistence.yaml")),
    ("privilege-escalation.yaml", include_str!("../../signatures/privilege-escalation.yaml")),
    ("process-injection.yaml", include_str!("../../signatures/process-injection.yaml")),
    ("rootkit.yaml", include_str!("../../signatures/rootkit.yaml")),
    ("syscall.yaml", include_str!("../../signatures/syscall.yaml")),
    ("xpc.yaml", include_str!("../../signatures/xpc.yaml")),
];

/// A malformed catalogue. Fatal: no analysis can run against an inconsistent registry.
#[derive(Debug, Error)]
pub enum RegistryLoadError {
    #[error("Failed to read catalogue {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse catalogue {source_name}: {message}")]
    Parse { source_name: String, message: String },
    #[error("Catalogue {source_name} has version {found}; only version {supported} is supported")]
    UnsupportedVersion { source_name: String, found: u32, supported: u32 },
    #[error("Catalogue {source_name} declares unknown category '{category}'")]
    UnknownCategory { source_name: String, category: String },
    #[error("Duplicate signature or rule id '{0}'")]
    DuplicateId(String),
    #[error("Signature '{0}' has an empty pattern")]
    EmptyPattern(String),
    #[error("Signature '{id}' has weight {weight}; weights must lie in (0, 1]")]
    InvalidWeight { id: String, weight: f64 },
    #[error("Signature '{id}' has an invalid regex: {message}")]
    InvalidRegex { id: String, message: String },
    #[error("Signature '{id}' is malformed: {reason}")]
    MalformedSignature { id: String, reason: String },
    #[error("Rule '{rule}' references unknown signature '{signature}'")]
    UnknownRuleSignature { rule: String, signature: String },
    #[error("Rule '{rule}' ({rule_category}) references '{signature}' from category {signature_category}")]
    CrossCategoryRule {
        rule: String,
        rule_category: Category,
        signature: String,
        signature_category: Category,
    },
    #[error("Rule '{rule}' is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("Failed to build match index for {category}: {message}")]
    Index { category: Category, message: String },
    #[error("No catalogue files (*.yaml, *.yml) found in {0}")]
    EmptyCatalogue(PathBuf),
}

/// Immutable, validated catalogue shared read-only across runs.
#[derive(Debug)]
pub struct Registry {
    signatures: Vec<Signature>,
    rules: Vec<CompositeRule>,
    by_id: HashMap<String, usize>,
    indexes: BTreeMap<Category, SignatureIndex>,
}

impl Registry {
    /// Load the embedded default catalogue.
    pub fn load() -> Result<Self, RegistryLoadError> {
        Self::from_documents(
            DEFAULT_CATALOGUE.iter().map(|(name, body)| (name.to_string(), body.to_string())),
        )
    }

    /// Process-wide default registry, loaded on first use.
    pub fn shared() -> Result<&'static Registry, &'static RegistryLoadError> {
        static SHARED: OnceLock<Result<Registry, RegistryLoadError>> = OnceLock::new();
        SHARED.get_or_init(Registry::load).as_ref()
    }

    /// Load every `*.yaml` / `*.yml` file of a directory, in file-name order.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, RegistryLoadError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir)
            .map_err(|source| RegistryLoadError::Io { path: dir.to_path_buf(), source })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|source| RegistryLoadError::Io { path: dir.to_path_buf(), source })?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
            if is_yaml && path.is_file() {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(RegistryLoadError::EmptyCatalogue(dir.to_path_buf()));
        }
        paths.sort();

        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let body = fs::read_to_string(&path)
                .map_err(|source| RegistryLoadError::Io { path: path.clone(), source })?;
            documents.push((path.display().to_string(), body));
        }
        Self::from_documents(documents)
    }

    /// Build a registry from a single YAML document.
    pub fn from_yaml(source_name: &str, body: &str) -> Result<Self, RegistryLoadError> {
        Self::from_documents([(source_name.to_string(), body.to_string())])
    }

    /// Build a registry from `(source name, body)` documents. Registry order is document
    /// order, then declaration order within each document.
    pub fn from_documents<I>(documents: I) -> Result<Self, RegistryLoadError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut signatures: Vec<Signature> = Vec::new();
        let mut pending_rules = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();
        let mut rule_ids: HashSet<String> = HashSet::new();

        for (source_name, body) in documents {
            let file = CatalogueFile::parse(&source_name, &body)?;
            let category = file.category(&source_name)?;

            for raw in file.signatures {
                let sig = raw.validate(category, signatures.len())?;
                if by_id.contains_key(&sig.id) {
                    return Err(RegistryLoadError::DuplicateId(sig.id));
                }
                by_id.insert(sig.id.clone(), signatures.len());
                signatures.push(sig);
            }
            for raw in file.rules {
                let order = pending_rules.len();
                let rule = raw.validate(category, order)?;
                if !rule_ids.insert(rule.id.clone()) {
                    return Err(RegistryLoadError::DuplicateId(rule.id));
                }
                pending_rules.push(rule);
            }
        }

        // Rules may reference signatures declared in later documents, so resolve at the end.
        for rule in &pending_rules {
            if by_id.contains_key(&rule.id) {
                return Err(RegistryLoadError::DuplicateId(rule.id.clone()));
            }
            for sig_id in &rule.signatures {
                let Some(&idx) = by_id.get(sig_id) else {
                    return Err(RegistryLoadError::UnknownRuleSignature {
                        rule: rule.id.clone(),
                        signature: sig_id.clone(),
                    });
                };
                let sig_category = signatures[idx].category;
                if sig_category != rule.category {
                    return Err(RegistryLoadError::CrossCategoryRule {
                        rule: rule.id.clone(),
                        rule_category: rule.category,
                        signature: sig_id.clone(),
                        signature_category: sig_category,
                    });
                }
            }
        }

        let mut indexes = BTreeMap::new();
        for category in Category::ALL {
            let subset: Vec<&Signature> =
                signatures.iter().filter(|s| s.category == category).collect();
            indexes.insert(category, SignatureIndex::build(category, &subset)?);
        }

        debug!(
            signatures = signatures.len(),
            rules = pending_rules.len(),
            "signature registry loaded"
        );

        Ok(Self { signatures, rules: pending_rules, by_id, indexes })
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Every signature in registry order.
    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    /// Every composite rule in declaration order.
    pub fn rules(&self) -> &[CompositeRule] {
        &self.rules
    }

    /// Stable, registry-ordered view of one category's signatures.
    pub fn signatures_for(&self, category: Category) -> Vec<&Signature> {
        self.signatures.iter().filter(|s| s.category == category).collect()
    }

    pub fn rules_for(&self, category: Category) -> Vec<&CompositeRule> {
        self.rules.iter().filter(|r| r.category == category).collect()
    }

    pub fn signature(&self, id: &str) -> Option<&Signature> {
        self.by_id.get(id).map(|&idx| &self.signatures[idx])
    }

    /// Precomputed match index for one category.
    pub fn index_for(&self, category: Category) -> Option<&SignatureIndex> {
        self.indexes.get(&category)
    }
}
