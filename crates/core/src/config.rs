//! Engine configuration and the on-disk workspace layout.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::pipeline::RunOptions;
use crate::model::Category;
use crate::registry::{Registry, RegistryLoadError};

pub const CONFIG_VERSION: &str = "0.1.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Failed to serialize config: {0}")]
    Serialize(String),
}

/// Report shaping knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Per-category cap on listed findings; `None` lists everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
    /// Risk weights; categories not listed weigh 1.0.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub category_weights: BTreeMap<Category, f64>,
    #[serde(default)]
    pub min_confidence: f64,
}

impl ReportConfig {
    /// Effective non-negative weight of `category`.
    pub fn weight_for(&self, category: Category) -> f64 {
        self.category_weights.get(&category).copied().unwrap_or(1.0).max(0.0)
    }
}

fn default_true() -> bool {
    true
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

/// Serializable engine configuration, usually stored at `.sigscope/config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Human-friendly workspace name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Config format version, not the tool version.
    #[serde(default = "default_version")]
    pub config_version: String,
    /// Directory of catalogue YAML files replacing the embedded catalogue. Relative paths
    /// resolve against the workspace root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalogue: Option<PathBuf>,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default = "default_true")]
    pub parallel: bool,
    /// Default fact provider when the command line does not pick one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Instruction budget per procedure for disassembling providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instructions: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: None,
            config_version: default_version(),
            catalogue: None,
            report: ReportConfig::default(),
            parallel: true,
            provider: None,
            max_instructions: None,
        }
    }
}

impl EngineConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    /// Read a config file; `.yaml`/`.yml` parse as YAML, anything else as JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let body = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        let parse_err = |message: String| ConfigError::Parse { path: path.to_path_buf(), message };
        if is_yaml(path) {
            serde_yaml::from_str(&body).map_err(|e| parse_err(e.to_string()))
        } else {
            serde_json::from_str(&body).map_err(|e| parse_err(e.to_string()))
        }
    }

    /// Load `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let body = if is_yaml(path) {
            serde_yaml::to_string(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Io { path: parent.to_path_buf(), source })?;
        }
        fs::write(path, body).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }

    /// Catalogue directory resolved against `root`, if one is configured.
    pub fn catalogue_dir(&self, root: &Path) -> Option<PathBuf> {
        self.catalogue
            .as_ref()
            .map(|dir| if dir.is_absolute() { dir.clone() } else { root.join(dir) })
    }

    /// Load the configured catalogue, or the embedded default.
    pub fn load_registry(&self, root: &Path) -> Result<Registry, RegistryLoadError> {
        match self.catalogue_dir(root) {
            Some(dir) => Registry::load_dir(dir),
            None => Registry::load(),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions { report: self.report.clone(), parallel: self.parallel }
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
}

/// Logical layout of a sigscope workspace. Computing it performs no IO; frontends create
/// the directories.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    /// `.sigscope`
    pub meta_dir: PathBuf,
    pub config_path: PathBuf,
    pub reports_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub outputs_binaries_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let meta_dir = root.join(".sigscope");
        let config_path = meta_dir.join("config.json");
        let reports_dir = root.join("reports");
        let outputs_dir = root.join("outputs");
        let outputs_binaries_dir = outputs_dir.join("binaries");
        Self { root, meta_dir, config_path, reports_dir, outputs_dir, outputs_binaries_dir }
    }

    pub fn binary_output_root(&self, binary_name: &str) -> PathBuf {
        self.outputs_binaries_dir.join(binary_name)
    }

    /// `outputs/binaries/<binary>/<analyzer>/`
    pub fn analyzer_output_dir(&self, binary_name: &str, analyzer: &str) -> PathBuf {
        self.binary_output_root(binary_name).join(analyzer)
    }

    /// Directories `init` creates.
    pub fn directories(&self) -> [&Path; 4] {
        [
            self.meta_dir.as_path(),
            self.reports_dir.as_path(),
            self.outputs_dir.as_path(),
            self.outputs_binaries_dir.as_path(),
        ]
    }
}
