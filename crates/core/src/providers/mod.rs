//! Fact Model providers: adapters that turn an external source (a disassembler export, or
//! the binary itself) into a [`FactModel`].

#[cfg(feature = "capstone-backend")]
pub mod capstone;
pub mod snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::FactModel;

#[cfg(feature = "capstone-backend")]
pub use self::capstone::CapstoneProvider;
pub use snapshot::{FactSnapshot, SnapshotProvider};

/// What to extract facts from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactRequest {
    pub path: PathBuf,
    /// Optional architecture hint (e.g., x86_64, arm64, armv7).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Instruction budget per procedure for providers that disassemble.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_instructions: Option<usize>,
}

impl FactRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), arch: None, max_instructions: None }
    }
}

/// The provider could not supply a fact stream. Fatal to one run.
#[derive(Debug, Error)]
pub enum FactAccessError {
    #[error("Binary not found at {0}")]
    MissingBinary(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed input {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("Fact provider error: {0}")]
    Backend(String),
}

/// Source of facts for one binary. Implementations must hand back a complete snapshot or
/// an error, never a partial model.
pub trait FactProvider: Send + Sync {
    fn facts(&self, request: &FactRequest) -> Result<FactModel, FactAccessError>;
    fn name(&self) -> &'static str;
}

/// Registry for fact providers; callers select by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Box<dyn FactProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { providers: HashMap::new() }
    }

    pub fn register<P: FactProvider + 'static>(&mut self, provider: P) -> &mut Self {
        self.providers.insert(provider.name().to_string(), Box::new(provider));
        self
    }

    pub fn get(&self, name: &str) -> Option<&dyn FactProvider> {
        self.providers.get(name).map(|p| &**p)
    }

    /// Sorted provider names for error messages/help.
    pub fn names(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.providers.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Registry populated with every provider compiled into this build.
pub fn default_provider_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(SnapshotProvider);
    #[cfg(feature = "capstone-backend")]
    {
        registry.register(CapstoneProvider);
    }
    registry
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// `<file name>@sha256:<hex>`
pub fn binary_identifier(path: &Path, bytes: &[u8]) -> String {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("binary");
    format!("{name}@sha256:{}", sha256_hex(bytes))
}

pub(crate) fn read_input(path: &Path) -> Result<Vec<u8>, FactAccessError> {
    if !path.is_file() {
        return Err(FactAccessError::MissingBinary(path.to_path_buf()));
    }
    std::fs::read(path)
        .map_err(|source| FactAccessError::Unreadable { path: path.to_path_buf(), source })
}
