use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sigscope_core::config::{EngineConfig, WorkspaceLayout};
use sigscope_core::Registry;

use crate::canonicalize_or_current;

/// Resolved workspace for one invocation: root, layout, and effective config.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub layout: WorkspaceLayout,
    pub config: EngineConfig,
    /// Config file actually read, if any.
    pub config_source: Option<PathBuf>,
}

impl Workspace {
    /// `--config` wins over `<root>/.sigscope/config.json`; a missing workspace config
    /// falls back to defaults, a missing explicit config is an error.
    pub fn open(root: &str, config: Option<&str>) -> Result<Self> {
        let root_path = canonicalize_or_current(root)?;
        let layout = WorkspaceLayout::new(&root_path);

        let (config, config_source) = match config {
            Some(explicit) => {
                let path = PathBuf::from(explicit);
                let loaded = EngineConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?;
                (loaded, Some(path))
            }
            None => {
                let loaded = EngineConfig::load_or_default(&layout.config_path).with_context(|| {
                    format!("Failed to load workspace config {}", layout.config_path.display())
                })?;
                let source = layout.config_path.is_file().then(|| layout.config_path.clone());
                (loaded, source)
            }
        };

        Ok(Self { layout, config, config_source })
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Configured catalogue directory, or the embedded default catalogue.
    pub fn load_registry(&self) -> Result<Registry> {
        let registry = self.config.load_registry(self.root()).with_context(|| {
            match self.config.catalogue_dir(self.root()) {
                Some(dir) => format!("Failed to load signature catalogue from {}", dir.display()),
                None => "Failed to load the built-in signature catalogue".to_string(),
            }
        })?;
        Ok(registry)
    }
}

/// Resolve `path` against the workspace root unless it is already absolute.
pub fn resolve_input(root: &Path, path: &str) -> PathBuf {
    let input = Path::new(path);
    if input.is_absolute() {
        input.to_path_buf()
    } else if input.exists() {
        input.to_path_buf()
    } else {
        root.join(input)
    }
}

/// Helper to print whether a directory exists.
pub fn print_dir_status(label: &str, path: &Path) {
    let exists = path.is_dir();
    println!("- {label}: {} ({})", if exists { "OK" } else { "MISSING" }, path.display());
}
