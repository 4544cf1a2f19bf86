use std::fs;

use anyhow::{Context, Result};
use sigscope_core::config::{EngineConfig, WorkspaceLayout};

use crate::commands::print_dir_status;
use crate::{canonicalize_or_current, infer_workspace_name};

/// Create `.sigscope/config.json` and the output directories under `root`.
///
/// An existing config is left untouched unless `force` is set.
pub fn init_command(root: &str, name: Option<String>, force: bool) -> Result<()> {
    let root_path = canonicalize_or_current(root)?;
    let layout = WorkspaceLayout::new(&root_path);
    let workspace_name = name.unwrap_or_else(|| infer_workspace_name(&root_path));

    for dir in layout.directories() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let wrote_config = if layout.config_path.exists() && !force {
        false
    } else {
        EngineConfig::named(&workspace_name).save(&layout.config_path).with_context(|| {
            format!("Failed to write config: {}", layout.config_path.display())
        })?;
        true
    };

    println!("Initialized sigscope workspace:");
    println!("  Name: {workspace_name}");
    println!("  Root: {}", layout.root.display());
    println!(
        "  Config: {}{}",
        layout.config_path.display(),
        if wrote_config { "" } else { " (existing, kept)" }
    );
    println!("Directories:");
    print_dir_status("Meta dir (.sigscope)", &layout.meta_dir);
    print_dir_status("Reports dir", &layout.reports_dir);
    print_dir_status("Outputs dir", &layout.outputs_dir);
    print_dir_status("Per-binary outputs", &layout.outputs_binaries_dir);

    Ok(())
}
