use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sigscope_core::registry::{Pattern, Signature};
use sigscope_core::{Analyzer, Category, Registry};

use crate::commands::{resolve_input, Workspace};

#[derive(Serialize)]
pub struct AnalyzerInfo {
    pub name: &'static str,
    pub title: &'static str,
    pub categories: Vec<Category>,
}

#[derive(Serialize)]
pub struct SignatureInfo {
    pub id: String,
    pub category: Category,
    pub weight: f64,
    pub description: String,
    pub clauses: Vec<String>,
}

#[derive(Serialize)]
pub struct RuleInfo {
    pub id: String,
    pub category: Category,
    pub boost: f64,
    pub description: String,
    pub signatures: Vec<String>,
}

#[derive(Serialize)]
pub struct CatalogueListing {
    pub signatures: Vec<SignatureInfo>,
    pub rules: Vec<RuleInfo>,
}

fn clause_summaries(sig: &Signature) -> Vec<String> {
    sig.clauses.iter().map(Pattern::summary).collect()
}

/// List the analyzers and the categories each activates.
pub fn analyzers_command(json: bool) -> Result<()> {
    let analyzers: Vec<AnalyzerInfo> = Analyzer::ALL
        .iter()
        .map(|a| AnalyzerInfo { name: a.as_str(), title: a.title(), categories: a.categories() })
        .collect();

    if json {
        let serialized = serde_json::to_string_pretty(&analyzers)
            .context("Failed to serialize analyzers to JSON")?;
        println!("{serialized}");
        return Ok(());
    }

    println!("Analyzers ({}):", analyzers.len());
    for info in analyzers {
        let categories: Vec<&str> = info.categories.iter().map(|c| c.as_str()).collect();
        println!("  - {} - {} [{}]", info.name, info.title, categories.join(", "));
    }
    Ok(())
}

/// List loaded signatures and rules, optionally for one category.
pub fn signatures_command(
    root: &str,
    config: Option<&str>,
    category: Option<String>,
    json: bool,
) -> Result<()> {
    let workspace = Workspace::open(root, config)?;
    let registry = workspace.load_registry()?;

    let filter = category
        .map(|c| c.parse::<Category>().map_err(|e| anyhow!(e)))
        .transpose()?;
    let listing = listing(&registry, filter);

    if json {
        let serialized = serde_json::to_string_pretty(&listing)
            .context("Failed to serialize signatures to JSON")?;
        println!("{serialized}");
        return Ok(());
    }

    println!("Signatures ({}):", listing.signatures.len());
    for sig in &listing.signatures {
        println!("  - {} [{}] weight={} - {}", sig.id, sig.category, sig.weight, sig.description);
        for clause in &sig.clauses {
            println!("      {clause}");
        }
    }
    println!("Rules ({}):", listing.rules.len());
    if listing.rules.is_empty() {
        println!("  (none)");
    }
    for rule in &listing.rules {
        println!(
            "  - {} [{}] boost={} <- {}",
            rule.id,
            rule.category,
            rule.boost,
            rule.signatures.join(" + ")
        );
    }
    Ok(())
}

fn listing(registry: &Registry, filter: Option<Category>) -> CatalogueListing {
    let wanted = |category: Category| filter.map_or(true, |f| f == category);
    let signatures = registry
        .signatures()
        .iter()
        .filter(|s| wanted(s.category))
        .map(|s| SignatureInfo {
            id: s.id.clone(),
            category: s.category,
            weight: s.weight,
            description: s.description.clone(),
            clauses: clause_summaries(s),
        })
        .collect();
    let rules = registry
        .rules()
        .iter()
        .filter(|r| wanted(r.category))
        .map(|r| RuleInfo {
            id: r.id.clone(),
            category: r.category,
            boost: r.boost,
            description: r.description.clone(),
            signatures: r.signatures.clone(),
        })
        .collect();
    CatalogueListing { signatures, rules }
}

/// Load a catalogue directory and report whether it is valid.
pub fn validate_catalogue_command(root: &str, dir: &str) -> Result<()> {
    let root_path = crate::canonicalize_or_current(root)?;
    let dir = resolve_input(&root_path, dir);
    let registry = Registry::load_dir(&dir)
        .with_context(|| format!("Catalogue {} is invalid", dir.display()))?;
    print_catalogue_summary(&dir, &registry);
    Ok(())
}

fn print_catalogue_summary(dir: &Path, registry: &Registry) {
    println!("Catalogue OK: {}", dir.display());
    println!("  Signatures: {}", registry.len());
    println!("  Rules: {}", registry.rules().len());
    for category in Category::ALL {
        let count = registry.signatures_for(category).len();
        if count > 0 {
            println!("  - {category}: {count}");
        }
    }
}
