use anyhow::Result;
use clap::{ArgGroup, Args, Parser, Subcommand};
use sigscope::commands::{
    analyze_command, analyzers_command, init_command, signatures_command,
    validate_catalogue_command, AnalyzeArgs, AnalyzeInput,
};
use sigscope_core::Analyzer;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Signature-based technique detection for disassembled binaries.
///
/// This CLI is a thin wrapper around `sigscope-core` (exposed in code as `sigscope_core`).
/// Matching, correlation, scoring and report assembly live in the library so they can be
/// tested thoroughly and reused from other frontends.
#[derive(Parser, Debug)]
#[command(name = "sigscope", version, about = "Signature-based technique detection", long_about = None)]
struct Cli {
    /// Workspace root directory. Defaults to the current working directory.
    #[arg(long, global = true, default_value = ".")]
    root: String,

    /// Config file (JSON or YAML). Defaults to `<root>/.sigscope/config.json` when present.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Debug logging for sigscope crates (RUST_LOG takes precedence).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a workspace: `.sigscope/config.json`, `reports/`, `outputs/binaries/`.
    Init {
        /// Optional workspace name. If omitted, the name is derived from the root directory.
        #[arg(long)]
        name: Option<String>,

        /// Overwrite an existing config with defaults.
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Run one analyzer against a binary or a fact snapshot.
    Analyze(AnalyzeCli),

    /// List the analyzers and the categories each one activates.
    Analyzers {
        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List loaded signatures and composite rules.
    Signatures {
        /// Only show one category (e.g. `anti-debug`, `xpc`).
        #[arg(long)]
        category: Option<String>,

        /// Emit JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Load a catalogue directory and report validation errors.
    ValidateCatalogue {
        /// Directory of catalogue YAML files.
        #[arg(long)]
        dir: String,
    },
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("input").required(true).args(["binary", "facts"])))]
struct AnalyzeCli {
    /// Analyzer name (e.g. `anti-analysis`, `process-injection`, `all`).
    analyzer: Analyzer,

    /// Binary to disassemble.
    #[arg(long)]
    binary: Option<String>,

    /// Fact snapshot (JSON or YAML) exported from a disassembler.
    #[arg(long)]
    facts: Option<String>,

    /// Fact provider name (`capstone`, `snapshot`). Defaults by input kind.
    #[arg(long)]
    provider: Option<String>,

    /// Architecture hint for raw binaries (e.g. x86_64, arm64, armv7).
    #[arg(long)]
    arch: Option<String>,

    /// Emit JSON instead of human-readable text.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Also write report.json and run_metadata.json under outputs/binaries/.
    #[arg(long, default_value_t = false)]
    save: bool,

    /// Cap listed findings per category.
    #[arg(long)]
    top: Option<usize>,

    /// Drop findings below this confidence.
    #[arg(long)]
    min_confidence: Option<f64>,
}

impl AnalyzeCli {
    fn into_args(self) -> AnalyzeArgs {
        let input = match (self.binary, self.facts) {
            (Some(binary), _) => AnalyzeInput::Binary(binary),
            (None, Some(facts)) => AnalyzeInput::Facts(facts),
            // clap's required group guarantees one of the two.
            (None, None) => AnalyzeInput::Facts(String::new()),
        };
        AnalyzeArgs {
            analyzer: self.analyzer,
            input,
            provider: self.provider,
            arch: self.arch,
            json: self.json,
            save: self.save,
            top: self.top,
            min_confidence: self.min_confidence,
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("sigscope=debug,sigscope_core=debug")
    } else {
        EnvFilter::new("sigscope=info,sigscope_core=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    debug!(root = %cli.root, config = ?cli.config, "sigscope v{}", sigscope_core::version());

    let config = cli.config.as_deref();
    match cli.command {
        Command::Init { name, force } => init_command(&cli.root, name, force)?,
        Command::Analyze(args) => analyze_command(&cli.root, config, args.into_args())?,
        Command::Analyzers { json } => analyzers_command(json)?,
        Command::Signatures { category, json } => {
            signatures_command(&cli.root, config, category, json)?
        }
        Command::ValidateCatalogue { dir } => validate_catalogue_command(&cli.root, &dir)?,
    }

    Ok(())
}
