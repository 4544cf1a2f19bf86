//! sigscope-core
//!
//! Signature-based technique detection over facts extracted from a disassembled binary.
//!
//! A run flows strictly left to right:
//! fact model -> matching engine -> composite correlator -> scoring/dedup -> report builder.
//!
//! All substantive logic lives here so it is fully testable and reusable from multiple
//! frontends (the `sigscope` CLI, host-disassembler plugins, etc.). Rendering and
//! persistence of reports are left to the caller through [`engine::report::ReportSink`].

pub mod analyzers;
pub mod config;
pub mod engine;
pub mod model;
pub mod providers;
pub mod registry;

pub use analyzers::Analyzer;
pub use engine::pipeline::{CancellationToken, Pipeline, RunError, RunOutcome, Stage};
pub use engine::report::Report;
pub use model::{Category, FactModel};
pub use registry::{Registry, RegistryLoadError};

/// Returns the library version as encoded at compile time.
///
/// Useful for tests and for frontends to report consistent version info.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
