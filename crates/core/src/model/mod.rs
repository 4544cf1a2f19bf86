//! Core data model: analysis categories and the normalized fact model.
//!
//! Facts are produced by an external provider (see [`crate::providers`]) and are
//! category-agnostic; everything category-specific lives in the signature catalogue.

pub mod category;
pub mod facts;

pub use category::Category;
pub use facts::{
    CrossReference, Fact, FactContext, FactCounts, FactId, FactKind, FactModel,
    InstructionPattern, Location, NumericConstant, Scope, StringLiteral, SymbolKind, SymbolRef,
    XrefKind,
};
