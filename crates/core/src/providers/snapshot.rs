//! Fact snapshots exported from a disassembler, stored as JSON or YAML.
//!
//! ```yaml
//! binary: sample
//! symbols:
//!   - { name: ptrace, kind: import }
//! strings:
//!   - { value: LLDB, procedure: main, address: 0x1010 }
//! constants:
//!   - { value: 31, procedure: main, address: 0x1004 }
//! instructions:
//!   - { procedure: main, address: 0x1000, mnemonic: mov, operands: "edi, 0x1f" }
//! xrefs:
//!   - { procedure: main, address: 0x1008, target: 0x2000, target_name: ptrace }
//! ```
//!
//! Addresses and values may be integers or `0x`-prefixed hex strings.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use super::{read_input, FactAccessError, FactProvider, FactRequest};
use crate::model::{
    CrossReference, Fact, FactContext, FactKind, FactModel, Location, NumericConstant, Scope,
    SymbolKind, XrefKind,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactSnapshot {
    #[serde(default)]
    pub binary: String,
    #[serde(default)]
    pub symbols: Vec<SnapshotSymbol>,
    #[serde(default)]
    pub strings: Vec<SnapshotString>,
    #[serde(default)]
    pub constants: Vec<SnapshotConstant>,
    #[serde(default)]
    pub instructions: Vec<SnapshotInstruction>,
    #[serde(default)]
    pub xrefs: Vec<SnapshotXref>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSymbol {
    pub name: String,
    #[serde(default)]
    pub kind: SymbolKind,
    #[serde(default)]
    pub procedure: Option<String>,
    #[serde(default, deserialize_with = "int_or_hex")]
    pub address: u64,
    #[serde(flatten)]
    pub context: FactContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotString {
    pub value: String,
    #[serde(default)]
    pub procedure: Option<String>,
    #[serde(default, deserialize_with = "int_or_hex")]
    pub address: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConstant {
    #[serde(deserialize_with = "int_or_hex")]
    pub value: u64,
    #[serde(default)]
    pub operand_index: Option<u8>,
    #[serde(default)]
    pub procedure: Option<String>,
    #[serde(default, deserialize_with = "int_or_hex")]
    pub address: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInstruction {
    pub procedure: String,
    #[serde(deserialize_with = "int_or_hex")]
    pub address: u64,
    pub mnemonic: String,
    #[serde(default)]
    pub operands: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotXref {
    #[serde(default)]
    pub procedure: Option<String>,
    #[serde(default, deserialize_with = "int_or_hex")]
    pub address: u64,
    #[serde(default, deserialize_with = "int_or_hex")]
    pub target: u64,
    #[serde(default)]
    pub target_name: Option<String>,
    #[serde(default)]
    pub kind: XrefKind,
    #[serde(flatten)]
    pub context: FactContext,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IntOrHex {
    Int(u64),
    Text(String),
}

fn int_or_hex<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match IntOrHex::deserialize(deserializer)? {
        IntOrHex::Int(value) => Ok(value),
        IntOrHex::Text(text) => {
            let text = text.trim();
            let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => text.parse::<u64>(),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("invalid number '{text}': {e}")))
        }
    }
}

impl FactSnapshot {
    /// Parse a snapshot; `.yaml`/`.yml` as YAML, anything else as JSON.
    pub fn parse(path: &Path, bytes: &[u8]) -> Result<Self, FactAccessError> {
        let malformed = |message: String| FactAccessError::Malformed {
            path: path.to_path_buf(),
            message,
        };
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));
        let snapshot: Self = if is_yaml {
            serde_yaml::from_slice(bytes).map_err(|e| malformed(e.to_string()))?
        } else {
            serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?
        };
        // Instruction windows only exist inside a procedure.
        if let Some(insn) = snapshot.instructions.iter().find(|i| i.procedure.trim().is_empty()) {
            return Err(malformed(format!(
                "instruction '{}' at 0x{:x} has no procedure",
                insn.mnemonic, insn.address
            )));
        }
        Ok(snapshot)
    }

    pub fn into_model(self) -> FactModel {
        let mut facts = Vec::with_capacity(
            self.symbols.len()
                + self.strings.len()
                + self.constants.len()
                + self.instructions.len()
                + self.xrefs.len(),
        );

        let at = |procedure: Option<String>, address: u64| {
            Location::new(Scope::from(procedure), address)
        };

        for sym in self.symbols {
            facts.push(
                Fact::symbol(at(sym.procedure, sym.address), sym.name, sym.kind)
                    .with_context(sym.context),
            );
        }
        for s in self.strings {
            facts.push(Fact::string(at(s.procedure, s.address), s.value));
        }
        for c in self.constants {
            facts.push(Fact::new(
                at(c.procedure, c.address),
                FactKind::Number(NumericConstant { value: c.value, operand_index: c.operand_index }),
            ));
        }
        for insn in self.instructions {
            facts.push(Fact::instruction(
                Location::in_procedure(insn.procedure, insn.address),
                insn.mnemonic,
                insn.operands,
            ));
        }
        for x in self.xrefs {
            let location = at(x.procedure, x.address);
            let fact = Fact::new(
                location,
                FactKind::Xref(CrossReference {
                    target: x.target,
                    target_name: x.target_name,
                    kind: x.kind,
                }),
            );
            facts.push(fact.with_context(x.context));
        }

        FactModel::new(self.binary, facts)
    }
}

/// Reads a [`FactSnapshot`] file named by the request path.
pub struct SnapshotProvider;

impl FactProvider for SnapshotProvider {
    fn facts(&self, request: &FactRequest) -> Result<FactModel, FactAccessError> {
        let bytes = read_input(&request.path)?;
        let mut snapshot = FactSnapshot::parse(&request.path, &bytes)?;
        if snapshot.binary.trim().is_empty() {
            snapshot.binary = request
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("snapshot")
                .to_string();
        }
        Ok(snapshot.into_model())
    }

    fn name(&self) -> &'static str {
        "snapshot"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_snapshot_accepts_hex_and_defaults() {
        let body = r#"
binary: sample
symbols:
  - { name: ptrace }
constants:
  - { value: "0x1f", procedure: main, address: "0x1004" }
xrefs:
  - { procedure: main, address: 4104, target: "0x2000", target_name: ptrace, argument_count: 4 }
"#;
        let snapshot = FactSnapshot::parse(Path::new("s.yaml"), body.as_bytes()).unwrap();
        let model = snapshot.into_model();
        assert_eq!(model.binary_id(), "sample");
        let counts = model.counts();
        assert_eq!((counts.symbols, counts.constants, counts.xrefs), (1, 1, 1));

        let number = model
            .facts()
            .iter()
            .find(|f| matches!(f.kind, FactKind::Number(_)))
            .unwrap();
        assert_eq!(number.location, Location::in_procedure("main", 0x1004));
        let xref = model.facts().iter().find(|f| matches!(f.kind, FactKind::Xref(_))).unwrap();
        assert_eq!(xref.context.as_ref().and_then(|c| c.argument_count), Some(4));
    }

    #[test]
    fn instructions_without_a_procedure_are_rejected() {
        let body = r#"{ "instructions": [{ "procedure": " ", "address": 16, "mnemonic": "syscall" }] }"#;
        let err = FactSnapshot::parse(Path::new("s.json"), body.as_bytes()).unwrap_err();
        match err {
            FactAccessError::Malformed { message, .. } => {
                assert!(message.contains("syscall"));
                assert!(message.contains("no procedure"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_json_is_reported_with_path() {
        let err = FactSnapshot::parse(Path::new("bad.json"), b"{ not json").unwrap_err();
        assert!(matches!(err, FactAccessError::Malformed { .. }));
    }
}
