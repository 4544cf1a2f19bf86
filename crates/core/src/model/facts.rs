use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a fact inside one [`FactModel`]. Only meaningful for the model that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactId(pub u32);

const GLOBAL_SCOPE: &str = "<global>";

/// Where a fact was observed: inside a named procedure, or binary-wide (symbol tables,
/// unreferenced strings).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Scope {
    Global,
    Procedure(String),
}

impl Scope {
    pub fn procedure(name: impl Into<String>) -> Self {
        Scope::Procedure(name.into())
    }

    pub fn is_procedure(&self) -> bool {
        matches!(self, Scope::Procedure(_))
    }

    pub fn procedure_name(&self) -> Option<&str> {
        match self {
            Scope::Global => None,
            Scope::Procedure(name) => Some(name),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => f.write_str(GLOBAL_SCOPE),
            Scope::Procedure(name) => f.write_str(name),
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl From<String> for Scope {
    fn from(value: String) -> Self {
        if value.is_empty() || value == GLOBAL_SCOPE {
            Scope::Global
        } else {
            Scope::Procedure(value)
        }
    }
}

impl From<Option<String>> for Scope {
    fn from(value: Option<String>) -> Self {
        value.map(Scope::from).unwrap_or(Scope::Global)
    }
}

/// Source location of a fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub scope: Scope,
    pub address: u64,
}

impl Location {
    pub fn new(scope: Scope, address: u64) -> Self {
        Self { scope, address }
    }

    pub fn global(address: u64) -> Self {
        Self { scope: Scope::Global, address }
    }

    pub fn in_procedure(name: impl Into<String>, address: u64) -> Self {
        Self { scope: Scope::procedure(name), address }
    }
}

/// How a symbol is bound in the binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    #[default]
    Import,
    Export,
    Local,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::Import => "import",
            SymbolKind::Export => "export",
            SymbolKind::Local => "local",
        }
    }
}

/// Kind of a cross-reference edge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XrefKind {
    #[default]
    Call,
    Jump,
    Data,
}

impl XrefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            XrefKind::Call => "call",
            XrefKind::Jump => "jump",
            XrefKind::Data => "data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolRef {
    pub name: String,
    pub kind: SymbolKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringLiteral {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NumericConstant {
    pub value: u64,
    /// Operand position within the owning instruction, when known.
    pub operand_index: Option<u8>,
}

/// One disassembled instruction. Mnemonic and operand text are lower-cased on ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructionPattern {
    pub mnemonic: String,
    pub operands: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CrossReference {
    pub target: u64,
    pub target_name: Option<String>,
    pub kind: XrefKind,
}

/// Optional call-site metadata some providers can supply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactContext {
    pub calling_convention: Option<String>,
    pub argument_count: Option<u32>,
}

impl FactContext {
    pub fn is_empty(&self) -> bool {
        self.calling_convention.is_none() && self.argument_count.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Symbol(SymbolRef),
    String(StringLiteral),
    Number(NumericConstant),
    Instruction(InstructionPattern),
    Xref(CrossReference),
}

/// One atomic observation extracted from a binary. Immutable once placed in a [`FactModel`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fact {
    pub location: Location,
    pub kind: FactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<FactContext>,
}

impl Fact {
    pub fn new(location: Location, kind: FactKind) -> Self {
        Self { location, kind, context: None }
    }

    pub fn symbol(location: Location, name: impl Into<String>, kind: SymbolKind) -> Self {
        Self::new(location, FactKind::Symbol(SymbolRef { name: name.into(), kind }))
    }

    pub fn string(location: Location, value: impl Into<String>) -> Self {
        Self::new(location, FactKind::String(StringLiteral { value: value.into() }))
    }

    pub fn number(location: Location, value: u64) -> Self {
        Self::new(location, FactKind::Number(NumericConstant { value, operand_index: None }))
    }

    pub fn instruction(
        location: Location,
        mnemonic: impl Into<String>,
        operands: impl Into<String>,
    ) -> Self {
        Self::new(
            location,
            FactKind::Instruction(InstructionPattern {
                mnemonic: mnemonic.into(),
                operands: operands.into(),
            }),
        )
    }

    pub fn call(location: Location, target: u64, target_name: Option<String>) -> Self {
        Self::new(
            location,
            FactKind::Xref(CrossReference { target, target_name, kind: XrefKind::Call }),
        )
    }

    pub fn with_context(mut self, context: FactContext) -> Self {
        self.context = if context.is_empty() { None } else { Some(context) };
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.location.scope
    }

    /// Human-readable one-line description used as finding evidence.
    ///
    /// Never mentions the fact id, so evidence is independent of enumeration order.
    pub fn describe(&self) -> String {
        let body = match &self.kind {
            FactKind::Symbol(sym) => format!("{} symbol '{}'", sym.kind.as_str(), sym.name),
            FactKind::String(s) => format!("string \"{}\"", truncate_for_display(&s.value, 96)),
            FactKind::Number(n) => format!("constant 0x{:x} ({})", n.value, n.value),
            FactKind::Instruction(insn) => {
                if insn.operands.is_empty() {
                    format!("insn {}", insn.mnemonic)
                } else {
                    format!("insn {} {}", insn.mnemonic, insn.operands)
                }
            }
            FactKind::Xref(xref) => match &xref.target_name {
                Some(name) => format!("{} -> {}", xref.kind.as_str(), name),
                None => format!("{} -> 0x{:x}", xref.kind.as_str(), xref.target),
            },
        };
        let mut line = format!("0x{:08x} [{}] {}", self.location.address, self.location.scope, body);
        if let Some(ctx) = &self.context {
            if let Some(cc) = &ctx.calling_convention {
                line.push_str(&format!(" cc={cc}"));
            }
            if let Some(argc) = ctx.argument_count {
                line.push_str(&format!(" argc={argc}"));
            }
        }
        line
    }

    fn normalize(&mut self) {
        if let FactKind::Instruction(insn) = &mut self.kind {
            insn.mnemonic = insn.mnemonic.trim().to_lowercase();
            insn.operands = insn.operands.trim().to_lowercase();
        }
    }
}

fn truncate_for_display(value: &str, max_chars: usize) -> String {
    let escaped: String = value.escape_debug().collect();
    if escaped.chars().count() <= max_chars {
        escaped
    } else {
        let mut out: String = escaped.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

/// Per-variant fact counts, reported alongside a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactCounts {
    pub symbols: usize,
    pub strings: usize,
    pub constants: usize,
    pub instructions: usize,
    pub xrefs: usize,
}

impl FactCounts {
    pub fn total(&self) -> usize {
        self.symbols + self.strings + self.constants + self.instructions + self.xrefs
    }
}

/// Read-only snapshot of every fact extracted from one binary for one run.
///
/// Facts are stored in a canonical order (location, then kind) regardless of the order the
/// provider enumerated them in, so identical fact sets always yield identical ids and
/// identical downstream results.
#[derive(Debug, Clone, Default)]
pub struct FactModel {
    binary_id: String,
    facts: Vec<Fact>,
    /// Instruction fact ids per procedure, in address order.
    sequences: BTreeMap<String, Vec<FactId>>,
}

impl FactModel {
    pub fn new(binary_id: impl Into<String>, mut facts: Vec<Fact>) -> Self {
        for fact in &mut facts {
            fact.normalize();
        }
        facts.sort();
        facts.dedup();

        let mut sequences: BTreeMap<String, Vec<FactId>> = BTreeMap::new();
        for (idx, fact) in facts.iter().enumerate() {
            if let (FactKind::Instruction(_), Scope::Procedure(name)) = (&fact.kind, fact.scope()) {
                sequences.entry(name.clone()).or_default().push(FactId(idx as u32));
            }
        }

        Self { binary_id: binary_id.into(), facts, sequences }
    }

    pub fn empty(binary_id: impl Into<String>) -> Self {
        Self::new(binary_id, Vec::new())
    }

    pub fn binary_id(&self) -> &str {
        &self.binary_id
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn get(&self, id: FactId) -> Option<&Fact> {
        self.facts.get(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FactId, &Fact)> {
        self.facts.iter().enumerate().map(|(idx, fact)| (FactId(idx as u32), fact))
    }

    /// Ordered instruction sequences, one per procedure.
    pub fn instruction_sequences(&self) -> impl Iterator<Item = (&str, &[FactId])> {
        self.sequences.iter().map(|(name, ids)| (name.as_str(), ids.as_slice()))
    }

    /// Names of every procedure that owns at least one fact.
    pub fn procedures(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.facts.iter().filter_map(|f| f.scope().procedure_name()).collect();
        names.dedup();
        names
    }

    pub fn counts(&self) -> FactCounts {
        let mut counts = FactCounts::default();
        for fact in &self.facts {
            match fact.kind {
                FactKind::Symbol(_) => counts.symbols += 1,
                FactKind::String(_) => counts.strings += 1,
                FactKind::Number(_) => counts.constants += 1,
                FactKind::Instruction(_) => counts.instructions += 1,
                FactKind::Xref(_) => counts.xrefs += 1,
            }
        }
        counts
    }
}
