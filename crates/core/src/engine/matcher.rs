//! Matching Engine: scans a [`FactModel`] against precomputed signature indexes.
//!
//! Every pattern kind is folded into a per-category [`SignatureIndex`] once, at registry load:
//! exact names go into a hash map, string needles into one Aho-Corasick automaton, regexes
//! into one `RegexSet` per target, and opcode windows are keyed by their first mnemonic. A
//! scan is then a single pass over the facts plus one pass over each procedure's
//! instruction sequence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::RangeInclusive;

use aho_corasick::AhoCorasick;
use regex::RegexSet;
use serde::Serialize;
use tracing::debug;

use crate::model::{Category, FactId, FactKind, FactModel, Location, Scope};
use crate::registry::{OpcodeStep, Pattern, RegexTarget, RegistryLoadError, Signature};

/// An unscored hit of one signature against one or more facts at one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawMatch {
    pub signature_id: String,
    pub category: Category,
    pub location: Location,
    pub matched_facts: Vec<FactId>,
}

/// (signature slot within the index, clause slot within the signature)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct ClauseRef {
    sig: usize,
    clause: usize,
}

#[derive(Debug)]
struct IndexedSignature {
    id: String,
    clause_count: usize,
}

#[derive(Debug)]
struct OpcodeWindow {
    at: ClauseRef,
    steps: Vec<OpcodeStep>,
}

/// Numeric range clauses flattened into disjoint segments, so a lookup is one binary search.
///
/// Segment `i` covers `[starts[i], starts[i + 1])` and lists every clause whose range
/// contains it.
#[derive(Debug, Default)]
struct RangeTable {
    starts: Vec<u64>,
    active: Vec<Vec<ClauseRef>>,
}

impl RangeTable {
    fn build(ranges: &[(RangeInclusive<u64>, ClauseRef)]) -> Self {
        let mut starts: Vec<u64> = ranges
            .iter()
            .flat_map(|(r, _)| [Some(*r.start()), r.end().checked_add(1)])
            .flatten()
            .collect();
        starts.sort_unstable();
        starts.dedup();

        let active = starts
            .iter()
            .map(|start| {
                let mut hits: Vec<ClauseRef> =
                    ranges.iter().filter(|(r, _)| r.contains(start)).map(|(_, at)| *at).collect();
                hits.sort_unstable();
                hits
            })
            .collect();
        Self { starts, active }
    }

    fn lookup(&self, value: u64) -> &[ClauseRef] {
        match self.starts.partition_point(|start| *start <= value) {
            0 => &[],
            n => &self.active[n - 1],
        }
    }
}

/// Precomputed lookup structures for one category's signatures.
#[derive(Debug)]
pub struct SignatureIndex {
    category: Category,
    signatures: Vec<IndexedSignature>,
    names: HashMap<String, Vec<ClauseRef>>,
    needles: Option<AhoCorasick>,
    needle_clauses: Vec<Vec<ClauseRef>>,
    symbol_regexes: Option<RegexSet>,
    symbol_regex_clauses: Vec<ClauseRef>,
    string_regexes: Option<RegexSet>,
    string_regex_clauses: Vec<ClauseRef>,
    numbers: HashMap<u64, Vec<ClauseRef>>,
    ranges: RangeTable,
    windows: HashMap<String, Vec<OpcodeWindow>>,
}

impl SignatureIndex {
    /// Build an index over `signatures`, which are expected to share `category`.
    pub fn build(category: Category, signatures: &[&Signature]) -> Result<Self, RegistryLoadError> {
        let index_err = |message: String| RegistryLoadError::Index { category, message };

        let mut indexed = Vec::with_capacity(signatures.len());
        let mut names: HashMap<String, Vec<ClauseRef>> = HashMap::new();
        let mut needle_slots: BTreeMap<String, Vec<ClauseRef>> = BTreeMap::new();
        let mut symbol_regex_src = Vec::new();
        let mut symbol_regex_clauses = Vec::new();
        let mut string_regex_src = Vec::new();
        let mut string_regex_clauses = Vec::new();
        let mut numbers: HashMap<u64, Vec<ClauseRef>> = HashMap::new();
        let mut ranges = Vec::new();
        let mut windows: HashMap<String, Vec<OpcodeWindow>> = HashMap::new();

        for (sig_slot, sig) in signatures.iter().enumerate() {
            indexed.push(IndexedSignature { id: sig.id.clone(), clause_count: sig.clauses.len() });
            for (clause_slot, clause) in sig.clauses.iter().enumerate() {
                let at = ClauseRef { sig: sig_slot, clause: clause_slot };
                match clause {
                    Pattern::ExactName(set) => {
                        for name in set {
                            names.entry(name.clone()).or_default().push(at);
                        }
                    }
                    Pattern::StringContains(list) => {
                        for needle in list {
                            needle_slots.entry(needle.clone()).or_default().push(at);
                        }
                    }
                    Pattern::Regex { target: RegexTarget::Symbol, regex } => {
                        symbol_regex_src.push(regex.as_str().to_string());
                        symbol_regex_clauses.push(at);
                    }
                    Pattern::Regex { target: RegexTarget::String, regex } => {
                        string_regex_src.push(regex.as_str().to_string());
                        string_regex_clauses.push(at);
                    }
                    Pattern::Numeric(num) => {
                        for value in &num.values {
                            numbers.entry(*value).or_default().push(at);
                        }
                        if let Some(range) = &num.range {
                            ranges.push((range.clone(), at));
                        }
                    }
                    Pattern::OpcodeSequence(steps) => {
                        if let Some(first) = steps.first() {
                            windows
                                .entry(first.mnemonic.clone())
                                .or_default()
                                .push(OpcodeWindow { at, steps: steps.clone() });
                        }
                    }
                }
            }
        }

        let (needles, needle_clauses) = if needle_slots.is_empty() {
            (None, Vec::new())
        } else {
            let patterns: Vec<&String> = needle_slots.keys().collect();
            let automaton = AhoCorasick::new(patterns).map_err(|e| index_err(e.to_string()))?;
            (Some(automaton), needle_slots.into_values().collect())
        };

        let compile_set = |sources: Vec<String>| -> Result<Option<RegexSet>, RegistryLoadError> {
            if sources.is_empty() {
                return Ok(None);
            }
            RegexSet::new(sources).map(Some).map_err(|e| index_err(e.to_string()))
        };

        Ok(Self {
            category,
            signatures: indexed,
            names,
            needles,
            needle_clauses,
            symbol_regexes: compile_set(symbol_regex_src)?,
            symbol_regex_clauses,
            string_regexes: compile_set(string_regex_src)?,
            string_regex_clauses,
            numbers,
            ranges: RangeTable::build(&ranges),
            windows,
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Scan every fact once and return raw matches in deterministic order
    /// (location, then registry order, then matched facts).
    pub fn scan(&self, facts: &FactModel) -> Vec<RawMatch> {
        if self.signatures.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<ClauseHit> = Vec::new();
        let mut scratch: Vec<ClauseRef> = Vec::new();

        for (id, fact) in facts.iter() {
            scratch.clear();
            match &fact.kind {
                FactKind::Symbol(sym) => self.symbol_hits(&sym.name, &mut scratch),
                FactKind::Xref(xref) => {
                    if let Some(name) = &xref.target_name {
                        self.symbol_hits(name, &mut scratch);
                    }
                }
                FactKind::String(lit) => self.string_hits(&lit.value, &mut scratch),
                FactKind::Number(num) => self.number_hits(num.value, &mut scratch),
                // Instructions are matched as windows below.
                FactKind::Instruction(_) => {}
            }
            scratch.sort_unstable();
            scratch.dedup();
            for at in &scratch {
                hits.push(ClauseHit { at: *at, location: fact.location.clone(), facts: vec![id] });
            }
        }

        if !self.windows.is_empty() {
            for (procedure, sequence) in facts.instruction_sequences() {
                self.window_hits(facts, procedure, sequence, &mut hits);
            }
        }

        let matches = self.assemble(facts, hits);
        debug!(category = %self.category, matches = matches.len(), "category scan complete");
        matches
    }

    fn symbol_hits(&self, name: &str, out: &mut Vec<ClauseRef>) {
        let bare = name.strip_prefix('_').filter(|rest| !rest.is_empty());
        if let Some(found) = self.names.get(name) {
            out.extend_from_slice(found);
        }
        if let Some(found) = bare.and_then(|b| self.names.get(b)) {
            out.extend_from_slice(found);
        }
        if let Some(set) = &self.symbol_regexes {
            let subject = bare.unwrap_or(name);
            out.extend(set.matches(subject).into_iter().map(|i| self.symbol_regex_clauses[i]));
        }
    }

    fn string_hits(&self, value: &str, out: &mut Vec<ClauseRef>) {
        if let Some(automaton) = &self.needles {
            for found in automaton.find_overlapping_iter(value) {
                out.extend_from_slice(&self.needle_clauses[found.pattern().as_usize()]);
            }
        }
        if let Some(set) = &self.string_regexes {
            out.extend(set.matches(value).into_iter().map(|i| self.string_regex_clauses[i]));
        }
    }

    fn number_hits(&self, value: u64, out: &mut Vec<ClauseRef>) {
        if let Some(found) = self.numbers.get(&value) {
            out.extend_from_slice(found);
        }
        out.extend_from_slice(self.ranges.lookup(value));
    }

    /// Contiguous windows within one procedure; cost is bounded by
    /// instructions x candidate windows x window length.
    fn window_hits(
        &self,
        facts: &FactModel,
        procedure: &str,
        sequence: &[FactId],
        hits: &mut Vec<ClauseHit>,
    ) {
        let insn = |id: FactId| match facts.get(id).map(|f| &f.kind) {
            Some(FactKind::Instruction(insn)) => Some(insn),
            _ => None,
        };

        for start in 0..sequence.len() {
            let Some(first) = insn(sequence[start]) else { continue };
            let Some(candidates) = self.windows.get(&first.mnemonic) else { continue };
            for window in candidates {
                let end = start + window.steps.len();
                if end > sequence.len() {
                    continue;
                }
                let ids = &sequence[start..end];
                let all = window
                    .steps
                    .iter()
                    .zip(ids)
                    .all(|(step, id)| insn(*id).is_some_and(|i| step.matches(i)));
                if !all {
                    continue;
                }
                let address = facts.get(ids[0]).map(|f| f.location.address).unwrap_or_default();
                hits.push(ClauseHit {
                    at: window.at,
                    location: Location::in_procedure(procedure, address),
                    facts: ids.to_vec(),
                });
            }
        }
    }

    /// Turn clause hits into raw matches. Single-clause signatures emit one match per hit;
    /// multi-clause signatures emit one match per procedure in which every clause hit.
    fn assemble(&self, facts: &FactModel, hits: Vec<ClauseHit>) -> Vec<RawMatch> {
        let mut keyed: Vec<(Location, usize, Vec<FactId>)> = Vec::new();
        let mut partial: BTreeMap<(usize, String), Vec<BTreeSet<FactId>>> = BTreeMap::new();

        for hit in hits {
            let sig = &self.signatures[hit.at.sig];
            if sig.clause_count == 1 {
                keyed.push((hit.location, hit.at.sig, hit.facts));
                continue;
            }
            // Global facts belong to no procedure and can never satisfy a conjunction.
            let Scope::Procedure(name) = hit.location.scope else { continue };
            let slots = partial
                .entry((hit.at.sig, name))
                .or_insert_with(|| vec![BTreeSet::new(); sig.clause_count]);
            slots[hit.at.clause].extend(hit.facts);
        }

        for ((sig, procedure), slots) in partial {
            if slots.iter().any(|s| s.is_empty()) {
                continue;
            }
            let union: BTreeSet<FactId> = slots.into_iter().flatten().collect();
            let address = union
                .iter()
                .filter_map(|id| facts.get(*id))
                .map(|f| f.location.address)
                .min()
                .unwrap_or_default();
            keyed.push((Location::in_procedure(procedure, address), sig, union.into_iter().collect()));
        }

        keyed.sort();
        keyed.dedup();
        keyed
            .into_iter()
            .map(|(location, sig, matched_facts)| RawMatch {
                signature_id: self.signatures[sig].id.clone(),
                category: self.category,
                location,
                matched_facts,
            })
            .collect()
    }
}

struct ClauseHit {
    at: ClauseRef,
    location: Location,
    facts: Vec<FactId>,
}

/// Match `signatures` (of any categories) against `facts` without a prebuilt registry index.
///
/// Indexes are built on the fly, one per category; matches come back grouped in category
/// order. Errors only when an index cannot be built.
pub fn match_signatures(
    facts: &FactModel,
    signatures: &[&Signature],
) -> Result<Vec<RawMatch>, RegistryLoadError> {
    let mut grouped: BTreeMap<Category, Vec<&Signature>> = BTreeMap::new();
    for sig in signatures {
        grouped.entry(sig.category).or_default().push(sig);
    }
    let mut out = Vec::new();
    for (category, subset) in grouped {
        out.extend(SignatureIndex::build(category, &subset)?.scan(facts));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Fact, SymbolKind};
    use crate::registry::Registry;

    const CATALOGUE: &str = r#"
version: 1
category: anti-debug
signatures:
  - id: ptrace_deny
    weight: 0.8
    match:
      - symbols: [ptrace]
      - numbers: { values: [31] }
  - id: debugger_strings
    weight: 0.5
    match:
      - strings: [LLDB, gdb]
  - id: sysctl_probe
    weight: 0.4
    match:
      - regex: "^sysctl(byname)?$"
        on: symbol
  - id: timing_loop
    weight: 0.3
    match:
      - opcodes: [rdtsc, { mnemonic: sub, operands: rax }, rdtsc]
"#;

    fn registry() -> Registry {
        Registry::from_yaml("t.yaml", CATALOGUE).unwrap()
    }

    fn scan(facts: Vec<Fact>) -> Vec<RawMatch> {
        let registry = registry();
        let model = FactModel::new("bin", facts);
        registry.index_for(Category::AntiDebug).unwrap().scan(&model)
    }

    fn ids(matches: &[RawMatch]) -> Vec<&str> {
        matches.iter().map(|m| m.signature_id.as_str()).collect()
    }

    #[test]
    fn multi_clause_signature_requires_every_clause_in_one_procedure() {
        let together = scan(vec![
            Fact::call(Location::in_procedure("main", 0x10), 0x9000, Some("_ptrace".into())),
            Fact::number(Location::in_procedure("main", 0x0c), 31),
        ]);
        assert_eq!(ids(&together), vec!["ptrace_deny"]);
        assert_eq!(together[0].location, Location::in_procedure("main", 0x0c));
        assert_eq!(together[0].matched_facts.len(), 2);

        let split = scan(vec![
            Fact::call(Location::in_procedure("main", 0x10), 0x9000, Some("ptrace".into())),
            Fact::number(Location::in_procedure("helper", 0x40), 31),
        ]);
        assert!(split.is_empty());
    }

    #[test]
    fn global_facts_never_complete_a_multi_clause_signature() {
        let matches = scan(vec![
            Fact::symbol(Location::global(0), "ptrace", SymbolKind::Import),
            Fact::number(Location::in_procedure("main", 0x0c), 31),
        ]);
        assert!(matches.is_empty());
    }

    #[test]
    fn string_needles_are_case_sensitive_substrings() {
        let matches = scan(vec![
            Fact::string(Location::in_procedure("main", 0x20), "attached: LLDB-1500"),
            Fact::string(Location::in_procedure("main", 0x28), "lldb"),
        ]);
        assert_eq!(ids(&matches), vec!["debugger_strings"]);
        assert_eq!(matches[0].location.address, 0x20);
    }

    #[test]
    fn one_string_with_two_needles_of_one_signature_yields_one_match() {
        let matches = scan(vec![Fact::string(Location::global(0x30), "LLDB or gdb")]);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn symbol_regex_sees_underscore_stripped_names() {
        let matches = scan(vec![
            Fact::symbol(Location::global(0), "_sysctlbyname", SymbolKind::Import),
            Fact::symbol(Location::global(8), "sysctl_other", SymbolKind::Import),
        ]);
        assert_eq!(ids(&matches), vec!["sysctl_probe"]);
    }

    #[test]
    fn opcode_window_must_be_contiguous() {
        let p = |addr| Location::in_procedure("timing", addr);
        let contiguous = scan(vec![
            Fact::instruction(p(0), "rdtsc", ""),
            Fact::instruction(p(2), "sub", "rax, rbx"),
            Fact::instruction(p(5), "rdtsc", ""),
        ]);
        assert_eq!(ids(&contiguous), vec!["timing_loop"]);
        assert_eq!(contiguous[0].matched_facts.len(), 3);

        let broken = scan(vec![
            Fact::instruction(p(0), "rdtsc", ""),
            Fact::instruction(p(2), "nop", ""),
            Fact::instruction(p(3), "sub", "rax, rbx"),
            Fact::instruction(p(5), "rdtsc", ""),
        ]);
        assert!(broken.is_empty());
    }

    #[test]
    fn range_table_resolves_overlapping_ranges() {
        let a = ClauseRef { sig: 0, clause: 0 };
        let b = ClauseRef { sig: 1, clause: 0 };
        let c = ClauseRef { sig: 2, clause: 1 };
        let table = RangeTable::build(&[(10..=20, a), (15..=30, b), (u64::MAX - 1..=u64::MAX, c)]);

        assert!(table.lookup(0).is_empty());
        assert!(table.lookup(9).is_empty());
        assert_eq!(table.lookup(10), &[a]);
        assert_eq!(table.lookup(15), &[a, b]);
        assert_eq!(table.lookup(20), &[a, b]);
        assert_eq!(table.lookup(21), &[b]);
        assert_eq!(table.lookup(30), &[b]);
        assert!(table.lookup(31).is_empty());
        assert_eq!(table.lookup(u64::MAX), &[c]);
        assert!(RangeTable::default().lookup(42).is_empty());
    }

    #[test]
    fn match_signatures_builds_indexes_on_the_fly() {
        let registry = registry();
        let sigs = registry.signatures_for(Category::AntiDebug);
        let model = FactModel::new(
            "bin",
            vec![Fact::string(Location::in_procedure("main", 0x20), "gdb")],
        );
        let matches = match_signatures(&model, &sigs).unwrap();
        assert_eq!(ids(&matches), vec!["debugger_strings"]);
    }
}
