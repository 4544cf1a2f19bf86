//! Composite Correlator: fuses co-present signatures into findings per (procedure, category).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::finding::Finding;
use super::matcher::RawMatch;
use super::scoring::confidence_for;
use crate::model::{Category, FactModel, Scope};
use crate::registry::{CompositeRule, Registry};

/// Two rules wanted the same raw match; the earlier-ranked rule kept it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationRuleConflict {
    pub category: Category,
    pub scope: Scope,
    pub signature_id: String,
    pub kept_rule: String,
    pub dropped_rule: String,
}

impl fmt::Display for CorrelationRuleConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule '{}' dropped in {} [{}]: signature '{}' already claimed by '{}'",
            self.dropped_rule, self.category, self.scope, self.signature_id, self.kept_rule
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct Correlation {
    pub findings: Vec<Finding>,
    pub conflicts: Vec<CorrelationRuleConflict>,
}

/// Group raw matches by (scope, category), apply that category's composite rules, and turn
/// everything left over into single-contributor findings.
///
/// Rule precedence: more signatures first, then registry declaration order. A rule that
/// overlaps an already-applied rule is skipped and reported as a conflict.
pub fn correlate(raw: &[RawMatch], registry: &Registry, facts: &FactModel) -> Correlation {
    let mut groups: BTreeMap<(Scope, Category), Vec<&RawMatch>> = BTreeMap::new();
    for m in raw {
        groups.entry((m.location.scope.clone(), m.category)).or_default().push(m);
    }

    let mut out = Correlation::default();
    for ((scope, category), matches) in groups {
        let present: BTreeSet<&str> = matches.iter().map(|m| m.signature_id.as_str()).collect();

        // Binary-wide facts only ever produce solo findings.
        let rules = if scope.is_procedure() { registry.rules_for(category) } else { Vec::new() };
        let mut candidates: Vec<&CompositeRule> = rules
            .into_iter()
            .filter(|rule| rule.signatures.iter().all(|s| present.contains(s.as_str())))
            .collect();
        candidates.sort_by(|a, b| {
            b.signatures.len().cmp(&a.signatures.len()).then(a.order.cmp(&b.order))
        });

        let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();
        for rule in candidates {
            let overlap: Vec<&str> = rule
                .signatures
                .iter()
                .map(String::as_str)
                .filter(|s| claimed.contains_key(s))
                .collect();
            if !overlap.is_empty() {
                for sig in overlap {
                    let conflict = CorrelationRuleConflict {
                        category,
                        scope: scope.clone(),
                        signature_id: sig.to_string(),
                        kept_rule: claimed[sig].to_string(),
                        dropped_rule: rule.id.clone(),
                    };
                    warn!(%conflict, "correlation rule conflict");
                    out.conflicts.push(conflict);
                }
                continue;
            }

            for sig in &rule.signatures {
                claimed.insert(sig.as_str(), rule.id.as_str());
            }
            let members: Vec<&RawMatch> = matches
                .iter()
                .copied()
                .filter(|m| rule.signatures.contains(&m.signature_id))
                .collect();
            out.findings.push(build_finding(
                category,
                &scope,
                &members,
                Some(rule),
                registry,
                facts,
            ));
        }

        for m in matches.iter().copied().filter(|m| !claimed.contains_key(m.signature_id.as_str())) {
            out.findings.push(build_finding(category, &scope, &[m], None, registry, facts));
        }
    }
    out
}

fn build_finding(
    category: Category,
    scope: &Scope,
    members: &[&RawMatch],
    rule: Option<&CompositeRule>,
    registry: &Registry,
    facts: &FactModel,
) -> Finding {
    let mut signatures: Vec<(usize, &str, f64)> = members
        .iter()
        .map(|m| match registry.signature(&m.signature_id) {
            Some(sig) => (sig.order, sig.id.as_str(), sig.weight),
            // Matches always come from the registry they are correlated against.
            None => (usize::MAX, m.signature_id.as_str(), 0.0),
        })
        .collect();
    signatures.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(b.1)));
    signatures.dedup_by(|a, b| a.1 == b.1);

    let weights: Vec<f64> = signatures.iter().map(|s| s.2).collect();
    let boost = rule.map(|r| r.boost).unwrap_or(0.0);
    let confidence = confidence_for(&weights, boost);

    let evidence: BTreeSet<String> = members
        .iter()
        .flat_map(|m| m.matched_facts.iter())
        .filter_map(|id| facts.get(*id))
        .map(|fact| fact.describe())
        .collect();

    let address = members.iter().map(|m| m.location.address).min().unwrap_or_default();

    let title = match rule {
        Some(rule) => rule.description.clone(),
        None => signatures
            .first()
            .and_then(|s| registry.signature(s.1))
            .map(|sig| sig.description.clone())
            .unwrap_or_default(),
    };

    Finding {
        category,
        location: scope.clone(),
        address,
        rule: rule.map(|r| r.id.clone()),
        title,
        contributing_signatures: signatures.iter().map(|s| s.1.to_string()).collect(),
        confidence,
        evidence: evidence.into_iter().collect(),
    }
}
