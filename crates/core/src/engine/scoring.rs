//! Confidence math, deduplication, and ranking.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use super::finding::Finding;
use crate::model::{Category, Scope};

/// `min(1, 1 - Π(1 - w_i))`, rounded to four decimals.
pub fn combine_weights(weights: &[f64]) -> f64 {
    let residual: f64 = weights.iter().map(|w| 1.0 - w.clamp(0.0, 1.0)).product();
    round_confidence(1.0 - residual)
}

/// Confidence of a finding: its contributing weights plus an optional rule boost, folded in
/// as one more independent piece of evidence.
pub fn confidence_for(weights: &[f64], boost: f64) -> f64 {
    if boost > 0.0 {
        let mut all = weights.to_vec();
        all.push(boost);
        combine_weights(&all)
    } else {
        combine_weights(weights)
    }
}

pub fn round_confidence(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    (value.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

type DedupKey = (Category, Scope, Vec<String>);

/// Collapse findings with the same category, procedure, and contributing-signature set.
/// The survivor keeps the higher confidence (and that finding's title and rule), the
/// union of the evidence, and the lowest address. Output order follows first appearance.
pub fn deduplicate(findings: Vec<Finding>) -> Vec<Finding> {
    let mut slots: BTreeMap<DedupKey, usize> = BTreeMap::new();
    let mut out: Vec<Finding> = Vec::with_capacity(findings.len());

    for finding in findings {
        let mut sigs = finding.contributing_signatures.clone();
        sigs.sort();
        let key = (finding.category, finding.location.clone(), sigs);
        match slots.get(&key) {
            Some(&idx) => merge_into(&mut out[idx], finding),
            None => {
                slots.insert(key, out.len());
                out.push(finding);
            }
        }
    }
    out
}

fn merge_into(kept: &mut Finding, other: Finding) {
    let evidence: BTreeSet<String> = kept.evidence.drain(..).chain(other.evidence).collect();
    let address = kept.address.min(other.address);
    if other.confidence > kept.confidence {
        kept.confidence = other.confidence;
        kept.title = other.title;
        kept.rule = other.rule;
        kept.contributing_signatures = other.contributing_signatures;
    }
    kept.evidence = evidence.into_iter().collect();
    kept.address = address;
}

/// Descending confidence, then ascending location (scope, address), then signature ids.
pub fn rank(findings: &mut [Finding]) {
    findings.sort_by(compare);
}

fn compare(a: &Finding, b: &Finding) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| a.location.cmp(&b.location))
        .then_with(|| a.address.cmp(&b.address))
        .then_with(|| a.contributing_signatures.cmp(&b.contributing_signatures))
        .then_with(|| a.title.cmp(&b.title))
}

/// Deduplicate, filter, and rank each category independently (in parallel when asked).
pub fn score_all(
    findings: Vec<Finding>,
    min_confidence: f64,
    parallel: bool,
) -> BTreeMap<Category, Vec<Finding>> {
    let mut grouped: BTreeMap<Category, Vec<Finding>> = BTreeMap::new();
    for finding in findings {
        grouped.entry(finding.category).or_default().push(finding);
    }

    let finish = |(category, group): (Category, Vec<Finding>)| {
        let mut kept: Vec<Finding> = deduplicate(group)
            .into_iter()
            .filter(|f| f.confidence >= min_confidence)
            .collect();
        rank(&mut kept);
        (category, kept)
    };

    if parallel {
        grouped.into_par_iter().map(finish).collect()
    } else {
        grouped.into_iter().map(finish).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(sigs: &[&str], scope: &str, address: u64, confidence: f64, evidence: &[&str]) -> Finding {
        Finding {
            category: Category::Keychain,
            location: Scope::procedure(scope),
            address,
            rule: None,
            title: sigs.join("+"),
            contributing_signatures: sigs.iter().map(|s| s.to_string()).collect(),
            confidence,
            evidence: evidence.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn combination_is_independent_evidence() {
        assert_eq!(combine_weights(&[0.8, 0.5]), 0.9);
        assert_eq!(combine_weights(&[]), 0.0);
        assert_eq!(combine_weights(&[1.0, 0.3]), 1.0);
        assert_eq!(confidence_for(&[0.5], 0.0), 0.5);
    }

    #[test]
    fn adding_contributors_never_lowers_confidence() {
        let weights = [0.05, 0.3, 0.7, 0.01, 0.99];
        for n in 1..weights.len() {
            let before = combine_weights(&weights[..n]);
            let after = combine_weights(&weights[..=n]);
            assert!(after >= before);
            assert!(after >= weights[n].min(1.0) - 1e-4);
        }
    }

    #[test]
    fn dedup_keeps_best_confidence_and_unions_evidence() {
        let merged = deduplicate(vec![
            finding(&["a"], "f", 0x20, 0.3, &["e2"]),
            finding(&["a"], "f", 0x10, 0.6, &["e1"]),
            finding(&["a"], "g", 0x10, 0.6, &["e3"]),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].confidence, 0.6);
        assert_eq!(merged[0].address, 0x10);
        assert_eq!(merged[0].evidence, vec!["e1", "e2"]);
    }

    #[test]
    fn dedup_is_idempotent() {
        let once = deduplicate(vec![
            finding(&["a", "b"], "f", 0x20, 0.3, &["x"]),
            finding(&["b", "a"], "f", 0x10, 0.4, &["y"]),
            finding(&["a"], "f", 0x10, 0.4, &["z"]),
        ]);
        let twice = deduplicate(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn rank_orders_by_confidence_then_location() {
        let mut list = vec![
            finding(&["a"], "zeta", 0x10, 0.5, &[]),
            finding(&["b"], "alpha", 0x90, 0.5, &[]),
            finding(&["c"], "mid", 0x00, 0.9, &[]),
        ];
        rank(&mut list);
        let order: Vec<&str> = list.iter().map(|f| f.title.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn score_all_applies_min_confidence() {
        let scored = score_all(
            vec![finding(&["a"], "f", 0, 0.1, &[]), finding(&["b"], "f", 0, 0.7, &[])],
            0.5,
            true,
        );
        let keychain = &scored[&Category::Keychain];
        assert_eq!(keychain.len(), 1);
        assert_eq!(keychain[0].title, "b");
    }
}
