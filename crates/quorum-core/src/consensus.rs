//! Finding deduplication and consensus scoring.
//!
//! Reviewers report positions that drift by a line or two, so findings are
//! bucketed by `floor(line / 3) * 3` before fingerprinting. Everything here is
//! pure: the same findings in any order produce the same findings and score.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::types::{ConsensusResult, DeduplicatedFinding, RawFinding, Tier};

/// Reviewer categories whose severe findings cannot be outvoted.
pub const PROTECTED_CATEGORIES: &[&str] = &["security", "reliability"];
pub const MPR_THRESHOLD: f64 = 8.5;

const EPS: f64 = 1e-9;

pub fn normalize_line(line: u32) -> u32 {
    (line / 3) * 3
}

pub fn normalize_category(category: &str) -> String {
    category.trim().to_lowercase()
}

pub fn fingerprint(file: &str, normalized_line: u32, category: &str) -> String {
    let mut h = Sha256::new();
    h.update(file.as_bytes());
    h.update([0u8]);
    h.update(normalized_line.to_string().as_bytes());
    h.update([0u8]);
    h.update(normalize_category(category).as_bytes());
    hex::encode(h.finalize())
}

/// Severity-weighted confidence on a 0–10 scale.
pub fn risk(severity: u8, confidence: u8) -> f64 {
    f64::from(severity) * f64::from(confidence) / 100.0
}

impl DeduplicatedFinding {
    pub fn risk(&self) -> f64 {
        risk(self.severity, self.confidence)
    }

    fn is_protected(&self) -> bool {
        PROTECTED_CATEGORIES.contains(&self.category.as_str())
            || self
                .reviewer_categories
                .iter()
                .any(|c| PROTECTED_CATEGORIES.contains(&c.as_str()))
    }

    /// Re-express a merged finding as a single reviewer's report, anchored at
    /// its bucket line so it fingerprints identically.
    pub fn to_raw(&self, reviewer_id: &str) -> RawFinding {
        RawFinding {
            reviewer_id: reviewer_id.to_string(),
            reviewer_category: self
                .reviewer_categories
                .first()
                .cloned()
                .unwrap_or_default(),
            severity: self.severity,
            confidence: self.confidence,
            category: self.category.clone(),
            file: self.file.clone(),
            line: self.normalized_line,
            description: self.descriptions.join("\n"),
            remediation: self.remediations.join("\n"),
        }
    }
}

#[derive(Default)]
struct Bucket {
    file: String,
    normalized_line: u32,
    category: String,
    severity: u8,
    confidence: u8,
    descriptions: BTreeSet<String>,
    remediations: BTreeSet<String>,
    reviewers: BTreeSet<String>,
    reviewer_categories: BTreeSet<String>,
}

/// Merge raw findings that share a fingerprint. Output is sorted by fingerprint.
pub fn deduplicate(raw: &[RawFinding]) -> Vec<DeduplicatedFinding> {
    let mut buckets: BTreeMap<String, Bucket> = BTreeMap::new();

    for f in raw {
        let line = normalize_line(f.line);
        let category = normalize_category(&f.category);
        let fp = fingerprint(&f.file, line, &category);
        let b = buckets.entry(fp).or_insert_with(|| Bucket {
            file: f.file.clone(),
            normalized_line: line,
            category: category.clone(),
            ..Default::default()
        });
        b.severity = b.severity.max(f.severity);
        b.confidence = b.confidence.max(f.confidence);
        if !f.description.trim().is_empty() {
            b.descriptions.insert(f.description.trim().to_string());
        }
        if !f.remediation.trim().is_empty() {
            b.remediations.insert(f.remediation.trim().to_string());
        }
        b.reviewers.insert(f.reviewer_id.clone());
        let rc = normalize_category(&f.reviewer_category);
        if !rc.is_empty() {
            b.reviewer_categories.insert(rc);
        }
    }

    buckets
        .into_iter()
        .map(|(fp, b)| DeduplicatedFinding {
            fingerprint: fp,
            file: b.file,
            normalized_line: b.normalized_line,
            category: b.category,
            severity: b.severity,
            confidence: b.confidence,
            descriptions: b.descriptions.into_iter().collect(),
            remediations: b.remediations.into_iter().collect(),
            k: b.reviewers.len() as u32,
            reviewers: b.reviewers.into_iter().collect(),
            reviewer_categories: b.reviewer_categories.into_iter().collect(),
        })
        .collect()
}

/// Score deduplicated findings from `n` dispatched reviewers.
///
/// `CS = 0.5·R̄ + 0.3·R̄·(k_total/n) + 0.2·R_max`, then the minority
/// protection rule lifts `CS` to at least `0.7·R_max + 2.0` when a top-risk
/// finding with `R ≥ 8.5` comes from a security or reliability reviewer.
pub fn score(deduped: &[DeduplicatedFinding], n: u32) -> ConsensusResult {
    if deduped.is_empty() {
        return ConsensusResult {
            cs: 0.0,
            tier: Tier::Informational,
            mpr_applied: false,
            passed: true,
        };
    }

    // Summation order is fixed so the mean does not depend on input order.
    let mut risks: Vec<f64> = deduped.iter().map(DeduplicatedFinding::risk).collect();
    risks.sort_by(f64::total_cmp);
    let r_bar = risks.iter().sum::<f64>() / risks.len() as f64;
    let r_max = risks.last().copied().unwrap_or(0.0);

    let raw_k_total: u64 = deduped.iter().map(|f| u64::from(f.k)).sum();
    let k_total = if raw_k_total > u64::from(n) {
        warn!(
            k_total = raw_k_total,
            n, "k_total exceeds dispatched reviewer count; clamping to n"
        );
        u64::from(n)
    } else {
        raw_k_total
    };
    let agreement = if n == 0 {
        0.0
    } else {
        k_total as f64 / f64::from(n)
    };

    let mut cs = 0.5 * r_bar + 0.3 * r_bar * agreement + 0.2 * r_max;

    let mpr_applied = r_max >= MPR_THRESHOLD
        && deduped
            .iter()
            .filter(|f| (f.risk() - r_max).abs() < EPS)
            .any(DeduplicatedFinding::is_protected);
    if mpr_applied {
        cs = cs.max(0.7 * r_max + 2.0);
    }

    let tier = Tier::from_score(cs);
    ConsensusResult {
        cs,
        tier,
        mpr_applied,
        passed: tier.passes(),
    }
}

/// Deduplicate then score.
pub fn evaluate(raw: &[RawFinding], n: u32) -> (Vec<DeduplicatedFinding>, ConsensusResult) {
    let deduped = deduplicate(raw);
    let result = score(&deduped, n);
    (deduped, result)
}
