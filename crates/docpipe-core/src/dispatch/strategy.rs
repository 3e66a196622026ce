//! Selection strategies over fan-out results.
//!
//! Pure functions: the dispatcher gathers provider results and these
//! decide what wins. Weighted voting renormalizes over the providers
//! that actually answered, so a missing provider never silently
//! deflates the vote.

use crate::rules::{self, ValidationIssue};

/// One provider's validation verdict entering the vote.
#[derive(Debug, Clone)]
pub struct WeightedVote {
    pub provider: String,
    pub is_valid: bool,
    pub confidence: f64,
}

/// Outcome of weighted voting across providers.
#[derive(Debug, Clone)]
pub struct WeightedOutcome {
    /// Weighted validity ≥ 0.5 (ties count as valid).
    pub is_valid: bool,
    /// Σ wᵢ · confᵢ over the responders.
    pub confidence: f64,
    /// How much the providers agreed, in [0, 1].
    pub agreement: f64,
    /// The normalized weight each responder carried.
    pub weights: Vec<(String, f64)>,
}

/// Weighted voting over validation verdicts.
///
/// The provider named `primary` carries `primary_weight`; everyone
/// else carries `secondary_weight`. Weights renormalize over the
/// votes actually present.
pub fn weighted_voting(
    votes: &[WeightedVote],
    primary: &str,
    primary_weight: f64,
    secondary_weight: f64,
) -> Option<WeightedOutcome> {
    if votes.is_empty() {
        return None;
    }

    let raw: Vec<f64> = votes
        .iter()
        .map(|v| {
            if v.provider == primary {
                primary_weight
            } else {
                secondary_weight
            }
        })
        .collect();
    let total: f64 = raw.iter().sum();
    let normalized: Vec<f64> = raw.iter().map(|w| w / total).collect();

    let confidence: f64 = votes
        .iter()
        .zip(&normalized)
        .map(|(v, w)| v.confidence * w)
        .sum();
    let validity: f64 = votes
        .iter()
        .zip(&normalized)
        .map(|(v, w)| if v.is_valid { *w } else { 0.0 })
        .sum();

    Some(WeightedOutcome {
        is_valid: validity >= 0.5,
        confidence,
        agreement: agreement_level(&votes.iter().map(|v| v.confidence).collect::<Vec<_>>()),
        weights: votes
            .iter()
            .zip(&normalized)
            .map(|(v, w)| (v.provider.clone(), *w))
            .collect(),
    })
}

/// Unweighted consensus: mean confidence, majority validity (ties
/// count as valid). This is weighted voting with equal weights, which
/// is exactly how it is computed.
pub fn consensus(votes: &[WeightedVote]) -> Option<WeightedOutcome> {
    weighted_voting(votes, "", 1.0, 1.0)
}

/// Agreement level `1 − min(4·var(conf), 1)`: 1.0 when providers
/// report identical confidences, 0.0 when they diverge wildly.
pub fn agreement_level(confidences: &[f64]) -> f64 {
    if confidences.len() < 2 {
        return 1.0;
    }
    let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
    let variance = confidences
        .iter()
        .map(|c| (c - mean).powi(2))
        .sum::<f64>()
        / confidences.len() as f64;
    1.0 - (4.0 * variance).min(1.0)
}

/// Merge issue lists from several providers through the shared dedup key.
pub fn consensus_issues(lists: Vec<Vec<ValidationIssue>>) -> Vec<ValidationIssue> {
    rules::dedup_and_sort(lists.into_iter().flatten().collect())
}

/// Highest-confidence selection with faster wall time as the tiebreak.
///
/// `results` pairs each candidate with `(confidence, elapsed_ms)`.
pub fn pick_highest_confidence<T>(results: Vec<(T, f64, u64)>) -> Option<T> {
    results
        .into_iter()
        .max_by(|(_, conf_a, elapsed_a), (_, conf_b, elapsed_b)| {
            conf_a
                .partial_cmp(conf_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                // On equal confidence the faster provider wins.
                .then(elapsed_b.cmp(elapsed_a))
        })
        .map(|(value, _, _)| value)
}
