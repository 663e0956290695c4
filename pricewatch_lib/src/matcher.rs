//! Fuzzy name matching between search candidates and known product names.

use std::fmt;

use serde::Serialize;

use crate::extract::Candidate;
use crate::model::{HintOrigin, ProductHint};

/// A candidate scoring at least this is treated as an exact match and ends
/// the scan.
pub const NEAR_PERFECT_SCORE: f64 = 98.0;

/// Lowercases and collapses whitespace.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Similarity in `[0, 100]` (normalized Levenshtein on normalized names).
/// Empty names score 0.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    (strsim::normalized_levenshtein(&a, &b) * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    pub name: String,
    pub price: f64,
    pub score: f64,
    pub origin: HintOrigin,
    pub candidate_index: usize,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchOutcome {
    pub best: Option<BestMatch>,
    /// Candidates looked at before the scan ended.
    pub scanned: usize,
}

impl MatchOutcome {
    pub fn score(&self) -> f64 {
        self.best.as_ref().map(|b| b.score).unwrap_or(0.0)
    }

    pub fn is_near_perfect(&self) -> bool {
        self.score() >= NEAR_PERFECT_SCORE
    }
}

/// Picks the best (candidate, hint) pair.
///
/// Only candidates with both a name and a price compete. Each is scored
/// against every usable hint; ties keep the first pair encountered, so
/// hint order matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchResolver;

impl MatchResolver {
    pub fn resolve(&self, hints: &[ProductHint], candidates: &[Candidate]) -> MatchOutcome {
        let hints: Vec<&ProductHint> = hints.iter().filter(|h| h.is_usable()).collect();
        let mut outcome = MatchOutcome::default();
        if hints.is_empty() {
            return outcome;
        }

        for (index, candidate) in candidates.iter().enumerate() {
            outcome.scanned += 1;
            let (Some(name), Some(price)) = (candidate.name.as_deref(), candidate.price) else {
                continue;
            };

            let mut local: Option<(f64, &ProductHint)> = None;
            for hint in &hints {
                let score = similarity(&hint.name, name);
                if local.map_or(true, |(best, _)| score > best) {
                    local = Some((score, hint));
                }
            }
            let Some((score, hint)) = local else { continue };

            if outcome.best.as_ref().map_or(true, |b| score > b.score) {
                outcome.best = Some(BestMatch {
                    name: name.to_string(),
                    price,
                    score,
                    origin: hint.origin.clone(),
                    candidate_index: index,
                });
            }
            if score >= NEAR_PERFECT_SCORE {
                break;
            }
        }
        outcome
    }
}

/// Confidence band for a match score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MatchQuality {
    High,
    Medium,
    Low,
}

impl MatchQuality {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::High
        } else if score >= 70.0 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl fmt::Display for MatchQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}
