/// Record lifecycle scoring.
///
/// Two weighted scores drive every tier and stage movement:
///
/// - the **eviction score** decides which hot records leave for warm first
///   (lowest score goes first), on a seconds timescale;
/// - the **retention score** decides whether the garbage collector steps a
///   record down one compression stage, on a days timescale.
///
/// ## Lifecycle Flow
///
/// ```text
/// append → Hot (active use)
///     │
///     ├── hot pressure, low eviction score → Warm (ghost stays in hot)
///     │
///     ├── warm pressure or idle → Cold (Compressed, maybe distilled)
///     │
///     └── low retention score → Gist → Tombstone
/// ```
use serde::{Deserialize, Serialize};

use crate::types::NANOS_PER_SEC;

const SECS_PER_DAY: f64 = 86_400.0;

/// Weights of the hot-tier eviction score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionWeights {
    pub recency: f32,
    /// Decay constant of the recency term
    pub recency_tau_secs: f64,
    pub confidence: f32,
    pub refs: f32,
    pub importance: f32,
    /// Subtracted when the record lost a contradiction
    pub superseded_penalty: f32,
}

impl Default for EvictionWeights {
    fn default() -> Self {
        Self {
            recency: 0.35,
            recency_tau_secs: 300.0, // 5 minutes
            confidence: 0.25,
            refs: 0.15,
            importance: 0.25,
            superseded_penalty: 0.5,
        }
    }
}

/// Weights of the garbage-collection retention score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionWeights {
    pub recency: f32,
    /// Decay constant of the recency term
    pub recency_tau_days: f64,
    pub confidence: f32,
    pub refs: f32,
    pub importance: f32,
    /// Bonus for distilled summaries
    pub summary: f32,
    /// Penalty for superseded records
    pub contradiction: f32,
    /// Penalty for records already represented by a summary
    pub redundancy: f32,
}

impl Default for RetentionWeights {
    fn default() -> Self {
        Self {
            recency: 0.30,
            recency_tau_days: 30.0,
            confidence: 0.30,
            refs: 0.15,
            importance: 0.15,
            summary: 0.10,
            contradiction: 0.30,
            redundancy: 0.20,
        }
    }
}

/// Everything the scores look at for one record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreInputs {
    /// Nanoseconds since the relevant reference point (last access for
    /// eviction, creation for retention)
    pub age_nanos: u64,
    pub confidence: f32,
    pub refs: u32,
    /// Importance of the owning partition
    pub importance: f32,
    pub superseded: bool,
    pub summary: bool,
    pub distilled: bool,
}

impl ScoreInputs {
    fn age_secs(&self) -> f64 {
        self.age_nanos as f64 / NANOS_PER_SEC as f64
    }

    fn refs_term(&self) -> f32 {
        (1.0 + self.refs as f32).ln()
    }
}

/// Hot-tier eviction score. Lower scores are evicted first.
pub fn eviction_score(w: &EvictionWeights, input: &ScoreInputs) -> f32 {
    let recency = (-input.age_secs() / w.recency_tau_secs.max(f64::EPSILON)).exp() as f32;
    let mut score = w.recency * recency
        + w.confidence * input.confidence
        + w.refs * input.refs_term()
        + w.importance * input.importance;
    if input.superseded {
        score -= w.superseded_penalty;
    }
    score
}

/// Retention score in `[0, 1]`. A record scoring under its stage's floor
/// is compressed one stage further.
pub fn retention_score(w: &RetentionWeights, input: &ScoreInputs) -> f32 {
    let age_days = input.age_secs() / SECS_PER_DAY;
    let recency = (-age_days / w.recency_tau_days.max(f64::EPSILON)).exp() as f32;
    let mut score = w.recency * recency
        + w.confidence * input.confidence
        + w.refs * input.refs_term()
        + w.importance * input.importance;
    if input.summary {
        score += w.summary;
    }
    if input.superseded {
        score -= w.contradiction;
    }
    if input.distilled {
        score -= w.redundancy;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(confidence: f32) -> ScoreInputs {
        ScoreInputs {
            age_nanos: 0,
            confidence,
            refs: 0,
            importance: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn test_eviction_prefers_old_low_confidence() {
        let w = EvictionWeights::default();
        let old = ScoreInputs {
            age_nanos: 3600 * NANOS_PER_SEC,
            ..fresh(0.2)
        };
        assert!(eviction_score(&w, &old) < eviction_score(&w, &fresh(0.2)));
        assert!(eviction_score(&w, &fresh(0.2)) < eviction_score(&w, &fresh(0.9)));
    }

    #[test]
    fn test_eviction_superseded_penalty() {
        let w = EvictionWeights::default();
        let lost = ScoreInputs {
            superseded: true,
            ..fresh(0.9)
        };
        let diff = eviction_score(&w, &fresh(0.9)) - eviction_score(&w, &lost);
        assert!((diff - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_retention_is_clamped() {
        let w = RetentionWeights::default();
        let strong = ScoreInputs {
            refs: 1000,
            importance: 1.0,
            summary: true,
            ..fresh(1.0)
        };
        assert_eq!(retention_score(&w, &strong), 1.0);

        let weak = ScoreInputs {
            age_nanos: 3650 * 86_400 * NANOS_PER_SEC,
            importance: 0.0,
            superseded: true,
            distilled: true,
            ..fresh(0.0)
        };
        assert_eq!(retention_score(&w, &weak), 0.0);
    }

    #[test]
    fn test_retention_decays_with_age() {
        let w = RetentionWeights::default();
        let young = fresh(0.5);
        let month = ScoreInputs {
            age_nanos: 30 * 86_400 * NANOS_PER_SEC,
            ..young
        };
        let young_score = retention_score(&w, &young);
        let month_score = retention_score(&w, &month);
        // One decay constant in, the recency term is down to 1/e.
        let expected = 0.30 * (1.0 - (-1.0f32).exp());
        assert!((young_score - month_score - expected).abs() < 1e-4);
    }

    #[test]
    fn test_weights_deserialize_partially() {
        let w: RetentionWeights = serde_json::from_str(r#"{ "recency_tau_days": 7.0 }"#).unwrap();
        assert_eq!(w.recency_tau_days, 7.0);
        assert_eq!(w.confidence, 0.30);
    }
}
