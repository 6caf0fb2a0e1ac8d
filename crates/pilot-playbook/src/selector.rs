use crate::Strategy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionWeights {
    pub effectiveness: f64,
    pub recency: f64,
    pub semantic: f64,
    /// Per-day decay applied to the recency score.
    pub decay_rate: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            effectiveness: 0.5,
            recency: 0.3,
            semantic: 0.2,
            decay_rate: 0.1,
        }
    }
}

/// Ranks strategies for prompt inclusion by a weighted blend of
/// effectiveness, recency, and (eventually) semantic similarity.
pub struct StrategySelector {
    weights: SelectionWeights,
}

impl StrategySelector {
    pub fn new(weights: SelectionWeights) -> Self {
        Self { weights }
    }

    /// Strict top-K by final score, at most `max_count` entries. Ties break
    /// toward the most recently used strategy.
    pub fn select<'a>(
        &self,
        strategies: impl IntoIterator<Item = &'a Strategy>,
        max_count: usize,
        query: &str,
    ) -> Vec<&'a Strategy> {
        let now = Utc::now();
        let mut scored: Vec<(f64, &Strategy)> = strategies
            .into_iter()
            .map(|s| (self.score(s, query, now), s))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.1.last_used.cmp(&a.1.last_used))
        });
        scored.truncate(max_count);
        scored.into_iter().map(|(_, s)| s).collect()
    }

    pub fn score(&self, strategy: &Strategy, query: &str, now: DateTime<Utc>) -> f64 {
        // Unlike the playbook's 0.0 for untested strategies, the selector
        // treats "no data" as average relevance rather than proven-bad.
        let effectiveness = if strategy.sample_count() == 0 {
            0.5
        } else {
            strategy.effectiveness()
        };
        let recency = match strategy.last_used {
            Some(used) => {
                let days = (now - used).num_seconds().max(0) as f64 / 86_400.0;
                1.0 / (1.0 + days * self.weights.decay_rate)
            }
            None => 0.5,
        };
        let semantic = self.semantic_score(strategy, query);
        self.weights.effectiveness * effectiveness
            + self.weights.recency * recency
            + self.weights.semantic * semantic
    }

    // Placeholder until a similarity backend is wired in. The weight slot is
    // part of the public contract so upgrading this does not change callers.
    fn semantic_score(&self, _strategy: &Strategy, _query: &str) -> f64 {
        0.0
    }
}
