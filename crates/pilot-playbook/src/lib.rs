use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub mod reflector;
pub mod selector;

pub use reflector::{ObservedCall, ReflectionResult, Reflector};
pub use selector::{SelectionWeights, StrategySelector};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyCategory {
    FileOperations,
    CodeNavigation,
    Testing,
    ShellCommands,
    ErrorHandling,
    General,
}

impl StrategyCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyCategory::FileOperations => "file_operations",
            StrategyCategory::CodeNavigation => "code_navigation",
            StrategyCategory::Testing => "testing",
            StrategyCategory::ShellCommands => "shell_commands",
            StrategyCategory::ErrorHandling => "error_handling",
            StrategyCategory::General => "general",
        }
    }

    /// Short prefix used when allocating strategy ids, e.g. `fil-00042`.
    pub fn prefix(&self) -> &'static str {
        match self {
            StrategyCategory::FileOperations => "fil",
            StrategyCategory::CodeNavigation => "nav",
            StrategyCategory::Testing => "tst",
            StrategyCategory::ShellCommands => "shl",
            StrategyCategory::ErrorHandling => "err",
            StrategyCategory::General => "gen",
        }
    }
}

impl fmt::Display for StrategyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyOutcome {
    Helpful,
    Harmful,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub category: StrategyCategory,
    pub content: String,
    #[serde(default)]
    pub helpful_count: u64,
    #[serde(default)]
    pub harmful_count: u64,
    #[serde(default)]
    pub neutral_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl Strategy {
    pub fn sample_count(&self) -> u64 {
        self.helpful_count + self.harmful_count + self.neutral_count
    }

    /// `(helpful - harmful) / max(1, samples)`. An untested strategy scores
    /// 0.0 here; the selector applies its own neutral prior instead.
    pub fn effectiveness(&self) -> f64 {
        let total = self.sample_count().max(1) as f64;
        (self.helpful_count as f64 - self.harmful_count as f64) / total
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybookError {
    #[error("unknown strategy id: {0}")]
    UnknownStrategy(String),
}

/// Per-session store of learned strategies with effectiveness tracking.
/// Pure data; persistence and prompt injection happen in the calling layers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Playbook {
    #[serde(default)]
    pub strategies: BTreeMap<String, Strategy>,
    #[serde(default)]
    pub next_id: BTreeMap<StrategyCategory, u64>,
}

impl Playbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Strategy> {
        self.strategies.get(id)
    }

    /// Allocates a fresh category-scoped id and stores the strategy with all
    /// counters at zero.
    pub fn add_strategy(
        &mut self,
        category: StrategyCategory,
        content: impl Into<String>,
    ) -> &Strategy {
        let counter = self.next_id.entry(category).or_insert(0);
        *counter += 1;
        let id = format!("{}-{:05}", category.prefix(), counter);
        let strategy = Strategy {
            id: id.clone(),
            category,
            content: content.into(),
            helpful_count: 0,
            harmful_count: 0,
            neutral_count: 0,
            created_at: Utc::now(),
            last_used: None,
        };
        self.strategies.entry(id).or_insert(strategy)
    }

    /// True when a strategy with identical content already exists in the
    /// category; callers use this to avoid re-learning the same rule.
    pub fn has_content(&self, category: StrategyCategory, content: &str) -> bool {
        self.strategies
            .values()
            .any(|s| s.category == category && s.content == content)
    }

    pub fn tag_strategy(
        &mut self,
        id: &str,
        outcome: StrategyOutcome,
    ) -> Result<(), PlaybookError> {
        let strategy = self
            .strategies
            .get_mut(id)
            .ok_or_else(|| PlaybookError::UnknownStrategy(id.to_string()))?;
        match outcome {
            StrategyOutcome::Helpful => strategy.helpful_count += 1,
            StrategyOutcome::Harmful => strategy.harmful_count += 1,
            StrategyOutcome::Neutral => strategy.neutral_count += 1,
        }
        strategy.last_used = Some(Utc::now());
        Ok(())
    }

    /// Removes strategies scoring below `threshold` once they have at least
    /// `min_samples` tags. Untested strategies are never pruned.
    pub fn prune(&mut self, threshold: f64, min_samples: u64) -> Vec<String> {
        let removed: Vec<String> = self
            .strategies
            .values()
            .filter(|s| s.sample_count() >= min_samples && s.effectiveness() < threshold)
            .map(|s| s.id.clone())
            .collect();
        for id in &removed {
            self.strategies.remove(id);
        }
        removed
    }

    /// Renders the playbook for prompt injection, grouped by category. When
    /// everything fits in `max_strategies` (or selection is disabled) every
    /// strategy is rendered; otherwise the selector picks a top-K for the
    /// query.
    pub fn as_context(
        &self,
        query: &str,
        max_strategies: usize,
        use_selection: bool,
        weights: &SelectionWeights,
    ) -> String {
        if self.strategies.is_empty() {
            return String::new();
        }
        let selected: Vec<&Strategy> =
            if !use_selection || self.strategies.len() <= max_strategies {
                self.strategies.values().collect()
            } else {
                StrategySelector::new(weights.clone()).select(
                    self.strategies.values(),
                    max_strategies,
                    query,
                )
            };

        let mut by_category: BTreeMap<StrategyCategory, Vec<&Strategy>> = BTreeMap::new();
        for strategy in selected {
            by_category.entry(strategy.category).or_default().push(strategy);
        }

        let mut out = String::new();
        for (category, strategies) in by_category {
            out.push_str(&format!("## {category}\n"));
            for s in strategies {
                out.push_str(&format!(
                    "- [{}] {} (helpful={}, harmful={})\n",
                    s.id, s.content, s.helpful_count, s.harmful_count
                ));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}
