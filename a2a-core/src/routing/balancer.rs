//! Load balancing across equivalent routing paths

use super::path::RoutingPath;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Paths scoring within this margin of the best are interchangeable.
pub const SCORE_MARGIN: f64 = 1.0;

/// Load balancing strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    /// Round robin distribution
    RoundRobin,
    /// Least load (based on messages routed through the path)
    #[default]
    LeastLoad,
}

/// Load balancer for distributing messages over candidate paths
pub struct PathBalancer {
    strategy: BalanceStrategy,
    current_index: AtomicUsize,
    load: RwLock<HashMap<String, u64>>,
}

impl PathBalancer {
    pub fn new(strategy: BalanceStrategy) -> Self {
        Self {
            strategy,
            current_index: AtomicUsize::new(0),
            load: RwLock::new(HashMap::new()),
        }
    }

    /// Picks one of `candidates`, which must be sorted best first and non-empty.
    pub async fn choose(&self, candidates: &[RoutingPath]) -> Option<RoutingPath> {
        let chosen = match self.strategy {
            BalanceStrategy::RoundRobin => {
                let index = self.current_index.fetch_add(1, Ordering::Relaxed) % candidates.len().max(1);
                candidates.get(index)
            }
            BalanceStrategy::LeastLoad => {
                let load = self.load.read().await;
                // min_by_key keeps the first minimum, so ties go to the better score.
                candidates
                    .iter()
                    .min_by_key(|path| load.get(&path.signature()).copied().unwrap_or(0))
            }
        }?
        .clone();

        *self.load.write().await.entry(chosen.signature()).or_insert(0) += 1;
        Some(chosen)
    }

    pub async fn load_of(&self, path: &RoutingPath) -> u64 {
        self.load.read().await.get(&path.signature()).copied().unwrap_or(0)
    }
}

/// Candidates within [`SCORE_MARGIN`] of the best, best first.
pub(crate) fn near_best(mut candidates: Vec<RoutingPath>) -> Vec<RoutingPath> {
    candidates.sort_by(|a, b| super::path::by_score(b, a));
    let Some(best) = candidates.first().map(RoutingPath::score) else {
        return candidates;
    };
    candidates.retain(|p| best - p.score() <= SCORE_MARGIN);
    candidates
}
