// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! C4: Router. Given an incoming request, returns a `RoutingDecision` per
//! one of the four policies in §4.4. Policy is chosen once at startup from
//! `RouterConfig`; hot-reconfig is not required.

mod cache_tree;

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use dispatch_runtime::Clock;

use crate::metrics::MetricsAggregator;
use crate::WorkerId;
use cache_tree::CacheTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Policy {
    Random,
    RoundRobin,
    CacheAware,
    KvLoadAware,
}

/// The router's terminal decision (§4.4.6: `Selected(worker_id) |
/// SelectedAny`). `RoundRobin` is distinguished from `Any` so the Dispatcher
/// knows to call the Worker Directory's `round_robin` handle rather than
/// `any` — the cursor itself lives in the directory (§9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    Any,
    RoundRobin,
    Worker(WorkerId),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no metrics available for kv-load-aware routing")]
    NoMetrics,
    #[error("no reachable workers")]
    NoReachableWorkers,
}

/// A pre-computed worker hint the Dispatcher may attach before calling the
/// Router (§4.4.5 optional extension). Honored verbatim by
/// `Policy::KvLoadAware` when `worker_id` is present; not wired to any
/// upstream protocol in this core, since the translation layer that would
/// produce it is out of scope.
#[derive(Debug, Clone, Default)]
pub struct RoutingHint {
    pub worker_id: Option<WorkerId>,
    pub prefix_hit_rate: Option<f64>,
}

pub struct RoutingRequest<'a> {
    pub prompt_token_ids: &'a [u32],
    pub hint: Option<RoutingHint>,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, validator::Validate)]
pub struct RouterConfig {
    pub policy: Policy,
    #[validate(range(min = 0.0, max = 1.0))]
    pub cache_threshold: f64,
    pub balance_abs_threshold: u64,
    #[validate(range(min = 1.0))]
    pub balance_rel_threshold: f64,
    pub eviction_interval_secs: u64,
    pub max_tree_size: usize,
    /// Token-id chunk size the cache-awareness tree hashes per node. Not
    /// named in spec.md's config table (that table is explicitly
    /// non-exhaustive); the original SGLang/Dynamo radix-cache
    /// approximation hardcodes this, this implementation exposes it.
    pub block_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            policy: Policy::CacheAware,
            cache_threshold: 0.5,
            balance_abs_threshold: 32,
            balance_rel_threshold: 1.0001,
            eviction_interval_secs: 60,
            max_tree_size: 1 << 24,
            block_size: 16,
        }
    }
}

pub struct Router {
    config: RouterConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsAggregator>,
    cache_tree: RwLock<CacheTree>,
}

impl Router {
    pub fn new(config: RouterConfig, clock: Arc<dyn Clock>, metrics: Arc<MetricsAggregator>) -> Self {
        let cache_tree = RwLock::new(CacheTree::new(config.max_tree_size, config.block_size));
        Self {
            config,
            clock,
            metrics,
            cache_tree,
        }
    }

    pub fn policy(&self) -> Policy {
        self.config.policy
    }

    /// §4.4.6's state machine, collapsed into one synchronous call:
    /// `AwaitingPolicy -> Selecting -> Selected | SelectedAny | Failed`.
    /// Side-effect-free except for the cache-tree update in
    /// `Policy::CacheAware`'s step 5.
    pub fn select(
        &self,
        request: &RoutingRequest<'_>,
        reachable: &[WorkerId],
    ) -> Result<RoutingDecision, RouterError> {
        if reachable.is_empty() {
            return Err(RouterError::NoReachableWorkers);
        }
        match self.config.policy {
            Policy::Random => Ok(RoutingDecision::Any),
            Policy::RoundRobin => Ok(RoutingDecision::RoundRobin),
            Policy::CacheAware => Ok(self.select_cache_aware(request, reachable)),
            Policy::KvLoadAware => self.select_kv_load_aware(request, reachable),
        }
    }

    fn select_kv_load_aware(
        &self,
        request: &RoutingRequest<'_>,
        reachable: &[WorkerId],
    ) -> Result<RoutingDecision, RouterError> {
        if let Some(hint) = &request.hint {
            if let Some(worker_id) = hint.worker_id {
                tracing::debug!(worker_id, "honoring upstream routing hint");
                return Ok(RoutingDecision::Worker(worker_id));
            }
        }

        let snapshot = self.metrics.get_snapshot();
        let mut best: Option<(WorkerId, f64)> = None;
        for &worker_id in reachable {
            let Some(record) = snapshot.get(&worker_id) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((best_id, best_usage)) => {
                    record.kv_cache_usage < best_usage
                        || (record.kv_cache_usage == best_usage && worker_id < best_id)
                }
            };
            if better {
                best = Some((worker_id, record.kv_cache_usage));
            }
        }

        // Per §7: an empty snapshot downgrades this request to Random, not a
        // hard failure. The Dispatcher is the one that interprets
        // `NoMetrics` as an any-worker fallback.
        best.map(|(worker_id, _)| RoutingDecision::Worker(worker_id))
            .ok_or(RouterError::NoMetrics)
    }

    fn select_cache_aware(&self, request: &RoutingRequest<'_>, reachable: &[WorkerId]) -> RoutingDecision {
        let prompt_len = request.prompt_token_ids.len();
        let (matched_blocks, candidates) = {
            let tree = self.cache_tree.read();
            let result = tree.descend(request.prompt_token_ids);
            (result.matched_blocks, result.candidate_workers)
        };
        let matched_len = (matched_blocks * self.config.block_size).min(prompt_len);
        let hit_fraction = if prompt_len == 0 {
            0.0
        } else {
            matched_len as f64 / prompt_len as f64
        };

        let reachable_candidates: Vec<WorkerId> = candidates
            .into_iter()
            .filter(|w| reachable.contains(w))
            .collect();

        let snapshot = self.metrics.get_snapshot();
        let pending_of = |worker_id: WorkerId| {
            snapshot
                .get(&worker_id)
                .map(|record| record.pending_requests)
                .unwrap_or(0)
        };

        let chosen = if hit_fraction < self.config.cache_threshold || reachable_candidates.is_empty() {
            min_pending(reachable, &pending_of)
        } else {
            // §4.4.3 step 4 / §8 scenario 6: the gap compares the busiest
            // cache-candidate worker against the least-loaded worker overall
            // (not just within `C`) — otherwise a singleton `C` always has
            // gap zero and the override could never fire.
            let min_load = reachable.iter().map(|&w| pending_of(w)).min().unwrap();
            let max_load = reachable_candidates.iter().map(|&w| pending_of(w)).max().unwrap();
            let gap = max_load.saturating_sub(min_load);
            let override_triggered = gap > self.config.balance_abs_threshold
                && max_load as f64 > min_load as f64 * self.config.balance_rel_threshold;
            if override_triggered {
                min_pending(reachable, &pending_of)
            } else {
                min_pending(&reachable_candidates, &pending_of)
            }
        };

        self.cache_tree
            .write()
            .insert(request.prompt_token_ids, chosen, self.clock.now_ms());

        RoutingDecision::Worker(chosen)
    }

    /// §4.4.3 step 6: evicts subtrees whose last-touch timestamp predates
    /// `eviction_interval_secs`. Intended to be called from a periodic
    /// ticker in the service layer.
    pub fn run_eviction_tick(&self) {
        let cutoff = self.clock.now_ms() - (self.config.eviction_interval_secs as i64 * 1000);
        self.cache_tree.write().evict_older_than(cutoff);
    }

    pub fn tree_node_count(&self) -> usize {
        self.cache_tree.read().node_count()
    }
}

fn min_pending(workers: &[WorkerId], pending_of: &impl Fn(WorkerId) -> u64) -> WorkerId {
    let mut best: Option<(WorkerId, u64)> = None;
    for &worker_id in workers {
        let pending = pending_of(worker_id);
        let better = match best {
            None => true,
            Some((best_id, best_pending)) => {
                pending < best_pending || (pending == best_pending && worker_id < best_id)
            }
        };
        if better {
            best = Some((worker_id, pending));
        }
    }
    best.expect("caller guarantees a non-empty worker list").0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricRecord, MetricsAggregatorConfig};
    use dispatch_runtime::ManualClock;

    fn router_with(policy: Policy, clock: Arc<ManualClock>, metrics: Arc<MetricsAggregator>) -> Router {
        let config = RouterConfig {
            policy,
            ..RouterConfig::default()
        };
        Router::new(config, clock, metrics)
    }

    fn push_metric(agg: &MetricsAggregator, worker_id: WorkerId, kv: f64, pending: u64, at: i64) {
        agg.on_update(
            worker_id,
            MetricRecord {
                kv_cache_usage: kv,
                pending_requests: pending,
                last_updated_ms: at,
            },
        );
    }

    #[test]
    fn random_policy_returns_any() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        let router = router_with(Policy::Random, clock, metrics);
        let req = RoutingRequest {
            prompt_token_ids: &[1, 2, 3],
            hint: None,
        };
        assert_eq!(router.select(&req, &[1, 2]).unwrap(), RoutingDecision::Any);
    }

    #[test]
    fn round_robin_policy_defers_cursor_to_directory() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        let router = router_with(Policy::RoundRobin, clock, metrics);
        let req = RoutingRequest {
            prompt_token_ids: &[1, 2, 3],
            hint: None,
        };
        assert_eq!(
            router.select(&req, &[1, 2]).unwrap(),
            RoutingDecision::RoundRobin
        );
    }

    #[test]
    fn no_reachable_workers_is_rejected_up_front() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        let router = router_with(Policy::Random, clock, metrics);
        let req = RoutingRequest {
            prompt_token_ids: &[1],
            hint: None,
        };
        assert!(matches!(
            router.select(&req, &[]),
            Err(RouterError::NoReachableWorkers)
        ));
    }

    #[test]
    fn kv_load_aware_picks_minimum_usage_with_worker_id_tiebreak() {
        let clock = Arc::new(ManualClock::new(10_000));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        push_metric(&metrics, 2, 0.3, 1, 9_900);
        push_metric(&metrics, 1, 0.3, 1, 9_900);
        push_metric(&metrics, 3, 0.9, 1, 9_900);

        let router = router_with(Policy::KvLoadAware, clock, metrics);
        let req = RoutingRequest {
            prompt_token_ids: &[1],
            hint: None,
        };
        assert_eq!(
            router.select(&req, &[1, 2, 3]).unwrap(),
            RoutingDecision::Worker(1)
        );
    }

    #[test]
    fn kv_load_aware_honors_explicit_hint() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        let router = router_with(Policy::KvLoadAware, clock, metrics);
        let req = RoutingRequest {
            prompt_token_ids: &[1],
            hint: Some(RoutingHint {
                worker_id: Some(42),
                prefix_hit_rate: Some(0.9),
            }),
        };
        assert_eq!(
            router.select(&req, &[42, 1, 2]).unwrap(),
            RoutingDecision::Worker(42)
        );
    }

    #[test]
    fn kv_load_aware_fails_with_no_metrics() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        let router = router_with(Policy::KvLoadAware, clock, metrics);
        let req = RoutingRequest {
            prompt_token_ids: &[1],
            hint: None,
        };
        assert!(matches!(
            router.select(&req, &[1, 2]),
            Err(RouterError::NoMetrics)
        ));
    }

    #[test]
    fn cache_aware_override_fires_on_large_load_gap() {
        // §8 scenario 6: worker 1 has an 80% prefix hit but is badly
        // overloaded relative to worker 2; the override should pick worker 2.
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        push_metric(&metrics, 1, 0.5, 40, 0);
        push_metric(&metrics, 2, 0.1, 2, 0);

        let router = router_with(Policy::CacheAware, clock.clone(), metrics);
        let tokens: Vec<u32> = (0..100).collect();
        // Prime the tree so worker 1 is cached for an 80-token prefix.
        {
            let req = RoutingRequest {
                prompt_token_ids: &tokens[..80],
                hint: None,
            };
            // force worker 1 into the tree directly via a controlled selection:
            // route once with only worker 1 reachable so it gets cached.
            assert_eq!(
                router.select(&req, &[1]).unwrap(),
                RoutingDecision::Worker(1)
            );
        }

        let req = RoutingRequest {
            prompt_token_ids: &tokens,
            hint: None,
        };
        assert_eq!(
            router.select(&req, &[1, 2]).unwrap(),
            RoutingDecision::Worker(2)
        );
    }

    #[test]
    fn cache_aware_preserves_cache_hit_when_gap_is_small() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        push_metric(&metrics, 1, 0.5, 10, 0);
        push_metric(&metrics, 2, 0.1, 2, 0);

        let router = router_with(Policy::CacheAware, clock.clone(), metrics);
        let tokens: Vec<u32> = (0..100).collect();
        {
            let req = RoutingRequest {
                prompt_token_ids: &tokens[..80],
                hint: None,
            };
            assert_eq!(
                router.select(&req, &[1]).unwrap(),
                RoutingDecision::Worker(1)
            );
        }

        let req = RoutingRequest {
            prompt_token_ids: &tokens,
            hint: None,
        };
        assert_eq!(
            router.select(&req, &[1, 2]).unwrap(),
            RoutingDecision::Worker(1)
        );
    }

    #[test]
    fn cache_aware_falls_back_to_load_balance_below_threshold() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        push_metric(&metrics, 1, 0.1, 5, 0);
        push_metric(&metrics, 2, 0.1, 1, 0);

        let router = router_with(Policy::CacheAware, clock, metrics);
        // Nothing cached yet: hit_fraction is 0, below threshold, so this
        // falls straight to minimum-pending load balancing.
        let tokens: Vec<u32> = (0..64).collect();
        let req = RoutingRequest {
            prompt_token_ids: &tokens,
            hint: None,
        };
        assert_eq!(
            router.select(&req, &[1, 2]).unwrap(),
            RoutingDecision::Worker(2)
        );
    }

    #[test]
    fn tree_node_count_stays_within_budget() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = Arc::new(MetricsAggregator::new(clock.clone(), MetricsAggregatorConfig::default()));
        let config = RouterConfig {
            policy: Policy::CacheAware,
            max_tree_size: 5,
            ..RouterConfig::default()
        };
        let router = Router::new(config, clock, metrics);
        for i in 0..50u32 {
            let tokens: Vec<u32> = (i * 100..i * 100 + 32).collect();
            let req = RoutingRequest {
                prompt_token_ids: &tokens,
                hint: None,
            };
            router.select(&req, &[1]).unwrap();
            assert!(router.tree_node_count() <= 5);
        }
    }
}
