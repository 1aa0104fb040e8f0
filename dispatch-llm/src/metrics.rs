// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! C1: Metrics Aggregator. Subscribes to a worker-metrics feed (the actual
//! pub/sub transport is out of scope; callers push records via `on_update`)
//! and exposes a consistent per-worker snapshot to the Router.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use dispatch_runtime::Clock;

use crate::WorkerId;

/// Per-worker telemetry, mirroring the wire shape of the metrics-ingest feed
/// (`gpu_cache_usage_perc`, `num_requests_waiting`) so the ingest path needs
/// no field renaming.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricRecord {
    pub kv_cache_usage: f64,
    pub pending_requests: u64,
    pub last_updated_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricsAggregatorConfig {
    /// Records older than this are treated as "unknown": still considered
    /// reachable for `any`/round-robin dispatch, but skipped by KV-load-aware
    /// routing.
    pub stale_after_ms: i64,
}

impl Default for MetricsAggregatorConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: 5_000,
        }
    }
}

/// Value-typed, copy-on-write snapshot of worker telemetry. Reads never
/// block writers and vice versa (§5's "swappable snapshot pointer" policy).
pub struct MetricsAggregator {
    clock: Arc<dyn Clock>,
    config: MetricsAggregatorConfig,
    snapshot: ArcSwap<HashMap<WorkerId, MetricRecord>>,
}

impl MetricsAggregator {
    pub fn new(clock: Arc<dyn Clock>, config: MetricsAggregatorConfig) -> Self {
        Self {
            clock,
            config,
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Idempotent; last-writer-wins by `record.last_updated_ms` rather than
    /// call order, so out-of-order delivery from the upstream feed can't
    /// regress a worker's state.
    pub fn on_update(&self, worker_id: WorkerId, record: MetricRecord) {
        let current = self.snapshot.load();
        if let Some(existing) = current.get(&worker_id) {
            if existing.last_updated_ms > record.last_updated_ms {
                return;
            }
        }
        let mut next = (**current).clone();
        next.insert(worker_id, record);
        self.snapshot.store(Arc::new(next));
    }

    /// Returns a value-typed copy with stale records dropped. Never fails,
    /// never blocks.
    pub fn get_snapshot(&self) -> HashMap<WorkerId, MetricRecord> {
        let now = self.clock.now_ms();
        let stale_after = self.config.stale_after_ms;
        self.snapshot
            .load()
            .iter()
            .filter(|(_, record)| now.saturating_sub(record.last_updated_ms) <= stale_after)
            .map(|(worker_id, record)| (*worker_id, *record))
            .collect()
    }
}
