// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus wiring for dispatch outcomes and queue depth. `dispatch-llm`
//! only knows about the `DispatchObserver` trait; this is the one place that
//! ties it to a concrete metrics backend.

use dispatch_llm::{DispatchObserver, DispatchOutcome};
use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct PrometheusObserver {
    outcomes: IntCounterVec,
}

impl PrometheusObserver {
    pub fn new(registry: &Registry) -> anyhow::Result<Self> {
        let outcomes = IntCounterVec::new(
            Opts::new("dispatch_outcomes_total", "Dispatch attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(outcomes.clone()))?;
        Ok(Self { outcomes })
    }
}

impl DispatchObserver for PrometheusObserver {
    fn on_outcome(&self, outcome: DispatchOutcome) {
        let label = match outcome {
            DispatchOutcome::Ok => "ok",
            DispatchOutcome::Retried => "retried",
            DispatchOutcome::Failed => "failed",
        };
        self.outcomes.with_label_values(&[label]).inc();
    }
}

pub struct ServiceMetrics {
    pub registry: Registry,
    pub queue_depth: IntGauge,
}

impl ServiceMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let queue_depth = IntGauge::new("dispatch_queue_depth", "Pending requests in the deadline-aware queue")?;
        registry.register(Box::new(queue_depth.clone()))?;
        Ok(Self { registry, queue_depth })
    }

    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
