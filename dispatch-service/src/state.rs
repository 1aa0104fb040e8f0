// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use dispatch_llm::{DeadlineAwareQueue, MetricsAggregator, Router, WorkerDirectory};

use crate::metrics_exporter::ServiceMetrics;

#[derive(Clone)]
pub struct AppState {
    pub darq: Arc<DeadlineAwareQueue>,
    pub router: Arc<Router>,
    pub directory: Arc<WorkerDirectory>,
    pub metrics_aggregator: Arc<MetricsAggregator>,
    pub service_metrics: Arc<ServiceMetrics>,
    /// §6: required reachable workers before dispatch accepts traffic.
    pub min_workers: usize,
}

impl AppState {
    /// Whether the directory currently has enough reachable workers for the
    /// gateway to accept new traffic; does not affect requests already
    /// enqueued or in flight.
    pub fn accepts_traffic(&self) -> bool {
        self.directory.reachable_ids().len() >= self.min_workers
    }
}
