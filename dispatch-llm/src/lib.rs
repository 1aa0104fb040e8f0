// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The request-dispatch core: a deadline-aware queue (C3) feeding a
//! worker-selection router (C4) and dispatcher (C5), backed by a metrics
//! aggregator (C1) and worker directory (C2). Transport, tokenization, and
//! multi-node coordination are handled above this crate.

pub mod darq;
pub mod directory;
pub mod dispatcher;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod worker_client;

/// Workers are identified by an application-assigned integer, not a UUID —
/// mirroring how the KV-router scheduler this is modeled on keys its
/// `HashMap<i64, _>` worker maps.
pub type WorkerId = i64;

pub use darq::{DarqConfig, DarqError, DeadlineAwareQueue, Request};
pub use directory::{DirectoryError, DispatchCallError, EngineEndpoint, WorkerDirectory};
pub use dispatcher::{DispatchConfig, DispatchError, DispatchObserver, DispatchOutcome, Dispatcher, NoopObserver};
pub use metrics::{MetricRecord, MetricsAggregator, MetricsAggregatorConfig};
pub use protocol::{EnginePayload, RequestOutputFrame, ResultSink};
pub use router::{Policy, Router, RouterConfig, RouterError, RoutingDecision, RoutingHint, RoutingRequest};
pub use worker_client::{BoxFrameStream, HttpWorkerClient, WorkerClient, WorkerRpcError};
