// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! C5: Dispatcher. The glue between the queue, the router, and the worker
//! directory: pulls eligible requests, resolves a target with the Router,
//! forwards to the Worker Directory, and proxies the resulting frame stream
//! back to the caller, retrying on transient failures per §4.5/§7.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use thiserror::Error;

use crate::darq::{DeadlineAwareQueue, Request};
use crate::directory::{DirectoryError, DispatchCallError, WorkerDirectory};
use crate::protocol::EnginePayload;
use crate::router::{Router, RoutingDecision, RoutingRequest};
use crate::worker_client::WorkerRpcError;
use crate::WorkerId;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct DispatchConfig {
    /// Additional attempts after the first, only taken for retriable
    /// failures that occur before any frame has reached the caller.
    pub max_retries: u32,
    pub first_token_timeout_secs: u64,
    pub min_workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            first_token_timeout_secs: 30,
            min_workers: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no reachable workers")]
    NoReachableWorkers,
    #[error("worker {0} is unavailable")]
    WorkerUnavailable(WorkerId),
    #[error(transparent)]
    Engine(#[from] WorkerRpcError),
    #[error("request cancelled by caller")]
    Cancelled,
}

impl DispatchError {
    fn retriable(&self) -> bool {
        match self {
            DispatchError::Engine(e) => e.retriable(),
            DispatchError::WorkerUnavailable(_) => true,
            DispatchError::NoReachableWorkers | DispatchError::Cancelled => false,
        }
    }
}

impl From<DispatchCallError> for DispatchError {
    fn from(err: DispatchCallError) -> Self {
        match err {
            DispatchCallError::Directory(DirectoryError::NoSuchWorker(id)) => {
                DispatchError::WorkerUnavailable(id)
            }
            DispatchCallError::Directory(DirectoryError::NoReachableWorkers) => {
                DispatchError::NoReachableWorkers
            }
            DispatchCallError::Rpc(e) => DispatchError::Engine(e),
        }
    }
}

/// Per-request disposition, surfaced to whatever wants to count outcomes
/// (metrics, logging) without `dispatch-llm` depending on a specific
/// exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ok,
    Retried,
    Failed,
}

pub trait DispatchObserver: Send + Sync {
    fn on_outcome(&self, outcome: DispatchOutcome);
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {
    fn on_outcome(&self, _outcome: DispatchOutcome) {}
}

struct InflightGuard<'a> {
    counter: &'a AtomicU64,
    darq: &'a DeadlineAwareQueue,
}

impl<'a> InflightGuard<'a> {
    fn enter(counter: &'a AtomicU64, darq: &'a DeadlineAwareQueue) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter, darq }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        // `fetch_sub` returns the pre-decrement value: 1 means this was the
        // last in-flight request, i.e. the dispatcher just became idle.
        // Wake anything suspended in `dequeue_eligible` so it re-polls
        // `is_idle` instead of sitting on a deadline nobody is waiting on
        // (§5 wake-up correctness condition (c)).
        if self.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.darq.notify_idle();
        }
    }
}

pub struct Dispatcher {
    config: DispatchConfig,
    router: Arc<Router>,
    directory: Arc<WorkerDirectory>,
    darq: Arc<DeadlineAwareQueue>,
    observer: Arc<dyn DispatchObserver>,
    inflight: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        router: Arc<Router>,
        directory: Arc<WorkerDirectory>,
        darq: Arc<DeadlineAwareQueue>,
        observer: Arc<dyn DispatchObserver>,
    ) -> Self {
        Self {
            config,
            router,
            directory,
            darq,
            observer,
            inflight: AtomicU64::new(0),
        }
    }

    /// Whether there is currently no in-flight work, per §4.3.4's
    /// opportunistic-release condition.
    pub fn is_idle(&self) -> bool {
        self.inflight.load(Ordering::SeqCst) == 0
    }

    /// Pulls eligible requests forever and spawns one task per request so a
    /// slow worker can't hold up the rest of the queue. Intended to be
    /// spawned once by the service layer and left running for the process
    /// lifetime.
    pub async fn run_release_loop(self: Arc<Self>) {
        loop {
            let request = self.darq.dequeue_eligible(|| self.is_idle()).await;
            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                dispatcher.dispatch_one(request).await;
            });
        }
    }

    fn build_payload(request: &Request) -> EnginePayload {
        EnginePayload {
            request_id: request.request_id.clone(),
            engine_prompt: request.engine_prompt.clone(),
            sampling_params: request.sampling_params.clone(),
            prefix_hit_rate: request
                .hint
                .as_ref()
                .and_then(|hint| hint.prefix_hit_rate),
            trace_headers: request.trace_context.clone(),
        }
    }

    async fn dispatch_one(&self, request: Request) {
        let _guard = InflightGuard::enter(&self.inflight, &self.darq);

        if request.cancel_token.is_cancelled() {
            let _ = request.sink.send(Err(DispatchError::Cancelled)).await;
            self.observer.on_outcome(DispatchOutcome::Failed);
            return;
        }

        let mut excluded: Vec<WorkerId> = Vec::new();
        let mut attempt = 0u32;

        loop {
            let reachable = self.directory.reachable_ids_excluding(&excluded);
            let routing_request = RoutingRequest {
                prompt_token_ids: &request.prompt_token_ids,
                hint: request.hint.clone(),
            };

            let decision = match self.router.select(&routing_request, &reachable) {
                Ok(decision) => decision,
                Err(_) => {
                    let _ = request.sink.send(Err(DispatchError::NoReachableWorkers)).await;
                    self.observer.on_outcome(DispatchOutcome::Failed);
                    return;
                }
            };

            let payload = Self::build_payload(&request);
            let call_result = match decision {
                RoutingDecision::Any => self.directory.any(payload).await,
                RoutingDecision::RoundRobin => self.directory.round_robin(payload).await,
                RoutingDecision::Worker(worker_id) => self.directory.direct(worker_id, payload).await,
            };

            let stream = match call_result {
                Ok(stream) => stream,
                Err(err) => {
                    let dispatch_err: DispatchError = err.into();
                    if dispatch_err.retriable() && attempt < self.config.max_retries {
                        attempt += 1;
                        if let DispatchError::WorkerUnavailable(id) = dispatch_err {
                            excluded.push(id);
                        }
                        self.observer.on_outcome(DispatchOutcome::Retried);
                        tracing::warn!(request_id = %request.request_id, attempt, "retrying dispatch after transient failure");
                        continue;
                    }
                    let _ = request.sink.send(Err(dispatch_err)).await;
                    self.observer.on_outcome(DispatchOutcome::Failed);
                    return;
                }
            };

            match self.proxy_stream(&request, stream, attempt).await {
                StreamOutcome::Completed => {
                    self.observer.on_outcome(DispatchOutcome::Ok);
                }
                StreamOutcome::RetryBeforeFirstFrame(worker_hint) if attempt < self.config.max_retries => {
                    attempt += 1;
                    if let Some(id) = worker_hint {
                        excluded.push(id);
                    }
                    self.observer.on_outcome(DispatchOutcome::Retried);
                    continue;
                }
                StreamOutcome::RetryBeforeFirstFrame(_) | StreamOutcome::Failed => {
                    self.observer.on_outcome(DispatchOutcome::Failed);
                }
                StreamOutcome::Cancelled => {
                    self.observer.on_outcome(DispatchOutcome::Failed);
                }
            }
            return;
        }
    }

    /// Proxies frames from the worker to the caller's sink, honoring
    /// cancellation. Only failures that occur before the first frame is
    /// forwarded are eligible for retry — once output has reached the
    /// caller, replaying the request would duplicate tokens they've already
    /// seen. §5: `first_token_timeout_secs` bounds only the wait for that
    /// first frame; once one has arrived there is no upper bound on
    /// subsequent tokens, so the timeout branch is disarmed thereafter.
    async fn proxy_stream(
        &self,
        request: &Request,
        mut stream: crate::worker_client::BoxFrameStream,
        _attempt: u32,
    ) -> StreamOutcome {
        let first_token_deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(self.config.first_token_timeout_secs);
        let mut emitted_any = false;
        loop {
            tokio::select! {
                biased;
                _ = request.cancel_token.cancelled() => {
                    return StreamOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(first_token_deadline), if !emitted_any => {
                    return StreamOutcome::RetryBeforeFirstFrame(None);
                }
                next = stream.next() => {
                    match next {
                        None => return StreamOutcome::Completed,
                        Some(Ok(frame)) => {
                            emitted_any = true;
                            let finished = frame.finished;
                            if request.sink.send(Ok(frame)).await.is_err() {
                                // Caller dropped the receiver; nothing left to do.
                                return StreamOutcome::Cancelled;
                            }
                            if finished {
                                return StreamOutcome::Completed;
                            }
                        }
                        Some(Err(rpc_err)) => {
                            if !emitted_any && rpc_err.retriable() {
                                return StreamOutcome::RetryBeforeFirstFrame(None);
                            }
                            let _ = request.sink.send(Err(DispatchError::Engine(rpc_err))).await;
                            return StreamOutcome::Failed;
                        }
                    }
                }
            }
        }
    }
}

enum StreamOutcome {
    Completed,
    RetryBeforeFirstFrame(Option<WorkerId>),
    Failed,
    Cancelled,
}
