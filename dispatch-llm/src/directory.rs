// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! C2: Worker Directory. Maintains the reachable worker set and exposes the
//! three dispatch primitives (`any`, `direct`, `round_robin`) downstream
//! code calls. Membership changes are copy-on-write: a selection call always
//! observes one consistent snapshot of the worker set, even under
//! concurrent churn (§4.2).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;
use thiserror::Error;

use crate::protocol::EnginePayload;
use crate::worker_client::{BoxFrameStream, WorkerClient, WorkerRpcError};
use crate::WorkerId;

/// Base URL of a worker's engine endpoint. Required to make the
/// "worker-facing" calls in §6 concrete; the service discovery mechanism
/// that would populate this is out of scope (§1) — something external calls
/// `worker_added`/`worker_removed` to keep the directory in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoint(pub String);

#[derive(Debug, Clone)]
struct WorkerEntry {
    worker_id: WorkerId,
    endpoint: EngineEndpoint,
}

#[derive(Debug, Default)]
struct Membership {
    // A Vec, not a HashMap, so round-robin has a stable iteration order and
    // fairness over k*N dispatches doesn't depend on hash bucket layout.
    order: Vec<WorkerEntry>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no such worker: {0}")]
    NoSuchWorker(WorkerId),
    #[error("no reachable workers")]
    NoReachableWorkers,
}

/// Either half of why a dispatch call to a worker failed: the directory
/// couldn't resolve a target, or the resolved target's engine call failed.
#[derive(Debug, Error)]
pub enum DispatchCallError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Rpc(#[from] WorkerRpcError),
}

pub struct WorkerDirectory {
    client: Arc<dyn WorkerClient>,
    membership: ArcSwap<Membership>,
    rr_cursor: AtomicU64,
}

impl WorkerDirectory {
    pub fn new(client: Arc<dyn WorkerClient>) -> Self {
        Self {
            client,
            membership: ArcSwap::from_pointee(Membership::default()),
            rr_cursor: AtomicU64::new(0),
        }
    }

    /// Applied atomically with respect to selection: readers either see the
    /// worker or they don't, never a partially-updated set.
    pub fn worker_added(&self, worker_id: WorkerId, endpoint: EngineEndpoint) {
        let current = self.membership.load();
        let mut order: Vec<WorkerEntry> = current
            .order
            .iter()
            .filter(|w| w.worker_id != worker_id)
            .cloned()
            .collect();
        order.push(WorkerEntry {
            worker_id,
            endpoint,
        });
        self.membership.store(Arc::new(Membership { order }));
        tracing::info!(worker_id, "worker added to directory");
    }

    pub fn worker_removed(&self, worker_id: WorkerId) {
        let current = self.membership.load();
        let order: Vec<WorkerEntry> = current
            .order
            .iter()
            .filter(|w| w.worker_id != worker_id)
            .cloned()
            .collect();
        self.membership.store(Arc::new(Membership { order }));
        tracing::info!(worker_id, "worker removed from directory");
    }

    pub fn reachable_ids(&self) -> Vec<WorkerId> {
        self.membership.load().order.iter().map(|w| w.worker_id).collect()
    }

    /// Same as `reachable_ids` minus a caller-supplied exclusion set, used by
    /// the Dispatcher's retry path to avoid re-selecting a worker that just
    /// failed.
    pub fn reachable_ids_excluding(&self, excluded: &[WorkerId]) -> Vec<WorkerId> {
        self.membership
            .load()
            .order
            .iter()
            .map(|w| w.worker_id)
            .filter(|id| !excluded.contains(id))
            .collect()
    }

    fn find(&self, worker_id: WorkerId) -> Option<EngineEndpoint> {
        self.membership
            .load()
            .order
            .iter()
            .find(|w| w.worker_id == worker_id)
            .map(|w| w.endpoint.clone())
    }

    /// Resolves to an arbitrary reachable worker.
    pub async fn any(&self, payload: EnginePayload) -> Result<BoxFrameStream, DispatchCallError> {
        let snapshot = self.membership.load_full();
        if snapshot.order.is_empty() {
            return Err(DirectoryError::NoReachableWorkers.into());
        }
        let idx = rand::rng().random_range(0..snapshot.order.len());
        let endpoint = snapshot.order[idx].endpoint.clone();
        Ok(self.client.call(&endpoint, payload).await?)
    }

    pub async fn direct(
        &self,
        worker_id: WorkerId,
        payload: EnginePayload,
    ) -> Result<BoxFrameStream, DispatchCallError> {
        let endpoint = self
            .find(worker_id)
            .ok_or(DirectoryError::NoSuchWorker(worker_id))?;
        Ok(self.client.call(&endpoint, payload).await?)
    }

    /// Advances a per-directory atomic cursor modulo the reachable-worker
    /// list. The cursor lives here, not in the Router, so round-robin state
    /// isn't duplicated between the two (§9's consolidation decision).
    pub async fn round_robin(
        &self,
        payload: EnginePayload,
    ) -> Result<BoxFrameStream, DispatchCallError> {
        let snapshot = self.membership.load_full();
        if snapshot.order.is_empty() {
            return Err(DirectoryError::NoReachableWorkers.into());
        }
        let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        let idx = (cursor as usize) % snapshot.order.len();
        let endpoint = snapshot.order[idx].endpoint.clone();
        Ok(self.client.call(&endpoint, payload).await?)
    }
}
