// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HTTP handlers. Request/response bodies are deliberately thin: tokenizing
//! a chat payload into `prompt_token_ids` and translating it to
//! `engine_prompt` is a gateway/router concern this core sits behind, not
//! something this crate reimplements (§1 Non-goals).

use std::collections::HashMap;
use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{Json, http::StatusCode};
use dispatch_llm::{EngineEndpoint, MetricRecord, Request};
use dispatch_runtime::{CancellationToken, Clock, SystemClock};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub request_id: Option<String>,
    pub prompt_token_ids: Vec<u32>,
    #[serde(default)]
    pub engine_prompt: serde_json::Value,
    #[serde(default)]
    pub sampling_params: serde_json::Value,
    pub ttft_budget_ms: i64,
    pub estimated_prefill_ms: i64,
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
}

fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4())
}

/// §6 `min_workers`: the gateway refuses new traffic until enough workers
/// are reachable, rather than admitting requests DARQ/the Router can't yet
/// serve.
pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequest>,
) -> axum::response::Response {
    if !state.accepts_traffic() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "not enough reachable workers",
        )
            .into_response();
    }
    chat_completions_stream(state, body).await.into_response()
}

async fn chat_completions_stream(
    state: AppState,
    body: GenerateRequest,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let request_id = body.request_id.unwrap_or_else(new_request_id);
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let arrival_time_ms = SystemClock.now_ms();

    let request = Request {
        request_id: dispatch_runtime::RequestId::new(request_id.clone()),
        arrival_time_ms,
        ttft_budget_ms: body.ttft_budget_ms,
        estimated_prefill_ms: body.estimated_prefill_ms,
        prompt_token_ids: body.prompt_token_ids,
        trace_context: body.trace_context,
        engine_prompt: body.engine_prompt,
        sampling_params: body.sampling_params,
        hint: None,
        sink: tx,
        cancel_token: CancellationToken::new(),
    };

    let deadline_ms = state.darq.enqueue(request);
    tracing::debug!(request_id, deadline_ms, "request enqueued");

    let stream = ReceiverStream::new(rx).map(move |frame| {
        let event = match frame {
            Ok(frame) => Event::default().json_data(frame).unwrap_or_else(|e| {
                Event::default().event("error").data(e.to_string())
            }),
            Err(err) => Event::default().event("error").data(err.to_string()),
        };
        Ok(event)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct IngestMetricRequest {
    pub worker_id: i64,
    pub kv_cache_usage: f64,
    pub pending_requests: u64,
}

pub async fn ingest_metric(
    State(state): State<AppState>,
    Json(body): Json<IngestMetricRequest>,
) -> StatusCode {
    state.metrics_aggregator.on_update(
        body.worker_id,
        MetricRecord {
            kv_cache_usage: body.kv_cache_usage,
            pending_requests: body.pending_requests,
            last_updated_ms: SystemClock.now_ms(),
        },
    );
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: i64,
    pub endpoint: String,
}

pub async fn add_worker(
    State(state): State<AppState>,
    Json(body): Json<WorkerRegistration>,
) -> StatusCode {
    state
        .directory
        .worker_added(body.worker_id, EngineEndpoint(body.endpoint));
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct RemoveWorkerRequest {
    pub worker_id: i64,
}

pub async fn remove_worker(
    State(state): State<AppState>,
    Json(body): Json<RemoveWorkerRequest>,
) -> StatusCode {
    state.directory.worker_removed(body.worker_id);
    StatusCode::NO_CONTENT
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.service_metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::error!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
