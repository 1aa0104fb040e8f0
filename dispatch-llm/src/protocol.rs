// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! §6 External Interfaces, made concrete: the worker-facing payload shape
//! and the `RequestOutput` frames streamed back. Tokenization, chat/message
//! formatting, and OpenAI protocol translation are out of scope (§1) — the
//! payload carries `engine_prompt`/`sampling_params` opaquely, exactly as
//! this core receives them.

use std::collections::HashMap;

use dispatch_runtime::RequestId;

use crate::dispatcher::DispatchError;

/// The worker-facing payload, posted to whichever of
/// `generate`/`direct`/`round_robin` the Dispatcher selects.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnginePayload {
    pub request_id: RequestId,
    pub engine_prompt: serde_json::Value,
    pub sampling_params: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_hit_rate: Option<f64>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub trace_headers: HashMap<String, String>,
}

/// One frame of a worker's streamed response, newline-delimited JSON over
/// the wire.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RequestOutputFrame {
    pub request_id: RequestId,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub prompt_token_ids: Option<Vec<u32>>,
    #[serde(default)]
    pub prompt_logprobs: Option<serde_json::Value>,
    #[serde(default)]
    pub outputs: serde_json::Value,
    pub finished: bool,
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
}

/// The write end of the caller's token stream. A plain mpsc channel rather
/// than a trait object: every sink in this core is "push frames to whoever
/// is proxying them to the client," and a channel is the idiomatic shape for
/// that in an async runtime.
pub type ResultSink = tokio::sync::mpsc::Sender<Result<RequestOutputFrame, DispatchError>>;
