// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The engine the Dispatcher forwards to, modeled as a `WorkerClient` trait.
//! The vLLM/SGLang engines themselves stay opaque (§1); `HttpWorkerClient`
//! is concrete enough to exercise the retry/cancellation logic in §5
//! without depending on an actual engine process.

use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::io::AsyncBufReadExt;

use crate::directory::EngineEndpoint;
use crate::protocol::{EnginePayload, RequestOutputFrame};

pub type BoxFrameStream =
    Pin<Box<dyn Stream<Item = Result<RequestOutputFrame, WorkerRpcError>> + Send>>;

/// Retry classification the spec describes as policy ("transient network,
/// worker restart") but does not enumerate a taxonomy for; this supplies one
/// consistent with §7's error kinds.
#[derive(Debug, thiserror::Error)]
pub enum WorkerRpcError {
    #[error("failed to connect to worker: {0}")]
    ConnectFailed(String),
    #[error("worker request timed out")]
    Timeout,
    #[error("worker returned HTTP {0}")]
    Http4xx(u16),
    #[error("failed to decode response frame: {0}")]
    Decode(String),
}

impl WorkerRpcError {
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            WorkerRpcError::ConnectFailed(_) | WorkerRpcError::Timeout
        )
    }
}

#[async_trait::async_trait]
pub trait WorkerClient: Send + Sync {
    async fn call(
        &self,
        endpoint: &EngineEndpoint,
        payload: EnginePayload,
    ) -> Result<BoxFrameStream, WorkerRpcError>;
}

/// Posts the §6 payload shape to the worker's `/generate` endpoint and reads
/// back a newline-delimited JSON stream of `RequestOutput` frames.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    http: reqwest::Client,
    first_token_timeout: Duration,
}

impl HttpWorkerClient {
    pub fn new(first_token_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            first_token_timeout,
        }
    }
}

#[async_trait::async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn call(
        &self,
        endpoint: &EngineEndpoint,
        payload: EnginePayload,
    ) -> Result<BoxFrameStream, WorkerRpcError> {
        let url = format!("{}/generate", endpoint.0.trim_end_matches('/'));

        let send = self.http.post(&url).json(&payload).send();
        let resp = tokio::time::timeout(self.first_token_timeout, send)
            .await
            .map_err(|_| WorkerRpcError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    WorkerRpcError::Timeout
                } else {
                    WorkerRpcError::ConnectFailed(e.to_string())
                }
            })?;

        if !resp.status().is_success() {
            return Err(WorkerRpcError::Http4xx(resp.status().as_u16()));
        }

        let byte_stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let reader = tokio_util::io::StreamReader::new(byte_stream);
        let lines = reader.lines();
        let frame_stream = tokio_stream::wrappers::LinesStream::new(lines).filter_map(|line| {
            futures::future::ready(match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => Some(
                    serde_json::from_str::<RequestOutputFrame>(&line)
                        .map_err(|e| WorkerRpcError::Decode(e.to_string())),
                ),
                Err(e) => Some(Err(WorkerRpcError::Decode(e.to_string()))),
            })
        });

        Ok(Box::pin(frame_stream))
    }
}
