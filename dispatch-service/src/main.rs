// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod config;
mod handlers;
mod http;
mod metrics_exporter;
mod state;

use std::sync::Arc;

use dispatch_llm::{DeadlineAwareQueue, Dispatcher, HttpWorkerClient, MetricsAggregator, Router, WorkerDirectory};
use dispatch_runtime::{CancellationToken, SystemClock};

use crate::config::AppConfig;
use crate::metrics_exporter::{PrometheusObserver, ServiceMetrics};
use crate::state::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let config_path = std::env::var("DISPATCH_CONFIG_PATH").ok();
    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "service exited with error");
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    let clock = Arc::new(SystemClock);
    let service_metrics = Arc::new(ServiceMetrics::new()?);
    let observer = Arc::new(PrometheusObserver::new(&service_metrics.registry)?);

    let metrics_aggregator = Arc::new(MetricsAggregator::new(clock.clone(), config.metrics));
    let router = Arc::new(Router::new(config.router, clock.clone(), metrics_aggregator.clone()));

    let worker_client = Arc::new(HttpWorkerClient::new(std::time::Duration::from_secs(
        config.dispatch.first_token_timeout_secs,
    )));
    let directory = Arc::new(WorkerDirectory::new(worker_client));

    let darq = Arc::new(DeadlineAwareQueue::new(clock.clone(), config.darq)?);

    let dispatcher = Arc::new(Dispatcher::new(
        config.dispatch,
        router.clone(),
        directory.clone(),
        darq.clone(),
        observer,
    ));

    let shutdown = CancellationToken::new();

    let release_loop = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.run_release_loop() => {}
                _ = shutdown.cancelled() => {}
            }
        })
    };

    let eviction_ticker = {
        let router = router.clone();
        let shutdown = shutdown.clone();
        let interval_secs = config.router.eviction_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => router.run_eviction_tick(),
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    };

    let queue_depth_ticker = {
        let darq = darq.clone();
        let service_metrics = service_metrics.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
            loop {
                tokio::select! {
                    _ = ticker.tick() => service_metrics.queue_depth.set(darq.size() as i64),
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    };

    let state = AppState {
        darq,
        router,
        directory,
        metrics_aggregator,
        service_metrics,
        min_workers: config.dispatch.min_workers,
    };
    let app = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(bind_addr = %config.bind_addr, "dispatch-service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    release_loop.abort();
    eviction_ticker.abort();
    queue_depth_ticker.abort();

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
