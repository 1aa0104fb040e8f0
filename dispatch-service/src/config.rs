// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration layering: built-in defaults, overridden by an optional TOML
//! file, overridden by `DISPATCH_`-prefixed environment variables. Mirrors
//! the config table in §6.

use dispatch_llm::{DarqConfig, DispatchConfig, MetricsAggregatorConfig, RouterConfig};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bind_addr: String,
    pub router: RouterConfig,
    pub darq: DarqConfig,
    pub dispatch: DispatchConfig,
    pub metrics: MetricsAggregatorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            router: RouterConfig::default(),
            darq: DarqConfig::default(),
            dispatch: DispatchConfig::default(),
            metrics: MetricsAggregatorConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    /// `config_path` is optional: a missing file is not an error, it just
    /// means defaults plus environment overrides apply.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("DISPATCH_").split("__"));

        let config: AppConfig = figment.extract()?;
        config.validate_all()?;
        Ok(config)
    }

    fn validate_all(&self) -> Result<(), ConfigError> {
        self.router
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.darq.buffer_ms < 0 {
            return Err(ConfigError::Invalid(format!(
                "darq.buffer_ms must be non-negative, got {}",
                self.darq.buffer_ms
            )));
        }
        if self.darq.bucket_ms <= 0 {
            return Err(ConfigError::Invalid(format!(
                "darq.bucket_ms must be positive, got {}",
                self.darq.bucket_ms
            )));
        }
        if self.dispatch.min_workers == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.min_workers must be at least 1".to_string(),
            ));
        }
        if self.metrics.stale_after_ms <= 0 {
            return Err(ConfigError::Invalid(format!(
                "metrics.stale_after_ms must be positive, got {}",
                self.metrics.stale_after_ms
            )));
        }
        Ok(())
    }
}
