// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_SERVICE: &str = "unknown-service";
const DEFAULT_MAX_CUSTOM_EVENTS: usize = 10_000;
const DEFAULT_MAX_SPAN_EVENTS: usize = 2_000;
const DEFAULT_MAX_ERROR_EVENTS: usize = 100;
const DEFAULT_HARVEST_INTERVAL_SECS: u64 = 60;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Application name attached to every LLM event
    pub service: String,
    /// Master switch; when off no transactions are created
    pub enabled: bool,
    /// Whether registered instrumentation runs on module load
    pub instrumentation_enabled: bool,
    /// Whether LLM adapters emit events
    pub ai_monitoring_enabled: bool,
    /// Module names whose instrumentation is skipped
    pub disabled_instrumentation: BTreeSet<String>,
    pub max_custom_events: usize,
    pub max_span_events: usize,
    pub max_error_events: usize,
    pub harvest_interval: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
            enabled: true,
            instrumentation_enabled: true,
            ai_monitoring_enabled: true,
            disabled_instrumentation: BTreeSet::new(),
            max_custom_events: DEFAULT_MAX_CUSTOM_EVENTS,
            max_span_events: DEFAULT_MAX_SPAN_EVENTS,
            max_error_events: DEFAULT_MAX_ERROR_EVENTS,
            harvest_interval: Duration::from_secs(DEFAULT_HARVEST_INTERVAL_SECS),
            log_level: "info".to_string(),
        }
    }
}

fn flag(var: &str, default: bool) -> bool {
    env::var(var)
        .map(|val| val.to_lowercase() != "false" && val != "0")
        .unwrap_or(default)
}

fn number<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue {
                var: var.to_string(),
                value,
            }),
        Err(_) => Ok(default),
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let service = env::var("DD_SERVICE")
            .ok()
            .filter(|val| !val.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE.to_string());
        let disabled_instrumentation = env::var("DD_APM_DISABLED_INSTRUMENTATION")
            .map(|val| {
                val.split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let log_level = env::var("DD_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        let config = Self {
            service,
            enabled: flag("DD_APM_ENABLED", true),
            instrumentation_enabled: flag("DD_APM_INSTRUMENTATION_ENABLED", true),
            ai_monitoring_enabled: flag("DD_APM_AI_MONITORING_ENABLED", true),
            disabled_instrumentation,
            max_custom_events: number("DD_APM_MAX_CUSTOM_EVENTS", DEFAULT_MAX_CUSTOM_EVENTS)?,
            max_span_events: number("DD_APM_MAX_SPAN_EVENTS", DEFAULT_MAX_SPAN_EVENTS)?,
            max_error_events: number("DD_APM_MAX_ERROR_EVENTS", DEFAULT_MAX_ERROR_EVENTS)?,
            harvest_interval: Duration::from_secs(number(
                "DD_APM_HARVEST_INTERVAL_SECS",
                DEFAULT_HARVEST_INTERVAL_SECS,
            )?),
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "DD_SERVICE cannot be empty".to_string(),
            ));
        }

        if self.harvest_interval.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Harvest interval must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn is_instrumentation_disabled(&self, module_name: &str) -> bool {
        !self.instrumentation_enabled || self.disabled_instrumentation.contains(module_name)
    }
}
