// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use serde::Serialize;

/// Failure surfaced by an instrumented (or plain) host function.
///
/// Instrumentation never rewrites these: whatever the original function returned is what the
/// caller observes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct CallError {
    pub name: String,
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub param: Option<String>,
}

impl CallError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            status: None,
            code: None,
            param: None,
        }
    }

    /// A generic `Error` with only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }
}

/// Errors raised by the module loader while resolving or materializing a module.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Cannot find module '{specifier}' from '{}'", from.display())]
    NotFound { specifier: String, from: PathBuf },

    #[error("Invalid package manifest at '{}': {source}", path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error for '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No module provider could materialize '{}'", .0.display())]
    Unsupported(PathBuf),

    #[error("Module loader is no longer available")]
    LoaderGone,

    #[error("Shim for '{0}' has no module root to resolve from")]
    NoModuleRoot(String),
}

/// Errors raised by instrumentation hooks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstrumentationError {
    #[error("Instrumentation for '{module}' failed: {message}")]
    Hook { module: String, message: String },

    #[error("Instrumentation for '{module}' panicked: {message}")]
    Panicked { module: String, message: String },

    #[error("Failed to load '{specifier}' relative to '{module}': {message}")]
    Require {
        module: String,
        specifier: String,
        message: String,
    },
}

impl InstrumentationError {
    pub fn hook(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            module: module.into(),
            message: message.into(),
        }
    }

    pub fn require(module: &str, specifier: &str, error: &LoadError) -> Self {
        Self::Require {
            module: module.to_string(),
            specifier: specifier.to_string(),
            message: error.to_string(),
        }
    }

    pub fn module(&self) -> &str {
        match self {
            Self::Hook { module, .. } | Self::Panicked { module, .. } | Self::Require { module, .. } => {
                module
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid value '{value}' for {var}")]
    InvalidValue { var: String, value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("Failed to send harvest payload: {0}")]
    Send(String),

    #[error("Agent is not running")]
    NotRunning,
}
