// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CallError;

/// An error noticed while a transaction was running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exception {
    pub error: CallError,
    #[serde(skip)]
    pub timestamp: SystemTime,
    #[serde(rename = "customAttributes")]
    pub custom_attributes: Map<String, Value>,
    #[serde(rename = "agentAttributes")]
    pub agent_attributes: Map<String, Value>,
}

impl Exception {
    pub fn new(error: CallError) -> Self {
        Self {
            error,
            timestamp: SystemTime::now(),
            custom_attributes: Map::new(),
            agent_attributes: Map::new(),
        }
    }

    #[must_use]
    pub fn with_custom_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.custom_attributes.extend(attributes);
        self
    }

    #[must_use]
    pub fn with_agent_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.agent_attributes.extend(attributes);
        self
    }

    pub fn error_class(&self) -> &str {
        &self.error.name
    }

    pub fn message(&self) -> &str {
        &self.error.message
    }
}
