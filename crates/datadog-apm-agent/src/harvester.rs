// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent::Agent;
use crate::aggregators::HarvestPayload;
use crate::error::HarvestError;

/// Ships harvested telemetry to a collector.
#[async_trait]
pub trait HarvestSink: Send + Sync {
    async fn send(&self, payload: &HarvestPayload) -> Result<(), HarvestError>;
}

pub struct Harvester {
    agent: Arc<Agent>,
    sink: Arc<dyn HarvestSink>,
    interval: Duration,
    failed: Mutex<Option<HarvestPayload>>,
}

impl Harvester {
    pub fn new(agent: Arc<Agent>, sink: Arc<dyn HarvestSink>) -> Self {
        let interval = agent.config().harvest_interval;
        Self {
            agent,
            sink,
            interval,
            failed: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sends what the agent buffered since the last harvest.
    /// A payload that failed to send is retried first and kept until it goes through.
    pub async fn harvest_once(&self) -> Result<(), HarvestError> {
        if !self.agent.is_running() {
            return Err(HarvestError::NotRunning);
        }

        let mut failed = self.failed.lock().await;
        if let Some(payload) = failed.take() {
            debug!("Retrying previously failed harvest payload");
            if let Err(err) = self.sink.send(&payload).await {
                error!("Error retrying harvest payload: {err}");
                *failed = Some(payload);
                return Err(err);
            }
        }

        let payload = self.agent.drain();
        if payload.is_empty() {
            return Ok(());
        }
        debug!(
            "Harvesting {} custom, {} span and {} error events",
            payload.custom_events.len(),
            payload.span_events.len(),
            payload.error_events.len()
        );
        match self.sink.send(&payload).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("Error sending harvest payload: {err}");
                *failed = Some(payload);
                Err(err)
            }
        }
    }

    pub async fn has_pending_retry(&self) -> bool {
        self.failed.lock().await.is_some()
    }

    /// Harvests on every interval until `cancel_token` fires, then harvests once more.
    pub async fn run(&self, cancel_token: CancellationToken) {
        let mut harvest_interval = tokio::time::interval(self.interval);
        harvest_interval.tick().await; // discard first tick

        loop {
            tokio::select! {
                _ = harvest_interval.tick() => {
                    let _ = self.harvest_once().await;
                }
                _ = cancel_token.cancelled() => {
                    info!("Shutting down harvester");
                    debug!("Final harvest");
                    let _ = self.harvest_once().await;
                    break;
                }
            }
        }
    }
}
