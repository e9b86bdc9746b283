// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

/// Accumulated timing statistics for one metric. Times are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricStats {
    #[serde(rename = "callCount")]
    pub call_count: u64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    #[serde(rename = "sumOfSquares")]
    pub sum_of_squares: f64,
}

impl MetricStats {
    pub fn record(&mut self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        if self.call_count == 0 || seconds < self.min {
            self.min = seconds;
        }
        if seconds > self.max {
            self.max = seconds;
        }
        self.call_count += 1;
        self.total += seconds;
        self.sum_of_squares += seconds * seconds;
    }

    pub fn increment_call_count(&mut self, count: u64) {
        self.call_count += count;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsPayload {
    pub metrics: Vec<(MetricKey, MetricStats)>,
}

impl MetricsPayload {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn get(&self, name: &str, scope: Option<&str>) -> Option<&MetricStats> {
        self.metrics
            .iter()
            .find(|(key, _)| key.name == name && key.scope.as_deref() == scope)
            .map(|(_, stats)| stats)
    }
}

/// Unscoped metrics are keyed by name, scoped ones by (scope, name).
#[derive(Debug, Clone, Default)]
pub struct MetricAggregator {
    unscoped: HashMap<String, MetricStats>,
    scoped: HashMap<String, HashMap<String, MetricStats>>,
}

impl MetricAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create_metric(&mut self, name: &str, scope: Option<&str>) -> &mut MetricStats {
        let metrics = match scope {
            Some(scope) => self.scoped.entry(scope.to_string()).or_default(),
            None => &mut self.unscoped,
        };
        metrics.entry(name.to_string()).or_default()
    }

    pub fn get_metric(&self, name: &str, scope: Option<&str>) -> Option<&MetricStats> {
        match scope {
            Some(scope) => self.scoped.get(scope)?.get(name),
            None => self.unscoped.get(name),
        }
    }

    pub fn record(&mut self, name: &str, scope: Option<&str>, duration: Duration) {
        self.get_or_create_metric(name, scope).record(duration);
    }

    pub fn increment(&mut self, name: &str) {
        self.get_or_create_metric(name, None).increment_call_count(1);
    }

    pub fn is_empty(&self) -> bool {
        self.unscoped.is_empty() && self.scoped.values().all(HashMap::is_empty)
    }

    /// Takes every metric, sorted by key.
    pub fn drain(&mut self) -> MetricsPayload {
        let unscoped = self.unscoped.drain().map(|(name, stats)| {
            (MetricKey { name, scope: None }, stats)
        });
        let scoped = self.scoped.drain().flat_map(|(scope, metrics)| {
            metrics.into_iter().map(move |(name, stats)| {
                (
                    MetricKey {
                        name,
                        scope: Some(scope.clone()),
                    },
                    stats,
                )
            })
        });
        let mut metrics: Vec<_> = unscoped.chain(scoped).collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        MetricsPayload { metrics }
    }

    pub fn clear(&mut self) {
        self.unscoped.clear();
        self.scoped.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_stats() {
        let mut stats = MetricStats::default();
        stats.record(Duration::from_millis(500));
        stats.record(Duration::from_millis(1500));

        assert_eq!(stats.call_count, 2);
        assert!((stats.total - 2.0).abs() < f64::EPSILON);
        assert!((stats.min - 0.5).abs() < f64::EPSILON);
        assert!((stats.max - 1.5).abs() < f64::EPSILON);
        assert!((stats.sum_of_squares - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_scoped_and_unscoped_are_separate() {
        let mut aggregator = MetricAggregator::new();
        aggregator.record("Datastore/select", Some("WebTransaction/users"), Duration::from_millis(3));
        aggregator.increment("Datastore/select");

        assert_eq!(
            aggregator
                .get_metric("Datastore/select", Some("WebTransaction/users"))
                .map(|stats| stats.call_count),
            Some(1)
        );
        assert_eq!(
            aggregator
                .get_metric("Datastore/select", None)
                .map(|stats| stats.call_count),
            Some(1)
        );
        assert!(aggregator.get_metric("Datastore/select", Some("other")).is_none());
    }

    #[test]
    fn test_drain_sorted_by_key() {
        let mut aggregator = MetricAggregator::new();
        aggregator.increment("b");
        aggregator.increment("a");
        aggregator.record("child", Some("scope"), Duration::from_millis(1));

        let payload = aggregator.drain();
        assert!(aggregator.is_empty());
        let names: Vec<&str> = payload.metrics.iter().map(|(key, _)| key.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "child"]);
        assert_eq!(
            payload.get("child", Some("scope")).map(|stats| stats.call_count),
            Some(1)
        );
    }
}
