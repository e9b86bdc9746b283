// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Module interception: matching loaded modules against registered instrumentation.
//!
//! Hooks run once per module identity, the (module root, version) pair of one physical copy,
//! never once per name, so nested copies of a package are instrumented independently. A hook
//! that fails or panics never reaches the host: its wraps are rolled back, the module is flagged
//! and the caller receives the exports as they were before the hook ran.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, error, trace};

use crate::agent::Agent;
use crate::error::InstrumentationError;
use crate::module::{Exports, ModuleIdentity, ModuleLoader, ModuleRecord};
use crate::names;
use crate::shim::Shim;

pub type OnRequire = Arc<
    dyn Fn(&Arc<Shim>, &mut Exports, &str) -> Result<(), InstrumentationError> + Send + Sync,
>;
pub type OnError = Arc<dyn Fn(&InstrumentationError) + Send + Sync>;

/// Instrumentation for one module name. A registration without an `on_require` hook only
/// tracks usage of the module.
#[derive(Clone)]
pub struct InstrumentationRegistration {
    module_name: String,
    on_require: Option<OnRequire>,
    on_error: Option<OnError>,
}

impl InstrumentationRegistration {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            on_require: None,
            on_error: None,
        }
    }

    #[must_use]
    pub fn on_require<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Shim>, &mut Exports, &str) -> Result<(), InstrumentationError>
            + Send
            + Sync
            + 'static,
    {
        self.on_require = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&InstrumentationError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn is_tracking_only(&self) -> bool {
        self.on_require.is_none()
    }
}

impl fmt::Debug for InstrumentationRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentationRegistration")
            .field("module_name", &self.module_name)
            .field("on_require", &self.on_require.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[derive(Default)]
struct ShimmerState {
    registrations: HashMap<String, Vec<InstrumentationRegistration>>,
    processed: HashSet<ModuleIdentity>,
    instrumented: HashMap<String, BTreeSet<String>>,
    errored: HashSet<String>,
    seen_major_versions: HashSet<(String, String)>,
}

#[derive(Default)]
pub struct Shimmer {
    state: Mutex<ShimmerState>,
}

impl Shimmer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, registration: InstrumentationRegistration) {
        debug!(
            "Registered instrumentation for {}",
            registration.module_name
        );
        self.lock()
            .registrations
            .entry(registration.module_name.clone())
            .or_default()
            .push(registration);
    }

    pub fn has_registration(&self, module_name: &str) -> bool {
        self.lock().registrations.contains_key(module_name)
    }

    /// True once at least one copy of the module was instrumented without error.
    pub fn is_instrumented(&self, module_name: &str) -> bool {
        self.lock()
            .instrumented
            .get(module_name)
            .is_some_and(|versions| !versions.is_empty())
    }

    pub fn instrumented_versions(&self, module_name: &str) -> BTreeSet<String> {
        self.lock()
            .instrumented
            .get(module_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn instrumentation_errored(&self, module_name: &str) -> bool {
        self.lock().errored.contains(module_name)
    }

    pub fn is_processed(&self, identity: &ModuleIdentity) -> bool {
        self.lock().processed.contains(identity)
    }

    pub fn clear(&self) {
        *self.lock() = ShimmerState::default();
    }

    /// Applies every registration for `module_name` to `exports`, once per module identity.
    pub(crate) fn instrument(
        &self,
        agent: &Arc<Agent>,
        loader: Weak<ModuleLoader>,
        module_name: &str,
        record: Option<Arc<ModuleRecord>>,
        exports: Exports,
    ) -> Exports {
        if agent.config().is_instrumentation_disabled(module_name) {
            trace!("Instrumentation for {module_name} is disabled");
            return exports;
        }

        let identity = record
            .as_ref()
            .map(|record| record.identity())
            .unwrap_or_else(|| ModuleIdentity::synthetic(module_name));
        let major_version = record
            .as_ref()
            .map(|record| record.major_version().to_string())
            .unwrap_or_else(|| identity.version.clone());

        let (registrations, new_major_version) = {
            let mut state = self.lock();
            let Some(registrations) = state.registrations.get(module_name).cloned() else {
                return exports;
            };
            if !state.processed.insert(identity.clone()) {
                trace!(
                    "{module_name} at {} was already processed",
                    identity.root.display()
                );
                return exports;
            }
            let new_major_version = state
                .seen_major_versions
                .insert((module_name.to_string(), major_version.clone()));
            (registrations, new_major_version)
        };

        {
            let mut aggregators = agent.aggregators();
            aggregators.metrics.increment(&names::on_require(module_name));
            if new_major_version {
                aggregators
                    .metrics
                    .increment(&names::on_require_version(module_name, &major_version));
            }
        }

        let shim = Arc::new(Shim::new(
            Arc::clone(agent),
            loader,
            module_name,
            record,
            identity.clone(),
        ));
        let mut exports = exports;
        let mut succeeded = false;
        let mut failed = false;

        for registration in &registrations {
            let Some(on_require) = &registration.on_require else {
                succeeded = true;
                continue;
            };

            debug!(
                "Instrumenting {}@{} from {}",
                module_name,
                identity.version,
                identity.root.display()
            );
            let checkpoint = agent.wrappers().checkpoint(&identity);
            let before = exports.clone();
            match run_hook(module_name, || on_require(&shim, &mut exports, module_name)) {
                Ok(()) => succeeded = true,
                Err(err) => {
                    error!("Failed to instrument {module_name}: {err}");
                    failed = true;
                    agent.wrappers().rollback(&identity, checkpoint, &mut exports);
                    // Entries the hook changed without going through the shim are discarded
                    // as well.
                    exports = before;
                    if let Some(on_error) = &registration.on_error {
                        let handled = panic::catch_unwind(AssertUnwindSafe(|| on_error(&err)));
                        if handled.is_err() {
                            error!("Error hook for {module_name} panicked");
                        }
                    }
                }
            }
        }

        {
            let mut state = self.lock();
            if failed {
                state.errored.insert(module_name.to_string());
            }
            if succeeded {
                state
                    .instrumented
                    .entry(module_name.to_string())
                    .or_default()
                    .insert(identity.version.clone());
            }
        }

        if succeeded {
            exports.set_shim(shim);
        }
        exports
    }

    fn lock(&self) -> MutexGuard<'_, ShimmerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_hook<F>(module_name: &str, hook: F) -> Result<(), InstrumentationError>
where
    F: FnOnce() -> Result<(), InstrumentationError>,
{
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(result) => result,
        Err(payload) => Err(InstrumentationError::Panicked {
            module: module_name.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::module::{Completion, Function};
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(root: &str, version: &str) -> Arc<ModuleRecord> {
        Arc::new(ModuleRecord {
            name: "pkg".to_string(),
            version: version.to_string(),
            root: PathBuf::from(root),
            file: PathBuf::from(root).join("index.js"),
            is_entry_point: true,
        })
    }

    fn exports() -> Exports {
        Exports::new().with_function("query", Function::new("query", |_| Completion::ok(json!(1))))
    }

    fn unscoped_count(agent: &Agent, name: &str) -> Option<u64> {
        agent
            .aggregators()
            .metrics
            .get_metric(name, None)
            .map(|stats| stats.call_count)
    }

    #[test]
    fn test_runs_once_per_identity() {
        let agent = Agent::new(AgentConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        agent.register_instrumentation(InstrumentationRegistration::new("pkg").on_require(
            move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ));

        let shimmer = agent.shimmer();
        for _ in 0..2 {
            shimmer.instrument(&agent, Weak::new(), "pkg", Some(record("/a/pkg", "3.0.0")), exports());
        }
        shimmer.instrument(&agent, Weak::new(), "pkg", Some(record("/b/pkg", "3.0.1")), exports());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(unscoped_count(&agent, &names::on_require("pkg")), Some(2));
        assert_eq!(
            unscoped_count(&agent, &names::on_require_version("pkg", "3")),
            Some(1)
        );
        assert_eq!(
            shimmer.instrumented_versions("pkg").into_iter().collect::<Vec<_>>(),
            vec!["3.0.0".to_string(), "3.0.1".to_string()]
        );
    }

    #[test]
    fn test_failed_hook_returns_original_exports() {
        let agent = Agent::new(AgentConfig::default());
        let errors = Arc::new(AtomicUsize::new(0));
        let error_count = Arc::clone(&errors);
        agent.register_instrumentation(
            InstrumentationRegistration::new("pkg")
                .on_require(|shim, exports, _| {
                    shim.wrap(exports, "query", |_, _| {
                        Function::new("broken", |_| Completion::ok(json!("wrapped")))
                    });
                    exports.insert("extra", crate::module::Export::Value(json!(true)));
                    Err(InstrumentationError::hook("pkg", "boom"))
                })
                .on_error(move |err| {
                    assert_eq!(err.module(), "pkg");
                    error_count.fetch_add(1, Ordering::SeqCst);
                }),
        );

        let original = exports();
        let result = agent.shimmer().instrument(
            &agent,
            Weak::new(),
            "pkg",
            Some(record("/a/pkg", "1.0.0")),
            original.clone(),
        );

        assert!(result.shim().is_none());
        assert!(result.get("extra").is_none());
        assert!(result
            .get_function("query")
            .expect("query")
            .same_as(original.get_function("query").expect("query")));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!agent.is_instrumented("pkg"));
        assert!(agent.shimmer().instrumentation_errored("pkg"));
        assert!(agent.wrappers().keys().is_empty());
        assert_eq!(unscoped_count(&agent, &names::on_require("pkg")), Some(1));
    }

    #[test]
    fn test_panicking_hook_is_contained() {
        let agent = Agent::new(AgentConfig::default());
        agent.register_instrumentation(
            InstrumentationRegistration::new("pkg").on_require(|_, _, _| panic!("hook exploded")),
        );

        let result = agent.shimmer().instrument(
            &agent,
            Weak::new(),
            "pkg",
            Some(record("/a/pkg", "1.0.0")),
            exports(),
        );
        assert!(result.get_function("query").is_some());
        assert!(agent.shimmer().instrumentation_errored("pkg"));
    }

    #[test]
    fn test_tracking_only_counts_as_instrumented() {
        let agent = Agent::new(AgentConfig::default());
        agent.register_instrumentation(InstrumentationRegistration::new("knex"));

        let result = agent.shimmer().instrument(
            &agent,
            Weak::new(),
            "knex",
            Some(record("/a/knex", "1.0.1")),
            exports(),
        );
        assert!(result.shim().is_some());
        assert!(agent.is_instrumented("knex"));
        assert_eq!(
            unscoped_count(&agent, &names::on_require_version("knex", "1")),
            Some(1)
        );
    }

    #[test]
    fn test_disabled_module_is_skipped() {
        let mut config = AgentConfig::default();
        config.disabled_instrumentation.insert("pkg".to_string());
        let agent = Agent::new(config);
        agent.register_instrumentation(InstrumentationRegistration::new("pkg"));

        let result = agent.shimmer().instrument(
            &agent,
            Weak::new(),
            "pkg",
            Some(record("/a/pkg", "1.0.0")),
            exports(),
        );
        assert!(result.shim().is_none());
        assert!(!agent.shimmer().is_processed(&record("/a/pkg", "1.0.0").identity()));
        assert!(unscoped_count(&agent, &names::on_require("pkg")).is_none());
    }

    #[test]
    fn test_unregistered_module_is_untouched() {
        let agent = Agent::new(AgentConfig::default());
        let result = agent.shimmer().instrument(
            &agent,
            Weak::new(),
            "other",
            Some(record("/a/other", "1.0.0")),
            exports(),
        );
        assert!(result.shim().is_none());
        assert!(!agent.shimmer().is_processed(&record("/a/other", "1.0.0").identity()));
    }
}
