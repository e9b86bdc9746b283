// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent owns all process-wide state: registrations, processed module identities, the
//! wrapper registry and the aggregators. Tests build isolated instances; a host builds one,
//! calls [`Agent::init`], patches its loader and calls [`Agent::teardown`] on unload.

use std::env;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info};

use crate::aggregators::{AggregatedEvent, Aggregators, HarvestPayload};
use crate::config::AgentConfig;
use crate::instrumentation;
use crate::module::{resolver, Exports, LoadInterceptor, ModuleLoader, ModuleRecord};
use crate::shim::WrapperRegistry;
use crate::shimmer::{InstrumentationRegistration, Shimmer};
use crate::transaction::{FinishedTransaction, Transaction, TransactionKind};

pub struct Agent {
    config: AgentConfig,
    me: Weak<Agent>,
    running: AtomicBool,
    shimmer: Shimmer,
    wrappers: WrapperRegistry,
    aggregators: Mutex<Aggregators>,
    loaders: Mutex<Vec<Weak<ModuleLoader>>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let aggregators = Aggregators::new(&config);
        Arc::new_cyclic(|me| Self {
            config,
            me: me.clone(),
            running: AtomicBool::new(false),
            shimmer: Shimmer::new(),
            wrappers: WrapperRegistry::new(),
            aggregators: Mutex::new(aggregators),
            loaders: Mutex::new(Vec::new()),
        })
    }

    /// Registers the built-in instrumentation and starts accepting harvests. Calling it on a
    /// running agent does nothing.
    pub fn init(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for registration in instrumentation::builtin() {
            self.shimmer.register(registration);
        }
        info!("APM agent started for {}", self.config.service);
    }

    /// Detaches from every patched loader and clears all process-wide state.
    pub fn teardown(&self) {
        let loaders: Vec<_> = self.loaders_lock().drain(..).collect();
        for loader in loaders.iter().filter_map(Weak::upgrade) {
            self.detach(&loader);
        }
        self.shimmer.clear();
        self.wrappers.clear();
        self.aggregators().clear();
        self.running.store(false, Ordering::SeqCst);
        info!("APM agent stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn shimmer(&self) -> &Shimmer {
        &self.shimmer
    }

    pub fn wrappers(&self) -> &WrapperRegistry {
        &self.wrappers
    }

    pub fn aggregators(&self) -> MutexGuard<'_, Aggregators> {
        self.aggregators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_instrumentation(&self, registration: InstrumentationRegistration) {
        self.shimmer.register(registration);
    }

    pub fn is_instrumented(&self, module_name: &str) -> bool {
        self.shimmer.is_instrumented(module_name)
    }

    /// Routes every fresh package load of `loader` through this agent.
    pub fn patch_loader(self: &Arc<Self>, loader: &Arc<ModuleLoader>) {
        let interceptor: Arc<dyn LoadInterceptor> = Arc::clone(self) as Arc<dyn LoadInterceptor>;
        loader.set_interceptor(interceptor);
        let mut loaders = self.loaders_lock();
        loaders.retain(|known| known.strong_count() > 0 && !known.ptr_eq(&Arc::downgrade(loader)));
        loaders.push(Arc::downgrade(loader));
        debug!("Patched module loader");
    }

    /// Stops intercepting `loader` and evicts the exports it cached with instrumentation, so
    /// the next load starts from the original module. Returns how many were evicted.
    pub fn unpatch_loader(&self, loader: &Arc<ModuleLoader>) -> usize {
        let target = Arc::downgrade(loader);
        self.loaders_lock().retain(|known| !known.ptr_eq(&target));
        self.detach(loader)
    }

    fn detach(&self, loader: &Arc<ModuleLoader>) -> usize {
        loader.clear_interceptor();
        let evicted = loader.evict(|_, exports| exports.shim().is_some());
        debug!("Unpatched module loader, evicted {evicted} instrumented modules");
        evicted
    }

    /// Applies registered instrumentation to a module loaded before the agent attached.
    /// Exports without a record are located by resolving `module_name` from the patched
    /// loader's base directory. Returns whether the module ended up instrumented.
    pub fn instrument_loaded_module(self: &Arc<Self>, module_name: &str, exports: &mut Exports) -> bool {
        let loaded = std::mem::take(exports);
        let loader = self
            .loaders_lock()
            .iter()
            .find(|loader| loader.strong_count() > 0)
            .cloned()
            .unwrap_or_default();
        let record = match loaded.record() {
            Some(record) => Some(Arc::new(record.clone())),
            None => locate_loaded_module(module_name, &loader),
        };
        *exports = self
            .shimmer
            .instrument(self, loader, module_name, record, loaded);
        exports.shim().is_some()
    }

    /// Starts a transaction. `None` when the agent is disabled.
    pub fn start_transaction(&self, kind: TransactionKind, name: &str) -> Option<Arc<Transaction>> {
        if !self.config.enabled {
            return None;
        }
        Some(Transaction::new(self.me.clone(), kind, name))
    }

    pub fn add_event(&self, event: AggregatedEvent) {
        self.aggregators().add_event(event);
    }

    pub(crate) fn record_finished(&self, transaction: FinishedTransaction) {
        self.aggregators().add_transaction(transaction);
    }

    /// Takes everything buffered since the previous drain.
    pub fn drain(&self) -> HarvestPayload {
        self.aggregators().drain()
    }

    fn loaders_lock(&self) -> MutexGuard<'_, Vec<Weak<ModuleLoader>>> {
        self.loaders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn locate_loaded_module(module_name: &str, loader: &Weak<ModuleLoader>) -> Option<Arc<ModuleRecord>> {
    let base_dir = match loader.upgrade() {
        Some(loader) => loader.base_dir().to_path_buf(),
        None => env::current_dir().ok()?,
    };
    match resolver::resolve(&base_dir, module_name) {
        Ok(file) => ModuleRecord::from_file(&file).map(Arc::new),
        Err(err) => {
            debug!("Could not locate loaded module {module_name}: {err}");
            None
        }
    }
}

impl LoadInterceptor for Agent {
    fn on_load(
        &self,
        loader: &Arc<ModuleLoader>,
        record: &Arc<ModuleRecord>,
        exports: Exports,
    ) -> Exports {
        let Some(agent) = self.me.upgrade() else {
            return exports;
        };
        self.shimmer.instrument(
            &agent,
            Arc::downgrade(loader),
            &record.name,
            Some(Arc::clone(record)),
            exports,
        )
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("service", &self.config.service)
            .field("running", &self.is_running())
            .finish()
    }
}
