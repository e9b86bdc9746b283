// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, trace};

use crate::error::LoadError;
use crate::module::exports::Exports;
use crate::module::{resolver, ModuleRecord};

/// Materializes the exports of a file. The loader never runs module code itself.
pub trait ModuleProvider: Send + Sync {
    /// `record` is present when `file` belongs to a package.
    fn provide(&self, file: &Path, record: Option<&ModuleRecord>) -> Result<Exports, LoadError>;
}

impl<F> ModuleProvider for F
where
    F: Fn(&Path, Option<&ModuleRecord>) -> Result<Exports, LoadError> + Send + Sync,
{
    fn provide(&self, file: &Path, record: Option<&ModuleRecord>) -> Result<Exports, LoadError> {
        self(file, record)
    }
}

/// Observes every fresh load of a package entry point before it is cached.
pub trait LoadInterceptor: Send + Sync {
    fn on_load(
        &self,
        loader: &Arc<ModuleLoader>,
        record: &Arc<ModuleRecord>,
        exports: Exports,
    ) -> Exports;
}

/// The host's module pipeline: resolve, materialize, intercept, cache.
pub struct ModuleLoader {
    provider: Arc<dyn ModuleProvider>,
    base_dir: PathBuf,
    cache: Mutex<HashMap<PathBuf, Exports>>,
    interceptor: RwLock<Option<Arc<dyn LoadInterceptor>>>,
}

impl ModuleLoader {
    /// A loader resolving bare requires from the process working directory.
    pub fn new(provider: Arc<dyn ModuleProvider>) -> Arc<Self> {
        let base_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_base_dir(provider, base_dir)
    }

    pub fn with_base_dir(provider: Arc<dyn ModuleProvider>, base_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            base_dir: base_dir.into(),
            cache: Mutex::new(HashMap::new()),
            interceptor: RwLock::new(None),
        })
    }

    /// Directory the application's own requires resolve from.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn require(self: &Arc<Self>, specifier: &str) -> Result<Exports, LoadError> {
        self.require_from(&self.base_dir, specifier)
    }

    /// Resolves `specifier` from `from_dir` and loads it.
    pub fn require_from(
        self: &Arc<Self>,
        from_dir: &Path,
        specifier: &str,
    ) -> Result<Exports, LoadError> {
        let file = resolver::resolve(from_dir, specifier)?;
        self.load_file(&file)
    }

    pub fn load_file(self: &Arc<Self>, file: &Path) -> Result<Exports, LoadError> {
        let file = fs::canonicalize(file).map_err(|source| LoadError::Io {
            path: file.to_path_buf(),
            source,
        })?;

        if let Some(cached) = self.cache_lock().get(&file) {
            trace!("Module cache hit for {}", file.display());
            return Ok(cached.clone());
        }

        let record = ModuleRecord::from_file(&file).map(Arc::new);
        let mut exports = self.provider.provide(&file, record.as_deref())?;
        let mut intercepted = false;

        if let Some(record) = &record {
            exports.set_record(Arc::clone(record));
            if record.is_entry_point {
                if let Some(interceptor) = self.interceptor() {
                    debug!(
                        "Intercepting load of {}@{} from {}",
                        record.name,
                        record.version,
                        record.root.display()
                    );
                    exports = interceptor.on_load(self, record, exports);
                    intercepted = true;
                }
            }
        }

        // A hook may load its own entry point again, caching the bare exports before the
        // intercepted ones are ready. Intercepted exports always replace that entry; otherwise
        // the first completed load stays authoritative.
        let mut cache = self.cache_lock();
        if intercepted {
            cache.insert(file, exports.clone());
            return Ok(exports);
        }
        Ok(cache.entry(file).or_insert(exports).clone())
    }

    pub fn set_interceptor(&self, interceptor: Arc<dyn LoadInterceptor>) {
        *self
            .interceptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(interceptor);
    }

    pub fn clear_interceptor(&self) {
        *self
            .interceptor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_interceptor(&self) -> bool {
        self.interceptor().is_some()
    }

    pub fn is_cached(&self, file: &Path) -> bool {
        fs::canonicalize(file)
            .map(|file| self.cache_lock().contains_key(&file))
            .unwrap_or(false)
    }

    pub fn clear_cache(&self) {
        self.cache_lock().clear();
    }

    /// Drops cached modules matching `predicate`, returning how many were evicted.
    pub fn evict<P>(&self, predicate: P) -> usize
    where
        P: Fn(&Path, &Exports) -> bool,
    {
        let mut cache = self.cache_lock();
        let before = cache.len();
        cache.retain(|file, exports| !predicate(file, exports));
        before - cache.len()
    }

    fn interceptor(&self) -> Option<Arc<dyn LoadInterceptor>> {
        self.interceptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cache_lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Exports>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
