// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The single place where wrapped exports are tracked.
//!
//! Every replacement made through a [`Shim`](super::Shim) is recorded against the module
//! identity and export path it touched, together with the original function. That record makes
//! wrapping idempotent and lets a failed instrumentation attempt restore what it replaced.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::module::{Exports, Function, ModuleIdentity};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WrapKey {
    pub identity: ModuleIdentity,
    pub path: String,
}

/// Position in a module's wrap history, used to roll back one instrumentation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

#[derive(Default)]
pub struct WrapperRegistry {
    // Originals per identity, in wrap order.
    wrapped: Mutex<HashMap<ModuleIdentity, Vec<(String, Function)>>>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_wrapped(&self, identity: &ModuleIdentity, path: &str) -> bool {
        self.lock()
            .get(identity)
            .is_some_and(|entries| entries.iter().any(|(wrapped, _)| wrapped == path))
    }

    /// Records `original` as replaced at `path`. Returns `false` if the path was already
    /// wrapped for this identity.
    pub fn insert(&self, identity: &ModuleIdentity, path: &str, original: Function) -> bool {
        let mut wrapped = self.lock();
        let entries = wrapped.entry(identity.clone()).or_default();
        if entries.iter().any(|(wrapped, _)| wrapped == path) {
            return false;
        }
        entries.push((path.to_string(), original));
        true
    }

    /// Forgets the wrap at `path`, returning the original it replaced.
    pub fn remove(&self, identity: &ModuleIdentity, path: &str) -> Option<Function> {
        let mut wrapped = self.lock();
        let entries = wrapped.get_mut(identity)?;
        let index = entries.iter().position(|(wrapped, _)| wrapped == path)?;
        let (_, original) = entries.remove(index);
        if entries.is_empty() {
            wrapped.remove(identity);
        }
        Some(original)
    }

    pub fn checkpoint(&self, identity: &ModuleIdentity) -> Checkpoint {
        Checkpoint(self.lock().get(identity).map_or(0, Vec::len))
    }

    /// Restores into `exports` every original wrapped for `identity` after `checkpoint`, most
    /// recent first. Returns how many wraps were undone.
    pub fn rollback(
        &self,
        identity: &ModuleIdentity,
        checkpoint: Checkpoint,
        exports: &mut Exports,
    ) -> usize {
        let undone = {
            let mut wrapped = self.lock();
            let Some(entries) = wrapped.get_mut(identity) else {
                return 0;
            };
            let undone = entries.split_off(checkpoint.0.min(entries.len()));
            if entries.is_empty() {
                wrapped.remove(identity);
            }
            undone
        };

        for (path, original) in undone.iter().rev() {
            debug!(
                "Restoring original {} for {}",
                path,
                identity.root.display()
            );
            exports.replace_function(path, original.clone());
        }
        undone.len()
    }

    pub fn keys(&self) -> Vec<WrapKey> {
        let wrapped = self.lock();
        let mut keys: Vec<WrapKey> = wrapped
            .iter()
            .flat_map(|(identity, entries)| {
                entries.iter().map(|(path, _)| WrapKey {
                    identity: identity.clone(),
                    path: path.clone(),
                })
            })
            .collect();
        keys.sort_by(|a, b| (&a.identity, &a.path).cmp(&(&b.identity, &b.path)));
        keys
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ModuleIdentity, Vec<(String, Function)>>> {
        self.wrapped.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
