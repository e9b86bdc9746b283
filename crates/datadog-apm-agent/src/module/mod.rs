// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host module pipeline: export values, on-disk resolution and the caching loader that the
//! agent intercepts.

use std::path::{Path, PathBuf};

use tracing::debug;

pub mod exports;
pub mod loader;
pub mod resolver;
pub mod stream;

pub use exports::{
    BoxFuture, CallMode, CallResult, Callback, Completion, Export, Exports, Function, Invocation,
};
pub use loader::{LoadInterceptor, ModuleLoader, ModuleProvider};
pub use stream::{ChunkStream, StreamSummary};

/// Distinguishes physically distinct copies of a module that share a name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleIdentity {
    pub root: PathBuf,
    pub version: String,
}

impl ModuleIdentity {
    pub fn new(root: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            version: version.into(),
        }
    }

    /// Identity for a module handed to the agent after it was already loaded.
    pub(crate) fn synthetic(module_name: &str) -> Self {
        Self::new(
            PathBuf::from("<loaded>").join(module_name),
            resolver::UNKNOWN_VERSION,
        )
    }
}

/// What the loader learned about the package a file belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub name: String,
    pub version: String,
    /// Nearest directory above the file that holds a package manifest.
    pub root: PathBuf,
    /// Canonical path of the loaded file.
    pub file: PathBuf,
    /// Whether `file` is the package's entry point rather than an internal file.
    pub is_entry_point: bool,
}

impl ModuleRecord {
    /// Builds the record for a canonical file path, or `None` when the file is not inside a
    /// package. An unreadable manifest yields an unversioned record.
    pub fn from_file(file: &Path) -> Option<Self> {
        let root = resolver::find_module_root(file)?;
        let manifest = resolver::read_manifest(&root).unwrap_or_else(|err| {
            debug!("Treating {} as unversioned: {err}", root.display());
            resolver::Manifest::default()
        });
        let name = manifest
            .name
            .clone()
            .or_else(|| {
                root.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        let version = manifest
            .version
            .clone()
            .unwrap_or_else(|| resolver::UNKNOWN_VERSION.to_string());
        let is_entry_point = resolver::package_entry(&root, &manifest).as_deref() == Some(file);

        Some(Self {
            name,
            version,
            root,
            file: file.to_path_buf(),
            is_entry_point,
        })
    }

    pub fn identity(&self) -> ModuleIdentity {
        ModuleIdentity::new(self.root.clone(), self.version.clone())
    }

    /// Leading numeric component of the version, used for usage signals.
    pub fn major_version(&self) -> &str {
        self.version.split('.').next().unwrap_or(&self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(version: &str) -> ModuleRecord {
        ModuleRecord {
            name: "pkg".to_string(),
            version: version.to_string(),
            root: PathBuf::from("/app/node_modules/pkg"),
            file: PathBuf::from("/app/node_modules/pkg/index.js"),
            is_entry_point: true,
        }
    }

    #[test]
    fn test_major_version() {
        assert_eq!(record("3.0.0").major_version(), "3");
        assert_eq!(record("10.2").major_version(), "10");
        assert_eq!(record("unknown").major_version(), "unknown");
    }

    #[test]
    fn test_malformed_manifest_gives_unversioned_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("node_modules/broken");
        std::fs::create_dir_all(&root).expect("create dirs");
        std::fs::write(root.join("package.json"), "{not json").expect("write manifest");
        std::fs::write(root.join("index.js"), "").expect("write entry");
        let file = std::fs::canonicalize(root.join("index.js")).expect("canonical");

        let record = ModuleRecord::from_file(&file).expect("record");
        assert_eq!(record.name, "broken");
        assert_eq!(record.version, resolver::UNKNOWN_VERSION);
        assert!(record.is_entry_point);
    }

    #[test]
    fn test_identity_is_path_and_version() {
        let a = record("1.0.0").identity();
        let mut other = record("1.0.0");
        other.root = PathBuf::from("/app/node_modules/sub/node_modules/pkg");
        assert_ne!(a, other.identity());
        assert_eq!(a, record("1.0.0").identity());
        assert_ne!(a, record("2.0.0").identity());
    }
}
