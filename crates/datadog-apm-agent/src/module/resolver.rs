// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk module resolution.
//!
//! Packages live in `node_modules/<name>` directories and describe themselves with a
//! `package.json` manifest. Resolution only reads the filesystem and manifests; it never
//! materializes a module.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::LoadError;

pub const MODULES_DIR: &str = "node_modules";
pub const MANIFEST_FILE: &str = "package.json";
pub const DEFAULT_ENTRY: &str = "index.js";
pub const UNKNOWN_VERSION: &str = "unknown";

const EXTENSIONS: [&str; 2] = ["js", "json"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub main: Option<String>,
}

pub fn read_manifest(root: &Path) -> Result<Manifest, LoadError> {
    let path = root.join(MANIFEST_FILE);
    let contents = fs::read_to_string(&path).map_err(|source| LoadError::Io {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| LoadError::Manifest { path, source })
}

/// Resolves `specifier` as seen from `from_dir` to a canonical file path.
pub fn resolve(from_dir: &Path, specifier: &str) -> Result<PathBuf, LoadError> {
    let found = if is_path_specifier(specifier) {
        resolve_candidate(&from_dir.join(specifier))
    } else {
        resolve_bare(from_dir, specifier)
    };

    let file = found.ok_or_else(|| LoadError::NotFound {
        specifier: specifier.to_string(),
        from: from_dir.to_path_buf(),
    })?;
    fs::canonicalize(&file).map_err(|source| LoadError::Io { path: file, source })
}

/// Nearest directory above `file` holding a manifest.
pub fn find_module_root(file: &Path) -> Option<PathBuf> {
    file.parent()?
        .ancestors()
        .find(|dir| dir.join(MANIFEST_FILE).is_file())
        .map(Path::to_path_buf)
}

/// The file a package directory resolves to when required by name.
pub fn package_entry(root: &Path, manifest: &Manifest) -> Option<PathBuf> {
    let entry = manifest
        .main
        .as_deref()
        .and_then(|main| {
            let main = root.join(main);
            resolve_file(&main).or_else(|| resolve_file(&main.join(DEFAULT_ENTRY)))
        })
        .or_else(|| resolve_file(&root.join(DEFAULT_ENTRY)))?;
    fs::canonicalize(entry).ok()
}

fn is_path_specifier(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || Path::new(specifier).is_absolute()
}

fn resolve_bare(from_dir: &Path, specifier: &str) -> Option<PathBuf> {
    from_dir
        .ancestors()
        .filter(|dir| dir.file_name().map_or(true, |name| name != MODULES_DIR))
        .find_map(|dir| resolve_candidate(&dir.join(MODULES_DIR).join(specifier)))
}

fn resolve_candidate(path: &Path) -> Option<PathBuf> {
    if let Some(file) = resolve_file(path) {
        return Some(file);
    }
    if !path.is_dir() {
        return None;
    }
    let manifest = read_manifest(path).unwrap_or_default();
    package_entry(path, &manifest)
}

fn resolve_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    EXTENSIONS.iter().find_map(|extension| {
        let mut with_extension = OsString::from(path.as_os_str());
        with_extension.push(".");
        with_extension.push(extension);
        let candidate = PathBuf::from(with_extension);
        candidate.is_file().then_some(candidate)
    })
}
