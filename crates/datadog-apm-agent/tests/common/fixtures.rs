// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! On-disk package trees for loader tests

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use datadog_apm_agent::module::ModuleLoader;
use serde_json::json;
use tempfile::TempDir;

use super::mocks;

pub const OUTER_VERSION: &str = "3.0.0";
pub const NESTED_VERSION: &str = "1.0.0";
pub const OPENAI_VERSION: &str = "4.20.0";
pub const KNEX_VERSION: &str = "1.0.1";
pub const MONGODB_VERSION: &str = "6.3.0";

/// An application directory with:
///
/// ```text
/// node_modules/customTestPackage            3.0.0
/// node_modules/subPkg/node_modules/customTestPackage   1.0.0
/// node_modules/openai                       4.20.0
/// node_modules/knex                         1.0.1
/// node_modules/mongodb                      6.3.0 (with lib/collection.js)
/// ```
pub struct AppFixture {
    dir: TempDir,
}

#[allow(dead_code)]
impl AppFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let modules = dir.path().join("node_modules");

        write_package(&modules.join("customTestPackage"), "customTestPackage", OUTER_VERSION);
        write_file(&modules.join("customTestPackage/custom.js"), "");

        write_package(&modules.join("subPkg"), "subPkg", "0.1.0");
        let nested = modules.join("subPkg/node_modules/customTestPackage");
        write_package(&nested, "customTestPackage", NESTED_VERSION);
        write_file(&nested.join("custom.js"), "");

        write_package(&modules.join("openai"), "openai", OPENAI_VERSION);
        write_package(&modules.join("knex"), "knex", KNEX_VERSION);
        write_package(&modules.join("mongodb"), "mongodb", MONGODB_VERSION);
        write_file(&modules.join("mongodb/lib/collection.js"), "");

        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn outer_package(&self) -> PathBuf {
        self.root().join("node_modules/customTestPackage")
    }

    pub fn sub_package(&self) -> PathBuf {
        self.root().join("node_modules/subPkg")
    }

    pub fn nested_package(&self) -> PathBuf {
        self.sub_package().join("node_modules/customTestPackage")
    }

    pub fn loader(&self) -> Arc<ModuleLoader> {
        ModuleLoader::with_base_dir(Arc::new(mocks::provide), self.root())
    }
}

pub fn write_package(root: &Path, name: &str, version: &str) {
    let manifest = json!({"name": name, "version": version, "main": "index.js"});
    write_file(&root.join("package.json"), &manifest.to_string());
    write_file(&root.join("index.js"), "");
}

pub fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create fixture dir");
    }
    fs::write(path, contents).expect("Failed to write fixture file");
}
