//! Source trees with a description file, for driving the CLI

use anyhow::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A temporary project: `src/` holds the inputs, `out/` the manifests
pub struct TestProject {
    _temp: TempDir,
    root: PathBuf,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let root = temp.path().to_path_buf();
        std::fs::create_dir_all(root.join("src"))?;
        std::fs::create_dir_all(root.join("out"))?;
        Ok(Self { _temp: temp, root })
    }

    /// A small test: a script, its data and a description under `src/tests/`
    pub fn with_sample() -> Result<Self> {
        let project = Self::new()?;
        project.write("src/base/lib.txt", "shared library")?;
        project.write("src/tests/run.sh", "#!/bin/sh\nexit 0\n")?;
        project.write("src/tests/data/input.txt", "input")?;
        project.write("src/tests/data/skip.pyc", "bytecode")?;
        project.write(
            "src/tests/sample.isolate",
            r#"{"variables": {"command": ["sh", "run.sh"], "files": ["run.sh", "data/", "../base/lib.txt"]}}"#,
        )?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) -> Result<PathBuf> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn read_json(&self, rel: &str) -> Result<Value> {
        Ok(serde_json::from_slice(&std::fs::read(self.path(rel))?)?)
    }

    /// Sorted file keys of a manifest
    pub fn manifest_files(&self, rel: &str) -> Result<Vec<String>> {
        let manifest = self.read_json(rel)?;
        let mut files: Vec<String> = manifest["files"]
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        files.sort();
        Ok(files)
    }
}
