use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which execution strategy a test module needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Frontend,
    Backend,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Frontend => "frontend",
            RuntimeKind::Backend => "backend",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestModule {
    /// `/`-joined path relative to the source root; unique within a manifest.
    pub id: String,
    pub runtime: RuntimeKind,
    pub source_path: PathBuf,
    pub compiled_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestManifest {
    pub workspace_root: PathBuf,
    pub generated_at: String,
    /// Sorted by id.
    pub modules: Vec<TestModule>,
}

impl TestManifest {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Group modules by runtime, keeping groups in order of first appearance.
    pub fn group_by_runtime(&self) -> Vec<(RuntimeKind, Vec<TestModule>)> {
        let mut groups: Vec<(RuntimeKind, Vec<TestModule>)> = Vec::new();
        for module in &self.modules {
            match groups.iter_mut().find(|(kind, _)| *kind == module.runtime) {
                Some((_, list)) => list.push(module.clone()),
                None => groups.push((module.runtime, vec![module.clone()])),
            }
        }
        groups
    }
}
