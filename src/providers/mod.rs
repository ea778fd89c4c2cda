//! Execution strategies keyed by runtime kind.

pub mod backend;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::Config;
use crate::models::{RunnerSummary, RuntimeKind};
use crate::sandbox::{self, RunObserver, RunOptions};

pub use backend::BackendProvider;

/// Runs a batch of compiled files for one runtime kind.
#[async_trait]
pub trait TestProvider: Send + Sync {
    /// Stable identifier, used in logs.
    fn id(&self) -> &str;

    async fn run_tests(&self, files: &[PathBuf], observer: Arc<dyn RunObserver>) -> RunnerSummary;
}

/// Plain in-process sandbox execution.
pub struct SandboxProvider {
    options: RunOptions,
}

impl SandboxProvider {
    pub fn new(test_timeout: Option<Duration>) -> Self {
        Self {
            options: RunOptions {
                backend: None,
                test_timeout,
            },
        }
    }
}

#[async_trait]
impl TestProvider for SandboxProvider {
    fn id(&self) -> &str {
        "tandem/sandbox"
    }

    async fn run_tests(&self, files: &[PathBuf], observer: Arc<dyn RunObserver>) -> RunnerSummary {
        sandbox::run(files, &self.options, observer).await
    }
}

pub struct ProviderRegistry {
    providers: HashMap<RuntimeKind, Arc<dyn TestProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Sandbox for frontend; harness-wrapped sandbox for backend unless the
    /// harness is switched off, in which case backend runs in the plain sandbox.
    pub fn from_config(config: &Config) -> Self {
        let timeout = config.runner.test_timeout_ms.map(Duration::from_millis);
        let sandbox: Arc<dyn TestProvider> = Arc::new(SandboxProvider::new(timeout));

        let backend: Arc<dyn TestProvider> = if config.backend.enabled {
            Arc::new(BackendProvider::new(config, timeout))
        } else {
            tracing::info!("backend harness disabled; backend tests run in the plain sandbox");
            Arc::clone(&sandbox)
        };

        let mut registry = Self::new();
        registry.register(RuntimeKind::Frontend, sandbox);
        registry.register(RuntimeKind::Backend, backend);
        registry
    }

    pub fn register(&mut self, runtime: RuntimeKind, provider: Arc<dyn TestProvider>) {
        self.providers.insert(runtime, provider);
    }

    pub fn get(&self, runtime: RuntimeKind) -> Option<Arc<dyn TestProvider>> {
        self.providers.get(&runtime).cloned()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
