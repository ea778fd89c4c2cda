use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::TestProvider;
use crate::backend::{BackendHarness, HarnessSettings};
use crate::config::Config;
use crate::models::{RunnerSummary, TestRunResult};
use crate::sandbox::{self, RunObserver, RunOptions};

pub const HARNESS_TEST: &str = "[backend test harness]";
pub const HARNESS_FILE: &str = "backend-server";

/// Sandbox execution wrapped in a backend server lifecycle.
pub struct BackendProvider {
    /// Resolution errors surface as a harness failure when a batch runs.
    settings: Result<HarnessSettings, String>,
    test_timeout: Option<Duration>,
}

impl BackendProvider {
    pub fn new(config: &Config, test_timeout: Option<Duration>) -> Self {
        Self {
            settings: HarnessSettings::resolve(config).map_err(|e| format!("{e:#}")),
            test_timeout,
        }
    }

    #[cfg(test)]
    pub fn with_settings(settings: HarnessSettings, test_timeout: Option<Duration>) -> Self {
        Self {
            settings: Ok(settings),
            test_timeout,
        }
    }

    fn plain_options(&self) -> RunOptions {
        RunOptions {
            backend: None,
            test_timeout: self.test_timeout,
        }
    }
}

#[async_trait]
impl TestProvider for BackendProvider {
    fn id(&self) -> &str {
        "tandem/backend"
    }

    async fn run_tests(&self, files: &[PathBuf], observer: Arc<dyn RunObserver>) -> RunnerSummary {
        if files.is_empty() {
            return sandbox::run(files, &self.plain_options(), observer).await;
        }

        let settings = match &self.settings {
            Ok(settings) => settings,
            Err(message) => return harness_failure(message, observer.as_ref()),
        };

        let mut harness = match BackendHarness::start(settings, Arc::clone(&observer)).await {
            Ok(harness) => harness,
            Err(err) => return harness_failure(&err.to_string(), observer.as_ref()),
        };

        let options = RunOptions {
            backend: harness.context(),
            test_timeout: self.test_timeout,
        };
        // Test failures and panics are captured per test, so this always returns.
        let summary = sandbox::run(files, &options, observer).await;
        harness.shutdown().await;
        summary
    }
}

fn harness_failure(message: &str, observer: &dyn RunObserver) -> RunnerSummary {
    tracing::error!("[backend-tests] {message}");
    let result = TestRunResult::failed(HARNESS_TEST, HARNESS_FILE, message, 0);
    observer.on_result(&result);
    RunnerSummary::from_results(vec![result], 0)
}
