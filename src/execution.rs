use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::discovery::discover_test_manifest;
use crate::events::{Emitter, LogLevel, RunnerEvent, SummaryScope};
use crate::filter::{apply_runtime_filter, describe_runtime_filter, normalize_runtime_filter};
use crate::models::{RunnerSummary, RuntimeKind, TestManifest, TestRunResult};
use crate::providers::ProviderRegistry;
use crate::sandbox::RunObserver;

pub const NO_TESTS_MESSAGE: &str = "No tests found under src/**/tests/.";

/// Turns progress from one runtime group into events on the primary stream.
struct GroupReporter {
    run_id: String,
    runtime: RuntimeKind,
    emitter: Emitter,
    /// Compiled path (as reported in results) -> module id.
    modules: HashMap<String, String>,
}

impl GroupReporter {
    fn module_id(&self, file: &str) -> String {
        self.modules
            .get(file)
            .cloned()
            .unwrap_or_else(|| file.to_string())
    }
}

impl RunObserver for GroupReporter {
    fn on_result(&self, result: &TestRunResult) {
        self.emitter.emit(RunnerEvent::Result {
            run_id: self.run_id.clone(),
            runtime: self.runtime,
            module_id: self.module_id(&result.file),
            result: result.clone(),
        });
    }

    fn on_console(&self, file: &Path, message: &str) {
        let module = self.module_id(&file.display().to_string());
        self.emitter
            .log(&self.run_id, LogLevel::Info, format!("[{module}] {message}"));
    }

    fn on_notice(&self, level: LogLevel, message: &str) {
        self.emitter.notice(level, message);
    }
}

/// Run every runtime group of `manifest` through its provider, emitting per-test
/// results as they arrive and a summary per group. Groups run in manifest order.
pub async fn execute_run(
    run_id: &str,
    manifest: &TestManifest,
    providers: &ProviderRegistry,
    emitter: &Emitter,
) -> RunnerSummary {
    let mut overall = RunnerSummary::empty();

    for (runtime, modules) in manifest.group_by_runtime() {
        let Some(provider) = providers.get(runtime) else {
            let noun = if modules.len() == 1 { "test" } else { "tests" };
            emitter.log(
                run_id,
                LogLevel::Warn,
                format!(
                    "Skipping {} {noun} for unsupported runtime '{runtime}'.",
                    modules.len()
                ),
            );
            continue;
        };

        let mut files = Vec::new();
        let mut by_file = HashMap::new();
        for module in modules {
            let Some(compiled) = module.compiled_path else {
                emitter.log(
                    run_id,
                    LogLevel::Warn,
                    format!("Test {} has no compiled output; skipping.", module.id),
                );
                continue;
            };
            by_file.insert(compiled.display().to_string(), module.id);
            files.push(compiled);
        }

        let summary = if files.is_empty() {
            RunnerSummary::empty()
        } else {
            tracing::debug!(%runtime, provider = provider.id(), files = files.len(), "running group");
            let reporter = Arc::new(GroupReporter {
                run_id: run_id.to_string(),
                runtime,
                emitter: emitter.clone(),
                modules: by_file,
            });
            provider.run_tests(&files, reporter).await
        };

        emitter.summary(run_id, SummaryScope::from(runtime), summary.clone());
        overall = overall.merge(summary);
    }

    overall
}

/// One full discover -> filter -> execute pass. Emits `start`, then results and
/// group summaries; the caller emits the overall summary.
pub async fn run_pipeline(
    run_id: &str,
    config: &Config,
    providers: &ProviderRegistry,
    emitter: &Emitter,
) -> Result<RunnerSummary> {
    let manifest = discover_test_manifest(&config.workspace, &config.discovery.ignore).await?;

    let runtime = normalize_runtime_filter(config.runner.runtime.as_deref());
    let before = manifest.modules.len();
    let manifest = apply_runtime_filter(manifest, runtime);

    emitter.emit(RunnerEvent::Start {
        run_id: run_id.to_string(),
        manifest: manifest.clone(),
    });
    if let Some(message) = describe_runtime_filter(runtime, before, manifest.modules.len()) {
        emitter.log(run_id, LogLevel::Info, message);
    }

    if manifest.is_empty() {
        emitter.log(run_id, LogLevel::Info, NO_TESTS_MESSAGE);
        return Ok(RunnerSummary::empty());
    }

    Ok(execute_run(run_id, &manifest, providers, emitter).await)
}
