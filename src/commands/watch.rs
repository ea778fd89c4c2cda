use std::future::Future;
use std::path::{Component, Path};
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind};
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Sleep;

use crate::config::Config;
use crate::discovery::{SRC_FOLDER, is_excluded_dir};
use crate::events::{Emitter, RunnerEvent, SummaryScope, WatchPhase, create_run_id};
use crate::execution::run_pipeline;
use crate::models::RunnerSummary;
use crate::providers::ProviderRegistry;

/// Watch the source tree and re-run the pipeline after each quiet period.
///
/// Returns 1 once the process is interrupted if any iteration failed or errored,
/// 0 otherwise.
pub async fn run_watch_command(config: Config, emitter: Emitter) -> Result<u8> {
    let debounce = Duration::from_millis(config.watch.debounce_ms);
    let workspace = config.workspace.clone();
    let src_root = config.src_root();
    let watch_root = if src_root.is_dir() {
        src_root
    } else {
        tracing::warn!(path = %src_root.display(), "source root missing; watching the workspace root");
        workspace.clone()
    };

    let (change_tx, change_rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) if is_content_change(&event.kind) => {
                for path in &event.paths {
                    if let Some(relative) = relevant_change(&workspace, path) {
                        let _ = change_tx.send(relative);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "file watcher error"),
        }
    })
    .context("failed to create file watcher")?;
    watcher
        .watch(&watch_root, RecursiveMode::Recursive)
        .with_context(|| format!("failed to watch {}", watch_root.display()))?;
    tracing::info!(path = %watch_root.display(), debounce_ms = debounce.as_millis() as u64, "watching for changes");

    let (batch_tx, batch_rx) = mpsc::unbounded_channel();
    let worker = spawn_worker(WatchSession::new(config, emitter), batch_rx);
    let _ = batch_tx.send(Vec::new());

    schedule(change_rx, debounce, batch_tx, shutdown_signal()).await;

    tracing::info!("shutting down watch session");
    drop(watcher);
    match worker.await {
        Ok(code) => Ok(code),
        Err(err) => {
            tracing::error!(error = %err, "watch worker failed");
            Ok(1)
        }
    }
}

/// Changed relative paths waiting for the debounce timer, in arrival order.
#[derive(Debug, Default)]
struct ChangeQueue {
    paths: Vec<String>,
}

impl ChangeQueue {
    fn push(&mut self, path: String) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.paths)
    }
}

/// Debounce incoming changes into batches until `shutdown` resolves.
///
/// The timer is armed by the first change of a window and never extended; when
/// it fires the queue is handed to the worker as one batch. Shutdown drops any
/// armed timer along with its pending paths.
async fn schedule<S>(
    mut changes: mpsc::UnboundedReceiver<String>,
    debounce: Duration,
    batches: mpsc::UnboundedSender<Vec<String>>,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut queue = ChangeQueue::default();
    let mut timer: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            change = changes.recv() => match change {
                Some(path) => {
                    queue.push(path);
                    if timer.is_none() {
                        timer = Some(Box::pin(tokio::time::sleep(debounce)));
                    }
                }
                None => break,
            },
            _ = fired(&mut timer) => {
                timer = None;
                let batch = queue.drain();
                if !batch.is_empty() && batches.send(batch).is_err() {
                    break;
                }
            }
        }
    }
}

async fn fired(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.await,
        None => std::future::pending().await,
    }
}

/// Runs batches strictly one after another; the channel is the pending chain.
fn spawn_worker(
    mut session: WatchSession,
    mut batches: mpsc::UnboundedReceiver<Vec<String>>,
) -> JoinHandle<u8> {
    tokio::spawn(async move {
        while let Some(changed_files) = batches.recv().await {
            session.run_iteration(changed_files).await;
        }
        session.last_exit
    })
}

struct WatchSession {
    session_id: String,
    iteration: u64,
    config: Config,
    providers: ProviderRegistry,
    emitter: Emitter,
    last_exit: u8,
}

impl WatchSession {
    fn new(config: Config, emitter: Emitter) -> Self {
        Self {
            session_id: create_run_id(),
            iteration: 0,
            providers: ProviderRegistry::from_config(&config),
            config,
            emitter,
            last_exit: 0,
        }
    }

    async fn run_iteration(&mut self, changed_files: Vec<String>) {
        self.iteration += 1;
        let iteration_id = format!("{}-{}", self.session_id, self.iteration);
        self.emit_iteration(WatchPhase::Start, &changed_files, None);

        match run_pipeline(&iteration_id, &self.config, &self.providers, &self.emitter).await {
            Ok(summary) => {
                self.last_exit |= u8::from(summary.has_failures());
                self.emitter
                    .summary(&iteration_id, SummaryScope::All, summary.clone());
                self.emit_iteration(WatchPhase::Complete, &changed_files, Some(summary));
            }
            Err(err) => {
                tracing::error!(iteration = self.iteration, error = %err, "watch iteration failed");
                self.last_exit = 1;
                self.emitter.error(&iteration_id, &err);
                self.emit_iteration(WatchPhase::Complete, &changed_files, None);
            }
        }
    }

    fn emit_iteration(
        &self,
        phase: WatchPhase,
        changed_files: &[String],
        summary: Option<RunnerSummary>,
    ) {
        self.emitter.emit(RunnerEvent::WatchIteration {
            run_id: self.session_id.clone(),
            iteration: self.iteration,
            phase,
            changed_files: changed_files.to_vec(),
            summary,
        });
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Create(CreateKind::Folder) => false,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => true,
        _ => false,
    }
}

/// Workspace-relative `/`-joined path for a change under `src/`, or `None` when
/// the path is outside the source tree or inside a hidden or build-ish directory.
fn relevant_change(workspace: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(workspace).ok()?;
    let segments: Vec<String> = relative
        .components()
        .map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Option<_>>()?;

    let (file, dirs) = segments.split_last()?;
    if dirs.first().map(String::as_str) != Some(SRC_FOLDER) {
        return None;
    }
    if file.starts_with('.') || dirs.iter().any(|d| is_excluded_dir(d)) {
        return None;
    }
    Some(segments.join("/"))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot listen for SIGTERM");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
