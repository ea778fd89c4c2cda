use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::port::find_open_port;
use super::{BackendTestContext, HarnessSettings};
use crate::events::LogLevel;
use crate::sandbox::RunObserver;

/// How long a terminated server gets to exit before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub const READY_TIMEOUT_NOTICE: &str = "Backend test server readiness timed out.";

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("backend entry not found at {}", .0.display())]
    EntryMissing(PathBuf),
    #[error("no open port among {attempts} attempt(s) starting at {start}")]
    NoPort { start: u16, attempts: u32 },
    #[error("failed to launch backend server {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("backend server exited before it was ready ({status})")]
    ExitedEarly { status: String },
    #[error("backend server was not ready within {0}ms")]
    ReadyTimeout(u64),
    #[error("invalid backend base url `{0}`")]
    InvalidBaseUrl(String),
}

/// Guard that kills the server (and its process group) if the harness is dropped
/// without an orderly shutdown.
struct ChildGuard {
    child: Option<Child>,
    #[cfg(unix)]
    pgid: Option<u32>,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        #[cfg(unix)]
        let pgid = child.id();
        Self {
            child: Some(child),
            #[cfg(unix)]
            pgid,
        }
    }

    fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) {
        if let Some(pgid) = self.pgid {
            unsafe { libc::kill(-(pgid as libc::pid_t), signal) };
        }
    }

    /// Ask the server to stop, wait up to `grace`, then kill it. Safe to call twice.
    async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            #[cfg(unix)]
            {
                self.pgid = None;
            }
            return;
        }

        #[cfg(unix)]
        self.signal(libc::SIGTERM);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => tracing::debug!(?status, "backend server stopped"),
            Err(_) => {
                tracing::warn!(grace_ms = grace.as_millis() as u64, "backend server ignored SIGTERM; killing");
                #[cfg(unix)]
                self.signal(libc::SIGKILL);
                let _ = child.kill().await;
            }
        }
        #[cfg(unix)]
        {
            self.pgid = None;
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.child.is_none() {
            return;
        }
        #[cfg(unix)]
        self.signal(libc::SIGKILL);
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

/// A running backend server owned for the duration of one batch.
pub struct BackendHarness {
    guard: ChildGuard,
    context: Option<Arc<BackendTestContext>>,
    forwarders: Vec<JoinHandle<()>>,
}

impl BackendHarness {
    /// Launch the server and wait for it to report readiness.
    ///
    /// On any failure after the process was spawned, the process is stopped and
    /// the output forwarders are detached before the error is returned.
    pub async fn start(
        settings: &HarnessSettings,
        observer: Arc<dyn RunObserver>,
    ) -> Result<Self, HarnessError> {
        if !tokio::fs::try_exists(&settings.entry).await.unwrap_or(false) {
            return Err(HarnessError::EntryMissing(settings.entry.clone()));
        }

        let port = find_open_port(settings.base_port, settings.port_attempts).await?;
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{port}"));
        let parsed_url =
            Url::parse(&base_url).map_err(|_| HarnessError::InvalidBaseUrl(base_url.clone()))?;

        let env = BTreeMap::from([
            ("PORT".to_string(), port.to_string()),
            ("API_BASE_URL".to_string(), base_url),
            (
                "WORKSPACE_ROOT".to_string(),
                settings.workspace.display().to_string(),
            ),
            ("TANDEM_BACKEND_TEST_RUN".to_string(), "1".to_string()),
        ]);

        let mut cmd = launch_command(settings);
        cmd.envs(&env)
            .current_dir(&settings.workspace)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        // Own process group, so stopping the server also stops anything it forks.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.as_std_mut().process_group(0);
        }

        tracing::info!(
            entry = %settings.entry.display(),
            build_root = %settings.build_root.display(),
            port,
            "starting backend server"
        );
        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            program: settings.entry.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut harness = Self {
            guard: ChildGuard::new(child),
            context: None,
            forwarders: Vec::new(),
        };

        let markers: Arc<[String]> = settings.ready_markers.clone().into();
        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = stdout {
            harness.forwarders.push(spawn_forwarder(
                stdout,
                LogLevel::Info,
                Arc::clone(&markers),
                ready_tx.clone(),
                Arc::clone(&observer),
            ));
        }
        if let Some(stderr) = stderr {
            harness.forwarders.push(spawn_forwarder(
                stderr,
                LogLevel::Error,
                markers,
                ready_tx.clone(),
                Arc::clone(&observer),
            ));
        }
        drop(ready_tx);

        let waited = match harness.guard.child_mut() {
            Some(child) => {
                tokio::time::timeout(settings.ready_timeout, wait_ready(child, &mut ready_rx)).await
            }
            None => Ok(Err(HarnessError::ExitedEarly {
                status: "not running".into(),
            })),
        };
        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(_) => {
                observer.on_notice(LogLevel::Error, READY_TIMEOUT_NOTICE);
                Err(HarnessError::ReadyTimeout(
                    settings.ready_timeout.as_millis() as u64,
                ))
            }
        };
        if let Err(err) = outcome {
            harness.shutdown().await;
            return Err(err);
        }

        let manifest = load_manifest(&settings.manifest).await;
        let context = BackendTestContext::new(parsed_url, port, manifest, env);
        tracing::info!(port = context.port(), base_url = %context.base_url(), "backend server ready");
        harness.context = Some(Arc::new(context));
        Ok(harness)
    }

    /// Context to hand to tests while the server is up; `None` after shutdown.
    pub fn context(&self) -> Option<Arc<BackendTestContext>> {
        self.context.clone()
    }

    /// Unpublish the context, stop the server and detach the output forwarders.
    /// Calling this more than once is a no-op.
    pub async fn shutdown(&mut self) {
        self.context = None;
        self.guard.terminate(STOP_GRACE).await;
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

fn launch_command(settings: &HarnessSettings) -> Command {
    match settings.command.split_first() {
        Some((program, args)) => {
            let mut cmd = Command::new(program);
            cmd.args(args).arg(&settings.entry);
            cmd
        }
        None => Command::new(&settings.entry),
    }
}

async fn wait_ready(
    child: &mut Child,
    ready: &mut mpsc::UnboundedReceiver<()>,
) -> Result<(), HarnessError> {
    tokio::select! {
        signalled = ready.recv() => {
            if signalled.is_some() {
                return Ok(());
            }
            // Both streams closed without a marker; the exit status tells why.
            let status = child.wait().await;
            Err(exited(status))
        }
        status = child.wait() => Err(exited(status)),
    }
}

fn exited(status: io::Result<std::process::ExitStatus>) -> HarnessError {
    HarnessError::ExitedEarly {
        status: match status {
            Ok(status) => status.to_string(),
            Err(err) => err.to_string(),
        },
    }
}

/// Relay every non-empty line as a notice, signalling once when a marker shows up.
/// Keeps draining after readiness so the server never blocks on a full pipe.
fn spawn_forwarder<R>(
    stream: R,
    level: LogLevel,
    markers: Arc<[String]>,
    ready: mpsc::UnboundedSender<()>,
    observer: Arc<dyn RunObserver>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut signalled = false;
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            observer.on_notice(level, line);
            if !signalled && is_ready_line(line, &markers) {
                signalled = true;
                let _ = ready.send(());
            }
        }
    })
}

pub fn is_ready_line(line: &str, markers: &[String]) -> bool {
    if markers.is_empty() {
        return !line.trim().is_empty();
    }
    markers.iter().any(|marker| line.contains(marker.as_str()))
}

/// Best-effort: a missing or unparsable manifest is `None`.
async fn load_manifest(path: &Path) -> Option<Value> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable backend manifest");
            None
        }
    }
}
