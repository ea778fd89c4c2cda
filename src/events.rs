use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{RunnerSummary, RuntimeKind, TestManifest, TestRunResult};

/// Prefix of every primary event line on stdout.
pub const EVENT_PREFIX: &str = "TANDEM_TEST ";
/// Prefix of harness-forwarded notices on stdout.
pub const NOTICE_PREFIX: &str = "TANDEM_MODULE_EVENT ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Runtime a summary covers: one group, or the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryScope {
    Frontend,
    Backend,
    All,
}

impl From<RuntimeKind> for SummaryScope {
    fn from(kind: RuntimeKind) -> Self {
        match kind {
            RuntimeKind::Frontend => SummaryScope::Frontend,
            RuntimeKind::Backend => SummaryScope::Backend,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchPhase {
    Start,
    Complete,
}

/// Events written to the primary stream. Every variant carries the run id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RunnerEvent {
    Start {
        run_id: String,
        manifest: TestManifest,
    },
    Result {
        run_id: String,
        runtime: RuntimeKind,
        module_id: String,
        result: TestRunResult,
    },
    Summary {
        run_id: String,
        runtime: SummaryScope,
        summary: RunnerSummary,
    },
    Log {
        run_id: String,
        level: LogLevel,
        message: String,
    },
    Error {
        run_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    WatchIteration {
        run_id: String,
        iteration: u64,
        phase: WatchPhase,
        changed_files: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<RunnerSummary>,
    },
}

impl RunnerEvent {
    #[cfg(test)]
    pub fn run_id(&self) -> &str {
        match self {
            RunnerEvent::Start { run_id, .. }
            | RunnerEvent::Result { run_id, .. }
            | RunnerEvent::Summary { run_id, .. }
            | RunnerEvent::Log { run_id, .. }
            | RunnerEvent::Error { run_id, .. }
            | RunnerEvent::WatchIteration { run_id, .. } => run_id,
        }
    }
}

/// A `{type, message}` line relayed from a harness-managed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleNotice {
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Event(RunnerEvent),
    Notice(ModuleNotice),
}

impl Output {
    /// Render as a single prefixed line, without the trailing newline.
    pub fn to_line(&self) -> String {
        let (prefix, json) = match self {
            Output::Event(event) => (EVENT_PREFIX, serde_json::to_string(event)),
            Output::Notice(notice) => (NOTICE_PREFIX, serde_json::to_string(notice)),
        };
        match json {
            Ok(json) => format!("{prefix}{json}"),
            Err(err) => format!(
                "{EVENT_PREFIX}{{\"type\":\"error\",\"runId\":\"\",\"message\":\"unserializable event: {err}\"}}"
            ),
        }
    }
}

/// Cheap handle for pushing events onto the output stream.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<Output>,
}

impl Emitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Output>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: RunnerEvent) {
        let _ = self.tx.send(Output::Event(event));
    }

    pub fn notice(&self, level: LogLevel, message: impl Into<String>) {
        let _ = self.tx.send(Output::Notice(ModuleNotice {
            level,
            message: message.into(),
        }));
    }

    pub fn log(&self, run_id: &str, level: LogLevel, message: impl Into<String>) {
        self.emit(RunnerEvent::Log {
            run_id: run_id.to_string(),
            level,
            message: message.into(),
        });
    }

    pub fn error(&self, run_id: &str, error: &anyhow::Error) {
        self.emit(RunnerEvent::Error {
            run_id: run_id.to_string(),
            message: error.to_string(),
            stack: Some(format!("{error:?}")),
        });
    }

    pub fn summary(&self, run_id: &str, runtime: SummaryScope, summary: RunnerSummary) {
        self.emit(RunnerEvent::Summary {
            run_id: run_id.to_string(),
            runtime,
            summary,
        });
    }
}

/// Drain the channel into `out`, one line per output, until every emitter is dropped.
pub fn spawn_writer<W>(mut rx: mpsc::UnboundedReceiver<Output>, mut out: W) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(output) = rx.recv().await {
            let mut line = output.to_line();
            line.push('\n');
            if out.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = out.flush().await;
        }
    })
}

pub fn create_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged_and_camel_cased() {
        let event = RunnerEvent::Result {
            run_id: "r1".into(),
            runtime: RuntimeKind::Backend,
            module_id: "backend/tests/a.test.tdm".into(),
            result: TestRunResult::passed("works", "/ws/build/a.tdb", 3),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "result");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["runtime"], "backend");
        assert_eq!(json["moduleId"], "backend/tests/a.test.tdm");
        assert_eq!(json["result"]["durationMs"], 3);
    }

    #[test]
    fn watch_iteration_omits_missing_summary() {
        let event = RunnerEvent::WatchIteration {
            run_id: "s".into(),
            iteration: 2,
            phase: WatchPhase::Start,
            changed_files: vec!["src/a.tdm".into()],
            summary: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "watch-iteration");
        assert_eq!(json["phase"], "start");
        assert_eq!(json["changedFiles"][0], "src/a.tdm");
        assert!(json.get("summary").is_none());
    }

    #[test]
    fn summary_scope_serializes_all() {
        let event = RunnerEvent::Summary {
            run_id: "r".into(),
            runtime: SummaryScope::All,
            summary: RunnerSummary::empty(),
        };
        let line = Output::Event(event.clone()).to_line();
        assert!(line.starts_with(EVENT_PREFIX));
        let parsed: RunnerEvent = serde_json::from_str(&line[EVENT_PREFIX.len()..]).unwrap();
        assert_eq!(parsed, event);
        assert!(line.contains(r#""runtime":"all""#));
    }

    #[test]
    fn notices_use_their_own_prefix() {
        let line = Output::Notice(ModuleNotice {
            level: LogLevel::Error,
            message: "boom".into(),
        })
        .to_line();
        assert_eq!(line, r#"TANDEM_MODULE_EVENT {"type":"error","message":"boom"}"#);
    }

    #[tokio::test]
    async fn writer_flushes_every_line_then_stops() {
        let (emitter, rx) = Emitter::channel();
        let (client, mut server) = tokio::io::duplex(4096);
        let writer = spawn_writer(rx, client);

        emitter.log("r", LogLevel::Info, "hello");
        emitter.notice(LogLevel::Info, "server up");
        drop(emitter);
        writer.await.unwrap();

        let mut text = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut server, &mut text)
            .await
            .unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(EVENT_PREFIX));
        assert!(lines[1].starts_with(NOTICE_PREFIX));
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(create_run_id(), create_run_id());
    }
}
