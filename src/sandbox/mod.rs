//! In-process execution engine for compiled test bundles.
//!
//! Each bundle is evaluated in its own sandbox: a fresh [`Registry`], a console
//! scoped to the file, and a resolver that only knows the testing package and
//! relative helper bundles. Evaluation tries the script strategy first and falls
//! back to the module strategy only on [`EvalError::WrongModuleStyle`]. Files run
//! strictly one after another, so a registry is always consumed before the next
//! file starts registering.

pub mod assert;
pub mod bundle;
pub mod host;
pub mod registry;

use std::collections::HashSet;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use thiserror::Error;

use crate::backend::BackendTestContext;
use crate::discovery::BUILD_EXTENSION;
use crate::events::LogLevel;
use crate::models::{RunnerSummary, TestRunResult};

use bundle::{ModuleDocument, ScriptError, Statement};
use host::{Console, TestFailure, TestScope};
pub use registry::{RegisteredTest, Registry};

/// Name under which bundles import the in-process bindings.
pub const TESTING_PACKAGE: &str = "tandem";

pub const MISSING_FILE_TEST: &str = "[missing compiled file]";
pub const EVALUATION_TEST: &str = "[module evaluation]";

/// Receives progress while a batch executes.
pub trait RunObserver: Send + Sync {
    fn on_result(&self, result: &TestRunResult);

    fn on_console(&self, _file: &Path, _message: &str) {}

    fn on_notice(&self, _level: LogLevel, _message: &str) {}
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Backend context threaded into every test of the batch.
    pub backend: Option<Arc<BackendTestContext>>,
    pub test_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is a module-style bundle", path.display())]
    WrongModuleStyle { path: PathBuf },
    #[error("{}:{line}: {message}", path.display())]
    Syntax {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("invalid module document {}: {source}", path.display())]
    Document {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cannot resolve module '{specifier}' from {}", from.display())]
    Unresolved { specifier: String, from: PathBuf },
    #[error("{}:{line}: {failure}", path.display())]
    Thrown {
        path: PathBuf,
        line: usize,
        failure: TestFailure,
    },
}

impl EvalError {
    fn read(path: &Path, source: io::Error) -> Self {
        EvalError::Read {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Run every file in order, reporting each result to `observer` as soon as it exists.
pub async fn run(
    files: &[PathBuf],
    options: &RunOptions,
    observer: Arc<dyn RunObserver>,
) -> RunnerSummary {
    let start = Instant::now();
    let mut results = Vec::new();
    let mut record = |result: TestRunResult| {
        observer.on_result(&result);
        results.push(result);
    };

    for file in files {
        let display = file.display().to_string();

        if !tokio::fs::try_exists(file).await.unwrap_or(false) {
            record(TestRunResult::failed(
                MISSING_FILE_TEST,
                &display,
                "Compiled file not found",
                0,
            ));
            continue;
        }

        let console = Console::new(file.clone(), Arc::clone(&observer));
        let registry = match evaluate(file, &console).await {
            Ok(registry) => registry,
            Err(err) => {
                tracing::debug!(file = %file.display(), error = %err, "module evaluation failed");
                record(TestRunResult::failed(EVALUATION_TEST, &display, err.to_string(), 0));
                continue;
            }
        };

        for test in registry.into_tests() {
            let scope = TestScope::new(console.clone(), options.backend.clone());
            record(run_single_test(test, scope, &display, options.test_timeout).await);
        }
    }

    RunnerSummary::from_results(results, elapsed_ms(start))
}

/// Evaluate a bundle, falling back to the module strategy for module-style files.
pub async fn evaluate(file: &Path, console: &Console) -> Result<Registry, EvalError> {
    match evaluate_script(file, console) {
        Err(EvalError::WrongModuleStyle { .. }) => evaluate_module(file, console).await,
        other => other,
    }
}

/// Synchronous strategy: parse and execute a script-style bundle.
pub fn evaluate_script(file: &Path, console: &Console) -> Result<Registry, EvalError> {
    let source = std::fs::read_to_string(file).map_err(|e| EvalError::read(file, e))?;
    let mut sandbox = Sandbox::new(file, console);
    sandbox.run_script(file, &source)?;
    Ok(sandbox.registry)
}

/// Asynchronous strategy: re-read the bundle from disk and load it as a module document.
pub async fn evaluate_module(file: &Path, console: &Console) -> Result<Registry, EvalError> {
    let source = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| EvalError::read(file, e))?;
    let document = parse_document(file, &source)?;
    let mut sandbox = Sandbox::new(file, console);
    sandbox.run_document(file, document)?;
    Ok(sandbox.registry)
}

fn parse_document(path: &Path, source: &str) -> Result<ModuleDocument, EvalError> {
    bundle::parse_module(source).map_err(|source| EvalError::Document {
        path: path.to_path_buf(),
        source,
    })
}

/// Isolated evaluation context for one bundle and the helpers it imports.
struct Sandbox<'a> {
    console: &'a Console,
    registry: Registry,
    loaded: HashSet<PathBuf>,
}

impl<'a> Sandbox<'a> {
    fn new(file: &Path, console: &'a Console) -> Self {
        Self {
            console,
            registry: Registry::new(),
            loaded: HashSet::from([file.to_path_buf()]),
        }
    }

    fn run_script(&mut self, path: &Path, source: &str) -> Result<(), EvalError> {
        let statements = bundle::parse_script(source).map_err(|err| match err {
            ScriptError::ModuleStyle => EvalError::WrongModuleStyle {
                path: path.to_path_buf(),
            },
            ScriptError::Syntax { line, message } => EvalError::Syntax {
                path: path.to_path_buf(),
                line,
                message,
            },
        })?;

        for statement in statements {
            match statement {
                Statement::Use { specifier, .. } => self.import(&specifier, path)?,
                Statement::Test { name, steps } => {
                    self.registry.test(name, registry::steps_callback(steps));
                }
                Statement::Step { step, line } => {
                    host::run_top_level(&step, self.console).map_err(|failure| {
                        EvalError::Thrown {
                            path: path.to_path_buf(),
                            line,
                            failure,
                        }
                    })?;
                }
            }
        }
        Ok(())
    }

    fn run_document(&mut self, path: &Path, document: ModuleDocument) -> Result<(), EvalError> {
        for specifier in &document.imports {
            self.import(specifier, path)?;
        }
        for test in document.tests {
            self.registry
                .test(test.name, registry::steps_callback(test.steps));
        }
        Ok(())
    }

    /// Resolution shim: the testing package maps to the in-process bindings,
    /// relative specifiers load helper bundles (once each), anything else fails.
    fn import(&mut self, specifier: &str, from: &Path) -> Result<(), EvalError> {
        if specifier == TESTING_PACKAGE {
            return Ok(());
        }
        let path = resolve_relative(specifier, from).ok_or_else(|| EvalError::Unresolved {
            specifier: specifier.to_string(),
            from: from.to_path_buf(),
        })?;
        if !self.loaded.insert(path.clone()) {
            return Ok(());
        }

        let source = std::fs::read_to_string(&path).map_err(|e| EvalError::read(&path, e))?;
        match self.run_script(&path, &source) {
            Err(EvalError::WrongModuleStyle { .. }) => {
                let document = parse_document(&path, &source)?;
                self.run_document(&path, document)
            }
            other => other,
        }
    }
}

fn resolve_relative(specifier: &str, from: &Path) -> Option<PathBuf> {
    if !(specifier.starts_with("./") || specifier.starts_with("../")) {
        return None;
    }
    let base = from.parent().unwrap_or(Path::new("."));
    let candidate = normalize(&base.join(specifier));
    if candidate.is_file() {
        return Some(candidate);
    }
    let mut with_extension = candidate.into_os_string();
    with_extension.push(".");
    with_extension.push(BUILD_EXTENSION);
    let with_extension = PathBuf::from(with_extension);
    with_extension.is_file().then_some(with_extension)
}

/// Lexically drop `.` and resolve `..` so one helper has one identity.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

async fn run_single_test(
    test: RegisteredTest,
    scope: TestScope,
    file: &str,
    timeout: Option<Duration>,
) -> TestRunResult {
    let start = Instant::now();
    let RegisteredTest { name, callback } = test;

    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| callback(scope))) {
        Err(panic) => Err(TestFailure::Panic(panic_message(panic))),
        Ok(future) => {
            let guarded = AssertUnwindSafe(future).catch_unwind();
            let settled = match timeout {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(settled) => settled,
                    Err(_) => Ok(Err(TestFailure::Timeout(limit.as_millis() as u64))),
                },
                None => guarded.await,
            };
            settled.unwrap_or_else(|panic| Err(TestFailure::Panic(panic_message(panic))))
        }
    };

    let duration_ms = elapsed_ms(start);
    match outcome {
        Ok(()) => TestRunResult::passed(name, file, duration_ms),
        Err(failure) => TestRunResult::failed(name, file, failure.to_string(), duration_ms),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use futures_util::FutureExt;

    use super::*;

    #[derive(Default)]
    struct Collect {
        results: Mutex<Vec<TestRunResult>>,
        console: Mutex<Vec<String>>,
    }

    impl RunObserver for Collect {
        fn on_result(&self, result: &TestRunResult) {
            self.results.lock().unwrap().push(result.clone());
        }

        fn on_console(&self, _file: &Path, message: &str) {
            self.console.lock().unwrap().push(message.to_string());
        }
    }

    fn write(dir: &Path, name: &str, source: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, source).unwrap();
        path
    }

    async fn run_files(files: &[PathBuf]) -> (RunnerSummary, Arc<Collect>) {
        let observer = Arc::new(Collect::default());
        let summary = run(files, &RunOptions::default(), observer.clone()).await;
        (summary, observer)
    }

    fn console(observer: Arc<Collect>) -> Console {
        Console::new(PathBuf::from("x.tdb"), observer)
    }

    #[tokio::test]
    async fn one_passing_and_one_failing_test() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "a.test.tdb",
            "use tandem\ntest \"passes\" {\n  assert.equal 1 1\n}\ntest \"fails\" {\n  assert.equal 1 2\n}\n",
        );

        let (summary, _) = run_files(&[file]).await;
        assert_eq!((summary.passed, summary.failed, summary.total), (1, 1, 2));
        assert_eq!(
            summary.results[1].message.as_deref(),
            Some("AssertionError: Expected 1 but received 2")
        );
    }

    #[tokio::test]
    async fn failing_test_does_not_affect_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let source = "test \"t1\" {\n  log one\n}\ntest \"t2\" {\n  assert.fail broken\n}\ntest \"t3\" {\n  log three\n}\ntest \"t4\"\n";
        let file = write(dir.path(), "a.test.tdb", source);

        let (summary, observer) = run_files(&[file]).await;
        let outcome: Vec<_> = summary
            .results
            .iter()
            .map(|r| (r.name.as_str(), r.passed))
            .collect();
        assert_eq!(
            outcome,
            [("t1", true), ("t2", false), ("t3", true), ("t4", true)]
        );
        assert_eq!(*observer.console.lock().unwrap(), ["one", "three"]);
    }

    #[tokio::test]
    async fn missing_file_is_reported_and_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let present = write(dir.path(), "b.test.tdb", "test \"ok\"\n");
        let missing = dir.path().join("gone.test.tdb");

        let (summary, _) = run_files(&[missing, present]).await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.results[0].name, MISSING_FILE_TEST);
        assert_eq!(summary.results[0].message.as_deref(), Some("Compiled file not found"));
        assert!(summary.results[1].passed);
    }

    #[tokio::test]
    async fn evaluation_error_yields_one_synthetic_result() {
        let dir = tempfile::tempdir().unwrap();
        let broken = write(
            dir.path(),
            "broken.test.tdb",
            "test \"never runs\" {\n  assert.true true\n}\nfrobnicate\n",
        );
        let healthy = write(dir.path(), "ok.test.tdb", "test \"fine\"\n");

        let (summary, _) = run_files(&[broken, healthy]).await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.results[0].name, EVALUATION_TEST);
        assert!(
            summary.results[0]
                .message
                .as_deref()
                .unwrap()
                .contains("unknown statement `frobnicate`")
        );
        assert_eq!(summary.results[1].name, "fine");
    }

    #[tokio::test]
    async fn module_style_bundle_falls_back_to_module_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            dir.path(),
            "module.test.tdb",
            r#"{"imports": ["tandem"], "tests": [
                {"name": "equal", "steps": [{"op": "equal", "expected": "a", "actual": "a"}]},
                {"name": "falsy", "steps": [{"op": "is-true", "value": 0}]}
            ]}"#,
        );

        let (summary, _) = run_files(&[file]).await;
        assert_eq!((summary.passed, summary.failed), (1, 1));
        assert_eq!(summary.results[1].name, "falsy");
    }

    #[tokio::test]
    async fn non_style_errors_do_not_trigger_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "bad.test.tdb", "test \"a\" {\n");
        let observer = Arc::new(Collect::default());

        let err = evaluate(&file, &console(observer)).await.unwrap_err();
        assert!(matches!(err, EvalError::Syntax { line: 1, .. }));
    }

    #[tokio::test]
    async fn invalid_module_document_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "doc.test.tdb", "{\"tests\": [}");
        let observer = Arc::new(Collect::default());

        let err = evaluate(&file, &console(observer)).await.unwrap_err();
        assert!(matches!(err, EvalError::Document { .. }));
    }

    #[tokio::test]
    async fn failing_top_level_assertion_is_an_evaluation_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "top.test.tdb", "test \"a\"\nassert.equal 1 2\n");
        let observer = Arc::new(Collect::default());

        let err = evaluate(&file, &console(observer)).await.unwrap_err();
        assert!(matches!(err, EvalError::Thrown { line: 2, .. }));
    }

    #[tokio::test]
    async fn resolves_helpers_and_rejects_unknown_packages() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "shared.tdb", "test \"from helper\"\n");
        let file = write(
            dir.path(),
            "a.test.tdb",
            "use tandem\nuse ./shared\nuse ./shared.tdb\ntest \"own\"\n",
        );
        let observer = Arc::new(Collect::default());
        let registry = evaluate(&file, &console(observer.clone())).await.unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), ["from helper", "own"]);

        let other = write(dir.path(), "b.test.tdb", "use left-pad\n");
        let err = evaluate(&other, &console(observer)).await.unwrap_err();
        assert!(matches!(err, EvalError::Unresolved { ref specifier, .. } if specifier == "left-pad"));
    }

    #[tokio::test]
    async fn registry_starts_empty_on_every_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "a.test.tdb", "test \"one\"\ntest \"two\"\n");
        let observer = Arc::new(Collect::default());
        let console = console(observer);

        assert_eq!(evaluate(&file, &console).await.unwrap().len(), 2);
        assert_eq!(evaluate(&file, &console).await.unwrap().len(), 2);

        let (summary, _) = run_files(&[file.clone(), file]).await;
        assert_eq!(summary.total, 4);
    }

    #[tokio::test]
    async fn results_are_reported_progressively_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.test.tdb", "test \"a1\"\ntest \"a2\"\n");
        let b = write(dir.path(), "b.test.tdb", "test \"b1\"\n");

        let (summary, observer) = run_files(&[a, b]).await;
        assert_eq!(*observer.results.lock().unwrap(), summary.results);
        let names: Vec<_> = summary.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a1", "a2", "b1"]);
    }

    #[tokio::test]
    async fn panics_and_timeouts_become_failures() {
        let panics: registry::TestCallback = Arc::new(|_: TestScope| {
            async {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), TestFailure>(())
            }
            .boxed()
        });
        let early: registry::TestCallback =
            Arc::new(|_: TestScope| -> registry::TestFuture { panic!("early") });
        let slow: registry::TestCallback = Arc::new(|_: TestScope| {
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), TestFailure>(())
            }
            .boxed()
        });

        let mut registry = Registry::new();
        registry.test("panics", Some(panics));
        registry.test("panics before awaiting", Some(early));
        registry.test("slow", Some(slow));

        let observer = Arc::new(Collect::default());
        let mut results = Vec::new();
        for test in registry.into_tests() {
            let scope = TestScope::new(console(observer.clone()), None);
            results.push(run_single_test(test, scope, "x.tdb", Some(Duration::from_millis(50))).await);
        }

        assert_eq!(results[0].message.as_deref(), Some("test panicked: kaboom"));
        assert_eq!(results[1].message.as_deref(), Some("test panicked: early"));
        assert_eq!(results[2].message.as_deref(), Some("test timed out after 50ms"));
        assert!(results.iter().all(|r| !r.passed));
    }
}
