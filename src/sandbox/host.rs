//! Host primitives available to running tests: timers, console, assertions and
//! the backend context.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{Value, json};
use thiserror::Error;

use super::RunObserver;
use super::assert::{self, AssertionError};
use super::bundle::Step;
use crate::backend::BackendTestContext;

#[derive(Debug, Error)]
pub enum TestFailure {
    #[error("AssertionError: {0}")]
    Assertion(#[from] AssertionError),
    #[error("{0}")]
    Host(String),
    #[error("test panicked: {0}")]
    Panic(String),
    #[error("test timed out after {0}ms")]
    Timeout(u64),
}

/// Console output scoped to one bundle.
#[derive(Clone)]
pub struct Console {
    file: PathBuf,
    observer: Arc<dyn RunObserver>,
}

impl Console {
    pub fn new(file: PathBuf, observer: Arc<dyn RunObserver>) -> Self {
        Self { file, observer }
    }

    pub fn log(&self, message: &str) {
        self.observer.on_console(&self.file, message);
    }
}

#[derive(Debug, Clone)]
struct CapturedResponse {
    status: u16,
    body: String,
}

/// Per-test execution state handed to a test callback.
pub struct TestScope {
    pub console: Console,
    pub backend: Option<Arc<BackendTestContext>>,
    last_response: Option<CapturedResponse>,
}

impl TestScope {
    pub fn new(console: Console, backend: Option<Arc<BackendTestContext>>) -> Self {
        Self {
            console,
            backend,
            last_response: None,
        }
    }

    fn context(&self, step: &str) -> Result<&BackendTestContext, TestFailure> {
        self.backend.as_deref().ok_or_else(|| {
            TestFailure::Host(format!(
                "no backend context is available; `{step}` needs a backend test"
            ))
        })
    }

    fn response(&self) -> Result<&CapturedResponse, TestFailure> {
        self.last_response
            .as_ref()
            .ok_or_else(|| TestFailure::Host("no response to check; issue a `request` first".into()))
    }
}

/// Run a top-level bundle statement during evaluation.
pub fn run_top_level(step: &Step, console: &Console) -> Result<(), TestFailure> {
    match step {
        Step::Equal {
            expected,
            actual,
            message,
        } => assert::equal(expected, actual, message.as_deref())?,
        Step::IsTrue { value, message } => assert::is_true(value, message.as_deref())?,
        Step::Fail { message } => assert::fail(message)?,
        Step::Log { message } => console.log(message),
        other => {
            return Err(TestFailure::Host(format!(
                "{other:?} cannot run outside a test"
            )));
        }
    }
    Ok(())
}

pub async fn run_steps(steps: &[Step], scope: &mut TestScope) -> Result<(), TestFailure> {
    for step in steps {
        run_step(step, scope).await?;
    }
    Ok(())
}

async fn run_step(step: &Step, scope: &mut TestScope) -> Result<(), TestFailure> {
    match step {
        Step::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,

        Step::Request { method, path } => {
            let context = scope.context("request")?;
            let method = Method::from_bytes(method.as_bytes())
                .map_err(|_| TestFailure::Host(format!("invalid HTTP method `{method}`")))?;
            let response = context
                .request(method, path)
                .await
                .map_err(|e| TestFailure::Host(format!("request to {path} failed: {e:#}")))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| TestFailure::Host(format!("failed to read response from {path}: {e}")))?;
            scope.last_response = Some(CapturedResponse { status, body });
        }

        Step::ExpectStatus { status } => {
            let response = scope.response()?;
            let message = format!("Expected status {status} but received {}", response.status);
            assert::equal(&json!(status), &json!(response.status), Some(&message))?;
        }

        Step::ExpectBody { contains } => {
            let response = scope.response()?;
            if !response.body.contains(contains.as_str()) {
                return Err(AssertionError::new(format!(
                    "Expected response body to contain {contains:?}"
                ))
                .into());
            }
        }

        Step::ExpectJson { pointer, value } => {
            let response = scope.response()?;
            let body: Value = serde_json::from_str(&response.body)
                .map_err(|e| TestFailure::Host(format!("response body is not JSON: {e}")))?;
            let actual = body.pointer(pointer).ok_or_else(|| {
                AssertionError::new(format!("response JSON has no value at {pointer}"))
            })?;
            assert::equal(value, actual, None)?;
        }

        Step::ExpectManifest { pointer, value } => {
            let manifest = scope
                .context("expect.manifest")?
                .manifest()
                .ok_or_else(|| AssertionError::new("no backend manifest was loaded"))?;
            let actual = manifest.pointer(pointer).ok_or_else(|| {
                AssertionError::new(format!("backend manifest has no value at {pointer}"))
            })?;
            assert::equal(value, actual, None)?;
        }

        Step::ExpectEnv { key, value } => {
            let actual = scope.context("expect.env")?.env().get(key).ok_or_else(|| {
                AssertionError::new(format!("backend environment has no {key}"))
            })?;
            let message = format!("Expected {key}={value} but found {key}={actual}");
            assert::equal(&json!(value), &json!(actual), Some(&message))?;
        }

        top_level => run_top_level(top_level, &scope.console)?,
    }
    Ok(())
}
