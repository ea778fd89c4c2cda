//! Per-evaluation registry of declared tests.

use std::fmt;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};

use super::bundle::Step;
use super::host::{self, TestFailure, TestScope};

pub type TestFuture = BoxFuture<'static, Result<(), TestFailure>>;
pub type TestCallback = Arc<dyn Fn(TestScope) -> TestFuture + Send + Sync>;

pub struct RegisteredTest {
    pub name: String,
    pub callback: TestCallback,
}

impl fmt::Debug for RegisteredTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredTest")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Tests declared while evaluating one bundle.
///
/// A fresh registry is created for every evaluation and handed to the execution
/// step by value, so nothing registered by one file can leak into another.
#[derive(Debug, Default)]
pub struct Registry {
    tests: Vec<RegisteredTest>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a test; a missing callback is a test that always passes.
    pub fn test(&mut self, name: impl Into<String>, callback: Option<TestCallback>) {
        let callback = callback.unwrap_or_else(|| {
            let noop: TestCallback = Arc::new(|_: TestScope| async { Ok::<(), TestFailure>(()) }.boxed());
            noop
        });
        self.tests.push(RegisteredTest {
            name: name.into(),
            callback,
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    #[cfg(test)]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tests.iter().map(|t| t.name.as_str())
    }

    /// Consume the registry, yielding tests in declaration order.
    pub fn into_tests(self) -> Vec<RegisteredTest> {
        self.tests
    }
}

/// Wrap parsed bundle steps as a test callback.
pub fn steps_callback(steps: Vec<Step>) -> Option<TestCallback> {
    if steps.is_empty() {
        return None;
    }
    let steps: Arc<[Step]> = steps.into();
    let callback: TestCallback = Arc::new(move |mut scope: TestScope| {
        let steps = Arc::clone(&steps);
        async move { host::run_steps(&steps, &mut scope).await }.boxed()
    });
    Some(callback)
}
