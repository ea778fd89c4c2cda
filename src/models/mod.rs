pub mod manifest;
pub mod result;

pub use manifest::{RuntimeKind, TestManifest, TestModule};
pub use result::{RunnerSummary, TestRunResult};
