use crate::models::{RuntimeKind, TestManifest};

/// Parse a runtime filter value. Empty, `all`, and unknown values mean "no filter".
pub fn normalize_runtime_filter(value: Option<&str>) -> Option<RuntimeKind> {
    let normalized = value.unwrap_or_default().trim().to_lowercase();
    match normalized.as_str() {
        "" | "all" => None,
        "frontend" => Some(RuntimeKind::Frontend),
        "backend" => Some(RuntimeKind::Backend),
        other => {
            tracing::warn!(value = other, "unknown runtime filter; running all runtimes");
            None
        }
    }
}

pub fn apply_runtime_filter(manifest: TestManifest, runtime: Option<RuntimeKind>) -> TestManifest {
    let Some(runtime) = runtime else {
        return manifest;
    };
    TestManifest {
        modules: manifest
            .modules
            .into_iter()
            .filter(|m| m.runtime == runtime)
            .collect(),
        ..manifest
    }
}

pub fn describe_runtime_filter(
    runtime: Option<RuntimeKind>,
    before: usize,
    after: usize,
) -> Option<String> {
    let runtime = runtime?;
    let skipped = before.saturating_sub(after);
    let noun = if after == 1 { "test" } else { "tests" };
    Some(format!(
        "Runtime filter '{runtime}' matched {after} {noun} ({skipped} skipped)."
    ))
}
