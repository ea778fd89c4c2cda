use std::io;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use futures_util::future::{BoxFuture, FutureExt, join_all};
use glob::{MatchOptions, Pattern};

use crate::models::{RuntimeKind, TestManifest, TestModule};

pub const SRC_FOLDER: &str = "src";
pub const TEST_FOLDER: &str = "tests";
pub const BUILD_FOLDER: &str = "build";
pub const BACKEND_FOLDER: &str = "backend";
pub const BUILD_EXTENSION: &str = "tdb";
pub const TEST_FILE_SUFFIXES: [&str; 2] = [".test.tdm", ".spec.tdm"];
pub const EXCLUDED_DIRECTORIES: [&str; 5] = ["node_modules", "build", "dist", "target", ".git"];

/// Walk `<workspace>/src` and build a sorted manifest of test modules.
///
/// A missing source root yields an empty manifest rather than an error.
pub async fn discover_test_manifest(workspace: &Path, ignore: &[String]) -> Result<TestManifest> {
    let src_root = workspace.join(SRC_FOLDER);
    let ignore = compile_ignore(ignore);

    if !tokio::fs::try_exists(&src_root).await.unwrap_or(false) {
        return Ok(manifest(workspace, Vec::new()));
    }

    let files = walk_directory(src_root.clone())
        .await
        .with_context(|| format!("failed to walk {}", src_root.display()))?;

    let mut modules: Vec<TestModule> = files
        .into_iter()
        .filter_map(|file| classify(workspace, &src_root, &file, &ignore))
        .collect();
    modules.sort_by(|a, b| a.id.cmp(&b.id));

    Ok(manifest(workspace, modules))
}

fn manifest(workspace: &Path, modules: Vec<TestModule>) -> TestManifest {
    TestManifest {
        workspace_root: workspace.to_path_buf(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        modules,
    }
}

/// Recursively collect regular files, fanning out one future per subdirectory.
fn walk_directory(dir: PathBuf) -> BoxFuture<'static, io::Result<Vec<PathBuf>>> {
    async move {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut files = Vec::new();
        let mut subdirs = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                if !is_excluded_dir(&entry.file_name().to_string_lossy()) {
                    subdirs.push(walk_directory(path));
                }
            } else if file_type.is_file() {
                files.push(path);
            }
        }

        for nested in join_all(subdirs).await {
            files.extend(nested?);
        }
        Ok(files)
    }
    .boxed()
}

pub fn is_excluded_dir(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_DIRECTORIES.contains(&name)
}

fn compile_ignore(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                tracing::warn!(pattern = %p, error = %err, "ignoring invalid discovery pattern");
                None
            }
        })
        .collect()
}

fn classify(workspace: &Path, src_root: &Path, file: &Path, ignore: &[Pattern]) -> Option<TestModule> {
    let relative = file.strip_prefix(src_root).ok()?;
    let segments = segments(relative);

    if !segments[..segments.len().saturating_sub(1)]
        .iter()
        .any(|s| s == TEST_FOLDER)
    {
        return None;
    }
    let file_name = segments.last()?;
    if !TEST_FILE_SUFFIXES.iter().any(|suffix| file_name.ends_with(suffix)) {
        return None;
    }

    if !ignore.is_empty() {
        let from_workspace = format!("{}/{}", SRC_FOLDER, segments.join("/"));
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        if ignore.iter().any(|p| p.matches_with(&from_workspace, options)) {
            return None;
        }
    }

    let runtime = infer_runtime(&segments);
    Some(TestModule {
        id: segments.join("/"),
        runtime,
        source_path: file.to_path_buf(),
        compiled_path: compiled_path(workspace, relative),
    })
}

fn segments(relative: &Path) -> Vec<String> {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

pub fn infer_runtime(segments: &[String]) -> RuntimeKind {
    match segments.first() {
        Some(first) if first == BACKEND_FOLDER => RuntimeKind::Backend,
        _ => RuntimeKind::Frontend,
    }
}

/// Re-root `relative` under `<workspace>/build` with the build output extension.
///
/// Returns `None` when the path is not valid UTF-8 or has no file name.
pub fn compiled_path(workspace: &Path, relative: &Path) -> Option<PathBuf> {
    relative.to_str()?;
    relative.file_name()?;
    Some(
        workspace
            .join(BUILD_FOLDER)
            .join(relative)
            .with_extension(BUILD_EXTENSION),
    )
}
