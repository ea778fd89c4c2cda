//! Backend test support: the harness that owns the server process, and the
//! context handed to tests while it runs.

pub mod harness;
pub mod port;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Method, Response, Url};
use serde_json::Value;

use crate::config::Config;
use crate::discovery::{BACKEND_FOLDER, BUILD_FOLDER};

pub use harness::{BackendHarness, HarnessError};

const DEFAULT_READY_TEXT: &str = "API server running";
const DEFAULT_READY_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_PORT: u16 = 4100;
const DEFAULT_PORT_ATTEMPTS: u32 = 10;

/// Connection details for the running backend, shared read-only by every test of a batch.
#[derive(Debug)]
pub struct BackendTestContext {
    base_url: Url,
    port: u16,
    manifest: Option<Value>,
    env: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl BackendTestContext {
    pub fn new(
        base_url: Url,
        port: u16,
        manifest: Option<Value>,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            base_url,
            port,
            manifest,
            env,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The external manifest, if one was present and parsed.
    pub fn manifest(&self) -> Option<&Value> {
        self.manifest.as_ref()
    }

    /// Environment the server process was launched with (harness-derived keys only).
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Absolute URLs pass through; anything else is joined onto the base URL.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).with_context(|| format!("invalid url {path}"));
        }
        self.base_url
            .join(path)
            .with_context(|| format!("cannot join {path} onto {}", self.base_url))
    }

    pub async fn request(&self, method: Method, path: &str) -> Result<Response> {
        let url = self.url_for(path)?;
        self.client
            .request(method.clone(), url.clone())
            .send()
            .await
            .with_context(|| format!("{method} {url}"))
    }
}

/// Fully resolved harness configuration; paths are absolute.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub workspace: PathBuf,
    pub build_root: PathBuf,
    pub entry: PathBuf,
    pub manifest: PathBuf,
    /// Launcher argv placed before the entry. Empty runs the entry directly.
    pub command: Vec<String>,
    /// Any one of these appearing in the server output means it is ready.
    /// Empty means the first non-empty line counts.
    pub ready_markers: Vec<String>,
    pub ready_timeout: Duration,
    pub base_port: u16,
    pub port_attempts: u32,
    /// Pre-set `API_BASE_URL` to keep instead of deriving one from the port.
    pub base_url: Option<String>,
}

impl HarnessSettings {
    pub fn resolve(config: &Config) -> Result<Self> {
        let workspace = config.workspace.clone();
        let backend = &config.backend;
        let absolute = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                workspace.join(path)
            }
        };

        let build_root = backend
            .build_root
            .as_ref()
            .map(absolute)
            .unwrap_or_else(|| workspace.join(BUILD_FOLDER).join(BACKEND_FOLDER));
        let entry = backend
            .entry
            .as_ref()
            .map(absolute)
            .unwrap_or_else(|| build_root.join("server"));
        let manifest = backend
            .manifest
            .as_ref()
            .map(absolute)
            .unwrap_or_else(|| workspace.join(".tandem").join("backend-manifest.json"));

        let command = match backend.command.as_deref() {
            Some(command) => shell_words::split(command)
                .with_context(|| format!("invalid backend command: {command}"))?,
            None => Vec::new(),
        };

        let ready_markers = parse_markers(backend.ready.as_deref().unwrap_or(DEFAULT_READY_TEXT));

        Ok(Self {
            build_root,
            entry,
            manifest,
            command,
            ready_markers,
            ready_timeout: Duration::from_millis(
                backend.ready_timeout_ms.unwrap_or(DEFAULT_READY_TIMEOUT_MS),
            ),
            base_port: backend.port.unwrap_or(DEFAULT_PORT),
            port_attempts: backend.port_attempts.unwrap_or(DEFAULT_PORT_ATTEMPTS).max(1),
            base_url: std::env::var("API_BASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            workspace,
        })
    }
}

/// Split `a|b|c` into trimmed, non-empty alternatives.
pub fn parse_markers(ready: &str) -> Vec<String> {
    ready
        .split('|')
        .map(str::trim)
        .filter(|marker| !marker.is_empty())
        .map(str::to_string)
        .collect()
}


#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn context(base: &str) -> BackendTestContext {
        BackendTestContext::new(Url::parse(base).unwrap(), 4100, None, BTreeMap::new())
    }

    #[test]
    fn joins_paths_onto_base_url() {
        let ctx = context("http://127.0.0.1:4100");
        assert_eq!(
            ctx.url_for("/api/items").unwrap().as_str(),
            "http://127.0.0.1:4100/api/items"
        );
        assert_eq!(
            ctx.url_for("health").unwrap().as_str(),
            "http://127.0.0.1:4100/health"
        );
        assert_eq!(
            ctx.url_for("https://example.com/x").unwrap().as_str(),
            "https://example.com/x"
        );
    }

    #[tokio::test]
    async fn sends_requests_to_the_server() {
        let port = test_server::serve(201, r#"{"ok":true}"#).await;
        let ctx = context(&format!("http://127.0.0.1:{port}"));

        let response = ctx.request(Method::POST, "/items").await.unwrap();
        assert_eq!(response.status().as_u16(), 201);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["ok"], Value::Bool(true));
    }

    #[test]
    fn resolves_defaults_under_the_workspace() {
        let config = Config {
            workspace: PathBuf::from("/ws"),
            ..Config::default()
        };
        let settings = HarnessSettings::resolve(&config).unwrap();

        assert_eq!(settings.build_root, Path::new("/ws/build/backend"));
        assert_eq!(settings.entry, Path::new("/ws/build/backend/server"));
        assert_eq!(
            settings.manifest,
            Path::new("/ws/.tandem/backend-manifest.json")
        );
        assert_eq!(settings.ready_markers, ["API server running"]);
        assert_eq!(settings.ready_timeout, Duration::from_millis(15_000));
        assert_eq!((settings.base_port, settings.port_attempts), (4100, 10));
        assert!(settings.command.is_empty());
    }

    #[test]
    fn resolves_configured_values() {
        let mut config = Config {
            workspace: PathBuf::from("/ws"),
            ..Config::default()
        };
        config.backend.build_root = Some(PathBuf::from("out/api"));
        config.backend.manifest = Some(PathBuf::from("/abs/manifest.json"));
        config.backend.command = Some("node --enable-source-maps".into());
        config.backend.ready = Some(" listening | ready |".into());
        config.backend.port = Some(5000);

        let settings = HarnessSettings::resolve(&config).unwrap();
        assert_eq!(settings.entry, Path::new("/ws/out/api/server"));
        assert_eq!(settings.manifest, Path::new("/abs/manifest.json"));
        assert_eq!(settings.command, ["node", "--enable-source-maps"]);
        assert_eq!(settings.ready_markers, ["listening", "ready"]);
        assert_eq!(settings.base_port, 5000);
    }

    #[test]
    fn unbalanced_command_quotes_are_rejected() {
        let mut config = Config::default();
        config.backend.command = Some("node \"--flag".into());
        assert!(HarnessSettings::resolve(&config).is_err());
    }

    #[test]
    fn empty_ready_text_means_no_markers() {
        assert!(parse_markers("").is_empty());
        assert!(parse_markers(" | ").is_empty());
    }
}
