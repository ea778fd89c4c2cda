use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    /// Absolute workspace root. Never read from the file itself.
    #[serde(skip)]
    pub workspace: PathBuf,
}

/// Controls which files are excluded during test discovery.
#[derive(Debug, Default, Deserialize)]
pub struct DiscoveryConfig {
    /// Glob patterns (relative to workspace root) of test sources to skip.
    /// Example: ["src/legacy/**", "**/*.slow.test.tdm"]
    #[serde(default)]
    pub ignore: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunnerConfig {
    /// `frontend`, `backend`, or `all`.
    pub runtime: Option<String>,
    pub test_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    150
}

/// Backend harness settings. Relative paths are resolved against the workspace root.
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub build_root: Option<PathBuf>,
    pub entry: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    /// Launcher prefixed to the entry, e.g. "node --enable-source-maps".
    pub command: Option<String>,
    /// Readiness markers, `|`-separated.
    pub ready: Option<String>,
    pub ready_timeout_ms: Option<u64>,
    pub port: Option<u16>,
    pub port_attempts: Option<u32>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            build_root: None,
            entry: None,
            manifest: None,
            command: None,
            ready: None,
            ready_timeout_ms: None,
            port: None,
            port_attempts: None,
            enabled: default_enabled(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load `tandem.toml` from the workspace root, falling back to defaults if absent or invalid.
    pub fn load(workspace: &Path) -> Self {
        let path = workspace.join("tandem.toml");
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "ignoring invalid config");
                Self::default()
            }),
            Err(_) => Self::default(),
        };
        config.workspace = workspace.to_path_buf();
        config
    }

    /// Resolve the workspace from `TANDEM_WORKSPACE_ROOT` (or `fallback`), then load
    /// the file and apply environment overrides.
    pub fn from_env(fallback: &Path) -> Self {
        let workspace = std::env::var_os("TANDEM_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| fallback.to_path_buf());
        let workspace = std::path::absolute(&workspace).unwrap_or(workspace);
        let mut config = Self::load(&workspace);
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay environment variables onto the loaded file values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(runtime) = lookup("TANDEM_RUNTIME") {
            self.runner.runtime = Some(runtime);
        }
        if let Some(ms) = positive_int(lookup("TANDEM_TEST_TIMEOUT_MS")) {
            self.runner.test_timeout_ms = Some(ms);
        }
        if let Some(ms) = positive_int(lookup("TANDEM_WATCH_DEBOUNCE_MS")) {
            self.watch.debounce_ms = ms;
        }

        let backend = &mut self.backend;
        if let Some(path) = lookup("TANDEM_BACKEND_BUILD_ROOT") {
            backend.build_root = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("TANDEM_BACKEND_TEST_ENTRY") {
            backend.entry = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("TANDEM_BACKEND_TEST_MANIFEST") {
            backend.manifest = Some(PathBuf::from(path));
        }
        if let Some(command) = lookup("TANDEM_BACKEND_TEST_COMMAND") {
            backend.command = Some(command);
        }
        if let Some(ready) = lookup("TANDEM_BACKEND_TEST_READY") {
            backend.ready = Some(ready);
        }
        if let Some(ms) = positive_int(lookup("TANDEM_BACKEND_TEST_READY_TIMEOUT")) {
            backend.ready_timeout_ms = Some(ms);
        }
        if let Some(port) = positive_int(lookup("TANDEM_BACKEND_TEST_PORT"))
            .and_then(|p| u16::try_from(p).ok())
        {
            backend.port = Some(port);
        }
        if let Some(toggle) = lookup("TANDEM_BACKEND_TESTS") {
            let toggle = toggle.trim().to_lowercase();
            if matches!(toggle.as_str(), "off" | "skip" | "false") {
                backend.enabled = false;
            }
        }
    }

    pub fn src_root(&self) -> PathBuf {
        self.workspace.join(crate::discovery::SRC_FOLDER)
    }
}

fn positive_int(value: Option<String>) -> Option<u64> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
}
