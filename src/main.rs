mod backend;
mod commands;
mod config;
mod discovery;
mod events;
mod execution;
mod filter;
mod models;
mod providers;
mod sandbox;

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use config::Config;
use events::{Emitter, create_run_id};

enum Mode {
    Test,
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Diagnostics go to stderr; stdout carries the event stream.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TANDEM_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1).peekable();
    let mode = match args.peek().map(String::as_str) {
        Some("watch") => {
            args.next();
            Mode::Watch
        }
        Some("test") => {
            args.next();
            Mode::Test
        }
        _ => Mode::Test,
    };
    let workspace = args
        .next()
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));

    let config = Config::from_env(&workspace);
    tracing::debug!(workspace = %config.workspace.display(), "resolved workspace");

    let (emitter, rx) = Emitter::channel();
    let writer = events::spawn_writer(rx, tokio::io::stdout());

    let code = match mode {
        Mode::Test => commands::run_test_command(&config, &emitter).await,
        Mode::Watch => match commands::run_watch_command(config, emitter.clone()).await {
            Ok(code) => code,
            Err(err) => {
                tracing::error!(error = %err, "watch mode failed to start");
                emitter.error(&create_run_id(), &err);
                1
            }
        },
    };

    drop(emitter);
    let _ = writer.await;
    ExitCode::from(code)
}
