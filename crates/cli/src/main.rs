//! `segmark-cli` -- drive a segmentation session from stdin.
//!
//! Reads one command per line (see [`segmark_cli::command`]) and prints
//! session snapshots as JSON on stdout. Logs go to stderr.
//!
//! # Environment variables
//!
//! | Variable           | Required | Default | Description                          |
//! |--------------------|----------|---------|--------------------------------------|
//! | `PROJECT_ID`       | yes      | --      | Project UUID                         |
//! | `INFERENCE_WS_URL` | no       | local   | Model service websocket endpoint     |
//! | `API_BASE_URL`     | no       | local   | Annotation REST base URL             |
//! | `CANVAS_WIDTH`     | no       | `1280`  | Initial canvas width in pixels       |
//! | `CANVAS_HEIGHT`    | no       | `720`   | Initial canvas height in pixels      |
//!
//! Timing and zoom settings are documented on `SessionConfig::from_env`.

use std::sync::Arc;

use anyhow::Context;
use segmark_cli::command::CliCommand;
use segmark_core::viewport::Size;
use segmark_persistence::PersistenceApi;
use segmark_session::{Session, SessionConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CANVAS_WIDTH: f64 = 1280.0;
const DEFAULT_CANVAS_HEIGHT: f64 = 720.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "segmark_cli=info,segmark_session=info,segmark_inference=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = SessionConfig::from_env().context("Invalid session configuration")?;
    let canvas = Size::new(
        canvas_dimension("CANVAS_WIDTH", DEFAULT_CANVAS_WIDTH)?,
        canvas_dimension("CANVAS_HEIGHT", DEFAULT_CANVAS_HEIGHT)?,
    );

    tracing::info!(
        project_id = %config.project_id,
        inference_ws_url = %config.inference_ws_url,
        api_base_url = %config.api_base_url,
        width = canvas.w,
        height = canvas.h,
        "Starting segmark-cli",
    );

    let persistence = Arc::new(PersistenceApi::new(
        config.api_base_url.clone(),
        config.project_id,
    ));
    let (session, handle) = Session::open(config, persistence, canvas);
    let session_task = tokio::spawn(session.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match CliCommand::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match command {
            CliCommand::Quit => break,
            CliCommand::Snapshot => {
                let snapshot = handle.snapshot().await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            other => {
                if let Some(command) = other.into_session_command() {
                    handle.send(command).await?;
                }
            }
        }
    }

    handle.close().await?;
    session_task.await.context("Session task panicked")?;
    tracing::info!("segmark-cli stopped");
    Ok(())
}

fn canvas_dimension(var: &str, default: f64) -> anyhow::Result<f64> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => {
            let parsed: f64 = value
                .trim()
                .parse()
                .with_context(|| format!("{var} must be a number, got {value:?}"))?;
            anyhow::ensure!(parsed > 0.0, "{var} must be positive");
            Ok(parsed)
        }
    }
}
