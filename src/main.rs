//! mssqlscripter-client - run one scripting operation against a SQL Tools Service.
//!
//! Usage: `mssqlscripter-client <engine-executable> <parameters.json> [engine-args...]`
//!
//! The parameters file holds a JSON object with `FilePath`, `ConnectionString`
//! and any scripting options. Progress is logged to stderr; the exit status is
//! non-zero if the operation reports an error.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mssqlscripter_client::config::ClientConfig;
use mssqlscripter_client::scripting::{ScriptingMessage, ScriptingParams};
use mssqlscripter_client::sqltools::SqlToolsClient;

struct Args {
    engine: PathBuf,
    parameters: PathBuf,
    engine_args: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let (Some(engine), Some(parameters)) = (args.next(), args.next()) else {
        bail!("Usage: mssqlscripter-client <engine-executable> <parameters.json> [engine-args...]");
    };

    Ok(Args {
        engine: PathBuf::from(engine),
        parameters: PathBuf::from(parameters),
        engine_args: args.collect(),
    })
}

fn load_parameters(path: &Path) -> Result<ScriptingParams> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read parameters from {}", path.display()))?;
    let parameters: Map<String, Value> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON object", path.display()))?;

    ScriptingParams::from_parameters(&parameters).context("Invalid scripting parameters")
}

fn log_message(message: &ScriptingMessage) {
    match message {
        ScriptingMessage::Response(response) => {
            info!("Scripting operation {:?} accepted", response.operation_id)
        }
        ScriptingMessage::Plan(plan) => info!("Scripting {} objects", plan.count),
        ScriptingMessage::Progress(progress) => info!(
            "[{}/{}] {} {}",
            progress.completed_count,
            progress.total_count,
            progress.status,
            progress.scripting_object.name
        ),
        ScriptingMessage::Complete(_) => {}
        ScriptingMessage::Unrecognized(raw) => warn!("Ignoring unexpected message: {}", raw),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout is left to the engine's script output.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mssqlscripter_client=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let args = parse_args()?;
    let config = ClientConfig::from_env().context("Invalid client configuration")?;
    let params = load_parameters(&args.parameters)?;

    info!("Starting SQL Tools Service: {}", args.engine.display());
    let child = Command::new(&args.engine)
        .args(&args.engine_args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start {}", args.engine.display()))?;

    let mut client = SqlToolsClient::spawn(child, config)?;
    let mut request = client.create_scripting_request(params)?;
    request.execute()?;

    let outcome = client.drain(&mut request, log_message).await;
    client.shutdown();

    let event = outcome?;
    if event.has_error {
        error!(
            "Scripting failed: {}",
            event.error_message.as_deref().unwrap_or("unknown error")
        );
        if !event.error_details.is_null() {
            error!("Details: {}", event.error_details);
        }
        return Ok(ExitCode::FAILURE);
    }
    if event.canceled {
        warn!("Scripting was canceled");
        return Ok(ExitCode::FAILURE);
    }

    info!("Scripting complete");
    Ok(ExitCode::SUCCESS)
}
