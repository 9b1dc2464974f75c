//! # qubesctl
//!
//! Front end for the reconciliation engine. Reads one request document,
//! converges the host towards it and prints the response as JSON on stdout.
//! The exit code is the response status: 0 success, 1 failed, 2 unavailable.
//!
//! ## Usage
//! ```bash
//! qubesctl --world host.yaml --save-world request.yaml
//! echo '{"command": "get_states"}' | qubesctl -
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info};

use qubesctl_core::{MockQubes, Orchestrator, Request, Status, World};

mod cli;
mod config;

use cli::Args;
use config::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            println!("{}", json!({ "rc": Status::Failed.code(), "msg": format!("{:#}", e) }));
            ExitCode::from(Status::Failed.code())
        }
    }
}

async fn run(args: Args) -> Result<Status> {
    let config = Config::resolve(&args)?;
    qubesctl_common::init(&config.log_level, config.log_format()?)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting qubesctl");

    let request = read_request(&args.request)?;
    let backend = Arc::new(load_backend(&args)?);
    let orchestrator = Orchestrator::new(backend.clone(), config.engine.clone());

    let response = orchestrator.handle(&request).await;
    println!("{}", serde_json::to_string_pretty(&response.to_json())?);

    if args.save_world {
        if let Some(ref path) = args.world {
            let yaml = backend.to_world().to_yaml()?;
            std::fs::write(path, yaml)
                .with_context(|| format!("Failed to write world file: {}", path.display()))?;
            debug!(path = %path.display(), "World saved");
        }
    }

    Ok(response.status())
}

fn read_request(source: &str) -> Result<Request> {
    let content = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read request from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read request file: {}", source))?
    };

    // YAML is a superset of JSON, so one parser covers both.
    serde_yaml::from_str(&content).with_context(|| "Failed to parse request document")
}

fn load_backend(args: &Args) -> Result<MockQubes> {
    match &args.world {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read world file: {}", path.display()))?;
            let world = World::from_yaml(&content).with_context(|| "Failed to parse world file")?;
            Ok(MockQubes::from_world(world)?)
        }
        None => {
            info!("No world file given, using the built-in demo host");
            Ok(MockQubes::with_defaults())
        }
    }
}
