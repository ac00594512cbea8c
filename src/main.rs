//! livewire - streaming backend connector CLI
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use livewire::{run_call, run_turn, run_watch, Output, RunOptions};
use livewire_app::config::{init_config_dir, load_settings, load_settings_strict, Settings};
use livewire_app::start_link;
use livewire_core::prelude::*;
use livewire_core::Payload;

/// livewire - talk to a streaming backend from the command line
#[derive(Parser, Debug)]
#[command(name = "livewire")]
#[command(about = "Streaming backend connector with NDJSON output", long_about = None)]
struct Args {
    /// Settings file (defaults to ./.livewire/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Backend URL, overriding the settings file
    #[arg(long, global = true, value_name = "URL")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create .livewire/config.toml with defaults
    Init {
        #[arg(value_name = "PATH")]
        path: Option<PathBuf>,
    },

    /// Issue one RPC call and print the result
    Call {
        method: String,

        /// Call parameters as a JSON object
        #[arg(long)]
        params: Option<String>,

        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Send one text turn and print the answer
    Turn {
        text: String,

        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Stream link events until Ctrl-C or the link gives up
    Watch,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    if let Command::Init { path } = &args.command {
        let project = path.clone().unwrap_or_else(current_dir);
        let created = init_config_dir(&project)?;
        eprintln!("Config: {}", created.display());
        return Ok(());
    }

    livewire_core::logging::init()?;

    let settings = load(&args)?;
    let client =
        start_link(&settings, args.endpoint.as_deref()).context("Failed to start link")?;
    let out = Output::stdout();

    let result = match args.command {
        Command::Call {
            method,
            params,
            timeout_ms,
        } => {
            let params = parse_params(params.as_deref())?;
            run_call(client, &out, &method, params, options(timeout_ms))
                .await
                .map(|_| ())
        }
        Command::Turn { text, timeout_ms } => run_turn(client, &out, &text, options(timeout_ms))
            .await
            .map(|_| ()),
        Command::Watch => {
            run_watch(client, &out, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Ctrl-C handler unavailable: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await
        }
        Command::Init { .. } => Ok(()),
    };

    if let Err(ref e) = result {
        error!("livewire exiting with error: {}", e);
        eprintln!(
            "Log: {}",
            livewire_core::logging::get_current_log_file().display()
        );
    }
    Ok(result?)
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

fn load(args: &Args) -> Result<Settings> {
    match &args.config {
        Some(path) => load_settings_strict(path),
        None => Ok(load_settings(&current_dir())),
    }
}

fn parse_params(params: Option<&str>) -> Result<Payload> {
    match params {
        Some(text) => serde_json::from_str(text)
            .map_err(|e| Error::config(format!("--params must be a JSON object: {}", e))),
        None => Ok(Payload::new()),
    }
}

fn options(timeout_ms: Option<u64>) -> RunOptions {
    RunOptions {
        timeout: timeout_ms.map(Duration::from_millis),
        ..RunOptions::default()
    }
}
