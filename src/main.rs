//! llmd - a line-delimited JSON inference daemon.
//!
//! Reads one JSON request per line on stdin and streams generation results as
//! JSON lines on stdout. Loaded models stay cached across requests, so short
//! lived clients do not pay load cost per request.

mod client;
mod config;
mod daemon;
mod error;
mod protocol;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use daemon::llm::create_backend;
use daemon::{DaemonServer, Shutdown};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llmd")]
#[command(author, version, about = "Line-delimited JSON inference daemon")]
#[command(long_about = "Reads JSON requests on stdin, one per line, and streams generated tokens as JSON lines on stdout.\n\nLogs go to stderr.")]
struct Cli {
    /// Config file to use instead of ~/.config/llmd/config.toml
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon on stdin/stdout (the default)
    Run {
        /// Maximum number of generations streaming at once
        #[arg(long, value_name = "N")]
        max_concurrent: Option<usize>,

        /// Model used by requests that do not name one
        #[arg(long, value_name = "MODEL")]
        default_model: Option<String>,
    },
    /// Start a daemon, run one generation, and print the tokens
    Generate {
        /// Model name (defaults to the daemon's default model)
        #[arg(short, long, value_name = "MODEL")]
        model: Option<String>,

        /// Generation argument, e.g. --arg temperature=0.2 (repeatable)
        #[arg(short, long = "arg", value_name = "KEY=VALUE", value_parser = parse_arg)]
        args: Vec<(String, Value)>,

        #[arg(value_name = "PROMPT")]
        prompt: String,
    },
    /// Open configuration file in $EDITOR
    Config {
        /// Print the effective configuration instead
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet)?;

    let command = cli.command.unwrap_or(Commands::Run {
        max_concurrent: None,
        default_model: None,
    });
    match command {
        Commands::Run {
            max_concurrent,
            default_model,
        } => run_daemon(cli.config.as_deref(), max_concurrent, default_model).await,
        Commands::Generate {
            model,
            args,
            prompt,
        } => {
            let mut global_args = Vec::new();
            if let Some(path) = &cli.config {
                global_args.push(OsString::from("--config"));
                global_args.push(path.clone().into_os_string());
            }
            if cli.verbose {
                global_args.push(OsString::from("--verbose"));
            } else {
                global_args.push(OsString::from("--quiet"));
            }
            handle_generate(&global_args, model, args, prompt).await
        }
        Commands::Config { show } => handle_config(cli.config.as_deref(), show),
    }
}

/// Send all diagnostics to stderr; stdout carries protocol lines only.
fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("llmd={level}").parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .init();
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    config.context("Failed to load configuration")
}

/// Run the daemon in the foreground on stdin/stdout.
async fn run_daemon(
    config_path: Option<&Path>,
    max_concurrent: Option<usize>,
    default_model: Option<String>,
) -> Result<()> {
    info!("Starting llmd daemon...");

    let mut config = load_config(config_path)?;
    if let Some(max_concurrent) = max_concurrent {
        config.daemon.max_concurrent_sessions = max_concurrent;
    }
    if let Some(default_model) = default_model {
        config.daemon.default_model = default_model;
    }
    config.validate()?;
    info!(
        "Using backend: {} (default model: {})",
        config.backend_type(),
        config.daemon.default_model
    );

    let backend = create_backend(&config.backend)?;
    if let Err(e) = backend.health_check().await {
        warn!("Backend {} is not reachable yet: {:#}", backend.name(), e);
    }

    let server = DaemonServer::new(&config, Arc::new(backend));
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let reason = server
        .run(tokio::io::stdin(), tokio::io::stdout(), interrupt)
        .await?;
    info!(?reason, "Daemon stopped");

    match reason {
        Shutdown::EndOfInput => Ok(()),
        // A pending stdin read would keep the runtime from shutting down
        Shutdown::Exit | Shutdown::Interrupted => std::process::exit(0),
    }
}

/// Run one generation through a child daemon and print its tokens.
async fn handle_generate(
    global_args: &[OsString],
    model: Option<String>,
    args: Vec<(String, Value)>,
    prompt: String,
) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to get current executable path")?;
    let mut client = client::DaemonClient::spawn(&exe, global_args)?;

    let args = if args.is_empty() {
        Value::Null
    } else {
        Value::Object(args.into_iter().collect::<Map<String, Value>>())
    };

    let result = print_tokens(&mut client, model.as_deref(), &prompt, args).await;
    client.shutdown(Duration::from_secs(10)).await?;
    result
}

async fn print_tokens(
    client: &mut client::DaemonClient,
    model: Option<&str>,
    prompt: &str,
    args: Value,
) -> Result<()> {
    if let Some(model) = model {
        client.load(model).await?;
    }
    let mut stream = client.generate(model, prompt, args).await?;
    debug!(req_id = stream.req_id(), "Generation started");
    let mut stdout = tokio::io::stdout();
    while let Some(token) = stream.next().await? {
        stdout.write_all(token.as_bytes()).await?;
        stdout.flush().await?;
    }
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}

/// Parse `KEY=VALUE`; the value is JSON if it parses, otherwise a string.
fn parse_arg(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("missing key in '{s}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Handle the config command.
fn handle_config(path: Option<&Path>, show: bool) -> Result<()> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };

    if show {
        let config = Config::load_from(&config_path)?;
        println!("# {}", config_path.display());
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    // Create default config if it doesn't exist
    if !config_path.exists() {
        Config::default().save_to(&config_path)?;
        eprintln!("Created default config at {}", config_path.display());
    }

    // Open in editor
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let status = ProcessCommand::new(&editor)
        .arg(&config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        eprintln!("Editor exited with non-zero status");
    }

    Ok(())
}
