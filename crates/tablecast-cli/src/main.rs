//! tablecast CLI
//!
//! Command-line interface for tablecast - serve, watch, and inspect live tables.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tablecast_core::Config;

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tablecast")]
#[command(about = "tablecast - live change capture and fan-out for tabular files")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file (defaults to ~/.config/tablecast/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve {
        /// WebSocket listen address
        #[arg(long)]
        ws_addr: Option<String>,
        /// HTTP listen address
        #[arg(long)]
        http_addr: Option<String>,
        /// Extra data source as <id>=<path> (repeatable)
        #[arg(short, long)]
        source: Vec<String>,
    },
    /// Subscribe to a data source and print updates
    Watch {
        /// Data source ID
        source: String,
        /// Collection ID echoed back in updates
        #[arg(short, long, default_value = "cli")]
        collection: String,
        /// Ask the server to poll the source every N milliseconds
        #[arg(long)]
        interval: Option<u64>,
        /// WebSocket URL (defaults to client.server_url)
        #[arg(long)]
        url: Option<String>,
    },
    /// Upload a file as a new data source
    Upload {
        /// File to upload
        file: PathBuf,
        /// API base URL (defaults to client.api_url)
        #[arg(long)]
        api: Option<String>,
    },
    /// Print the current table of a data source
    Snapshot {
        /// Data source ID
        source: String,
        /// API base URL (defaults to client.api_url)
        #[arg(long)]
        api: Option<String>,
    },
    /// List data sources on the server
    #[command(alias = "ls")]
    Sources {
        /// API base URL (defaults to client.api_url)
        #[arg(long)]
        api: Option<String>,
    },
    /// Parse a file locally, or diff it against another
    Parse {
        /// File to parse
        file: PathBuf,
        /// Show the changes from FILE to this file
        #[arg(long)]
        diff: Option<PathBuf>,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, log_level, server.ws_addr, client.server_url, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands load the file themselves so a broken file can be fixed
    if let Commands::Config { command } = &cli.command {
        return match command.clone() {
            Some(ConfigCommands::Show) | None => commands::config::show(cli.config.as_ref(), &output),
            Some(ConfigCommands::Set { key, value }) => {
                commands::config::set(key, value, cli.config.as_ref(), &output)
            }
        };
    }

    let config = Config::load_with_cli_override(cli.config.as_ref())?;
    init_logging(&config);

    match cli.command {
        Commands::Serve {
            ws_addr,
            http_addr,
            source,
        } => commands::serve::run(&config, ws_addr, http_addr, source, &output).await,
        Commands::Watch {
            source,
            collection,
            interval,
            url,
        } => commands::watch::run(&config, source, collection, interval, url, &output).await,
        Commands::Upload { file, api } => {
            let api = api.unwrap_or_else(|| config.client.api_url.clone());
            commands::upload::run(&api, &file, &output).await
        }
        Commands::Snapshot { source, api } => {
            let api = api.unwrap_or_else(|| config.client.api_url.clone());
            commands::snapshot::run(&api, &source, &output).await
        }
        Commands::Sources { api } => {
            let api = api.unwrap_or_else(|| config.client.api_url.clone());
            commands::sources::list(&api, &output).await
        }
        Commands::Parse { file, diff } => {
            commands::parse::run(&config, &file, diff.as_deref(), &output)
        }
        Commands::Config { .. } => Ok(()),
    }
}

/// Initialize logging to stderr, or to the configured log file
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(config: &Config) {
    let level = &config.log_level;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tablecast_core={},tablecast_cli={}", level, level))
    });

    let Some(log_path) = config.log_file.as_ref() else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let log_file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            return;
        }
    };

    // Initialize file-based logging (ignore error if already initialized)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(Mutex::new(log_file))
        .try_init();
}
