// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{fmt, EnvFilter};

use fetchhub::config::{self, Config};
use fetchhub::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

/// fetchhub - download jobs for aria2 and the model hub behind one HTTP API.
#[derive(Parser)]
#[command(name = "fetchhub")]
#[command(version = VERSION)]
#[command(about = "Download-job manager: aria2 RPC and model-hub backends behind one HTTP API.")]
#[command(long_about = "fetchhub - download-job manager\n\n\
    Start the server:    fetchhub\n\
    Custom port:         fetchhub serve --port 9000\n\
    Show config:         fetchhub config show\n\n\
    The aria2 daemon is started on demand the first time a URL is submitted.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose mode: debug-level logs
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default)
    ///
    /// Examples:
    ///   fetchhub serve
    ///   fetchhub serve --port 9000
    ///   fetchhub serve --bind 0.0.0.0
    Serve {
        /// Port to listen on (overrides config and FETCHHUB_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind to (overrides config and FETCHHUB_BIND)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// View or change configuration
    ///
    /// Examples:
    ///   fetchhub config show
    ///   fetchhub config path
    ///   fetchhub config set-port 9000
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration (file + environment)
    Show,

    /// Print the config file location
    Path,

    /// Change the server port in the config file
    ///
    /// Example:
    ///   fetchhub config set-port 9000
    SetPort {
        port: u16,
    },

    /// Change the aria2 RPC endpoint in the config file
    ///
    /// Example:
    ///   fetchhub config set-rpc http://127.0.0.1:6801/jsonrpc
    SetRpc {
        url: String,
    },

    /// Store a default model-hub token in the config file
    ///
    /// Example:
    ///   fetchhub config set-hub-token hf_xxx
    SetHubToken {
        token: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "fetchhub=debug,tower_http=debug"
    } else {
        "fetchhub=info,tower_http=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        None => serve(None, None).await,
        Some(Commands::Serve { port, bind }) => serve(port, bind).await,
        Some(Commands::Config { command }) => handle_config(command),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "[X]".red(), e);
        let code = if e.downcast_ref::<ConfigLoadError>().is_some() {
            exit_codes::CONFIG
        } else {
            exit_codes::ERROR
        };
        std::process::exit(code);
    }
}

/// Marks failures that come from reading configuration.
#[derive(Debug, thiserror::Error)]
#[error("Failed to load configuration: {0:#}")]
struct ConfigLoadError(anyhow::Error);

fn load_config() -> Result<Config> {
    config::load_config().map_err(|e| ConfigLoadError(e).into())
}

async fn serve(port: Option<u16>, bind: Option<String>) -> Result<()> {
    let config = load_config()?;

    let mut server = Server::new(config);
    if let Some(port) = port {
        server = server.with_port(port);
    }
    if let Some(bind) = bind {
        server = server.with_bind_address(bind);
    }

    println!(
        "{} fetchhub {} listening on port {}",
        "[OK]".green(),
        VERSION,
        server.port()
    );
    server.start().await
}

fn handle_config(command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = load_config()?.redacted();
            println!();
            println!("{}", "=== fetchhub Configuration ===".cyan().bold());
            println!();
            println!("  Port:          {}", config.port);
            println!("  Bind:          {}", config.bind_address);
            println!("  aria2 RPC:     {}", config.aria2_rpc_url);
            println!("  aria2 secret:  {}", config.aria2_secret);
            println!("  aria2 binary:  {}", config.aria2_binary());
            println!("  Hub endpoint:  {}", config.hub_endpoint);
            println!(
                "  Hub token:     {}",
                config
                    .hub_token
                    .clone()
                    .unwrap_or_else(|| "(not set)".dimmed().to_string())
            );
            println!();
            println!("  Config file:   {}", config::config_path()?.display());
            println!();
        }
        Some(ConfigCommands::Path) => {
            println!("{}", config::config_path()?.display());
        }
        Some(ConfigCommands::SetPort { port }) => {
            update_file_config(|c| c.port = port)?;
            println!("{} Port set to {}", "[OK]".green(), port);
        }
        Some(ConfigCommands::SetRpc { url }) => {
            url::Url::parse(&url).with_context(|| format!("Not a valid URL: {}", url))?;
            update_file_config(|c| c.aria2_rpc_url = url.clone())?;
            println!("{} aria2 RPC endpoint set to {}", "[OK]".green(), url);
        }
        Some(ConfigCommands::SetHubToken { token }) => {
            update_file_config(|c| c.hub_token = Some(token.trim().to_string()))?;
            println!("{} Hub token saved", "[OK]".green());
        }
    }
    Ok(())
}

/// Edit the config file only; environment overrides are not persisted.
fn update_file_config(edit: impl FnOnce(&mut Config)) -> Result<()> {
    let path = config::config_path()?;
    let mut file_config = config::load_config_from(&path).map_err(ConfigLoadError)?;
    edit(&mut file_config);
    config::save_config(&file_config)
}
