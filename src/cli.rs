//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Human-in-the-loop security gateway for LLM tool access
#[derive(Parser, Debug)]
#[command(name = "hitl-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "HITL_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "HITL_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "HITL_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "HITL_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "HITL_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate the configuration, then print it as YAML
    CheckConfig,

    /// Exchange the service credential for a token naming another user
    ///
    /// Intended for automation harnesses. Prints the access token.
    Impersonate {
        /// Subject (user id or username) to act as
        #[arg(long, required = true)]
        subject: String,
    },
}
