//! HITL Gateway - human-in-the-loop security gateway for LLM tool access

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use hitl_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    identity::{ServiceCredential, TokenExchangeClient},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => check_config(config),
        Some(Command::Impersonate { subject }) => impersonate(&config, &subject).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Print the resolved configuration with secrets masked
fn check_config(mut config: Config) -> ExitCode {
    if config.token_exchange.client_secret.is_some() {
        config.token_exchange.client_secret = Some("<redacted>".to_string());
    }
    match serde_yaml::to_string(&config) {
        Ok(yaml) => {
            println!("{yaml}");
            eprintln!(
                "Configuration OK ({} domain(s), {} role matrix entries)",
                config.domains.len(),
                config.roles.domains.len()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Exchange the service credential for a token naming `subject`
async fn impersonate(config: &Config, subject: &str) -> ExitCode {
    if !config.token_exchange.enabled {
        error!("token_exchange.enabled is false");
        return ExitCode::FAILURE;
    }

    match exchange(config, subject).await {
        Ok(token) => {
            info!(subject, "Token exchange succeeded");
            println!("{token}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(subject, code = e.code(), "Token exchange failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn exchange(config: &Config, subject: &str) -> hitl_gateway::Result<String> {
    let credential = ServiceCredential::from_config(&config.token_exchange)?;
    let client = TokenExchangeClient::new(&config.identity, &config.token_exchange)?;
    client.exchange_for_subject(&credential, subject).await
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        domains = config.domains.len(),
        "Starting HITL Gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
