//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::domain::{DomainRegistry, DomainService};
use super::router::{AppState, create_router};
use crate::audit::AuditSink;
use crate::config::Config;
use crate::confirmation::{ConfirmationMachine, store_from_config};
use crate::defense::{PromptDefense, spawn_delimiter_sweeper};
use crate::identity::TokenValidator;
use crate::policy::RolePolicyEngine;
use crate::{Error, Result};

/// Gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared request state
    state: Arc<AppState>,
    /// Stops background tasks
    shutdown_tx: broadcast::Sender<()>,
}

impl Gateway {
    /// Create a new gateway
    ///
    /// Background tasks (audit forwarding, confirmation reaping, delimiter
    /// sweeping) start here and stop when the gateway shuts down.
    pub async fn new(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        let audit = AuditSink::from_config(&config.audit, shutdown_tx.subscribe());
        let validator = Arc::new(TokenValidator::new(&config.identity)?);
        let policy = Arc::new(RolePolicyEngine::from_config(&config.roles)?);

        let defense = Arc::new(PromptDefense::from_config(&config.defense)?.with_audit(audit.clone()));
        spawn_delimiter_sweeper(
            Arc::clone(&defense),
            config.defense.delimiter_ttl,
            shutdown_tx.subscribe(),
        );

        let store = store_from_config(&config.confirmation, shutdown_tx.subscribe()).await?;
        let mut domains = DomainRegistry::new();
        for (name, domain_config) in &config.domains {
            let machine = ConfirmationMachine::new(Arc::clone(&store), &config.confirmation)
                .with_audit(audit.clone());
            domains.register(DomainService::from_config(
                name.clone(),
                domain_config,
                machine,
                config.server.request_timeout,
            )?);
        }

        let state = Arc::new(AppState {
            validator,
            policy,
            domains: Arc::new(domains),
            defense,
            audit,
        });

        Ok(Self {
            config,
            state,
            shutdown_tx,
        })
    }

    /// The HTTP router, without binding a socket.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), &self.config.server)
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("HITL GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(issuer = %self.config.identity.issuer, audience = %self.config.identity.audience, "Identity provider");
        info!(
            backend = ?self.config.confirmation.backend,
            ttl = ?self.config.confirmation.ttl,
            "Confirmation store"
        );
        for (name, domain) in &self.config.domains {
            let sensitive = domain.tools.iter().filter(|t| t.sensitive).count();
            info!(
                "  /v1/tools/{name}/*  ({} tools, {sensitive} require confirmation)",
                domain.tools.len()
            );
        }
        if self.config.roles.production {
            info!("Production mode: superuser bypass refused for automation identities");
        }
        info!("============================================================");

        let mut drained = self.shutdown_tx.subscribe();
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(self.shutdown_tx.clone()));

        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                let _ = drained.recv().await;
                tokio::time::sleep(shutdown_timeout).await;
            } => {
                warn!(timeout = ?shutdown_timeout, "In-flight requests did not drain in time");
            }
        }

        info!("Gateway stopped");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
