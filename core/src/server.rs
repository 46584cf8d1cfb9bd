/// Server process: the TCP broker and the credential endpoint around one hub
use crate::auth_api::AuthApi;
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::realtime::broker::Broker;
use crate::realtime::Hub;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

pub struct Server {
    config: Config,
    hub: Arc<Hub>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let hub = Hub::from_config(&config);
        Self { config, hub }
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    /// Serve until Ctrl+C / SIGTERM or until either listener fails
    pub async fn start(&self) -> Result<()> {
        let broker = Arc::new(Broker::new(self.hub.clone(), &self.config));
        let mut broker_task = tokio::spawn(broker.start(self.config.broker_listen_addr));
        let mut auth_task = tokio::spawn(AuthApi::from_config(&self.config).start(self.config.http_addr));

        let outcome = tokio::select! {
            result = &mut broker_task => listener_exit("broker", result),
            result = &mut auth_task => listener_exit("credential endpoint", result),
            _ = wait_for_shutdown() => Ok(()),
        };

        broker_task.abort();
        auth_task.abort();
        info!("Server stopped");
        outcome
    }
}

fn listener_exit(name: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("{} stopped: {}", name, e);
            Err(e)
        }
        Err(e) => Err(ChatError::Transport(format!("{} task failed: {}", name, e))),
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
