//! Wiring of storage, transport, notifier, queues and scheduler.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::Router;
use tracing::{info, warn};

use crate::api::{self, state::AppState};
use crate::config::{EngineConfig, NotifierConfig, StorageConfig};
use crate::executor::TestExecutor;
use crate::handlers::standard_handlers;
use crate::notifier::auth::generate_signing_key;
use crate::notifier::{ConnectionRegistry, Ed25519TokenVerifier, Notifier, TokenVerifier};
use crate::probes::{HttpTransport, Transport};
use crate::queue::QueueManager;
use crate::scheduler::{self, Scheduler};
use crate::storage::{MemoryStore, SqliteStore, Store};

/// A running engine: queues with their handlers installed, ready to serve.
pub struct Engine {
    pub config: EngineConfig,
    pub store: Arc<dyn Store>,
    pub queues: Arc<QueueManager>,
    pub scheduler: Scheduler,
    pub notifier: Arc<Notifier>,
    pub executor: TestExecutor,
    started: Instant,
}

impl Engine {
    /// Build from configuration: opens storage and the HTTP transport.
    pub async fn build(config: EngineConfig) -> Result<Self> {
        let store = open_store(&config.storage)?;
        let transport: Arc<dyn Transport> = Arc::new(
            HttpTransport::new(config.executor.max_redirects)
                .context("Failed to build HTTP transport")?,
        );
        let verifier = load_verifier(&config.notifier)?;
        Self::with_parts(config, store, transport, verifier).await
    }

    /// Build around explicit collaborators.
    pub async fn with_parts(
        config: EngineConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Self> {
        let notifier = Arc::new(Notifier::new(
            verifier,
            ConnectionRegistry::new(),
            config.notifier.outbox_capacity,
        ));
        let executor = TestExecutor::new(transport.clone(), store.clone())
            .with_notifier(notifier.clone())
            .with_user_agent(config.executor.user_agent.clone());

        let queue_config = config.queues.clone();
        let queues = Arc::new(
            QueueManager::with_queues(|name| queue_config.get(name).clone())
                .await
                .context("Failed to create queues")?,
        );
        let handlers = standard_handlers(
            store.clone(),
            transport,
            executor.clone(),
            notifier.clone(),
            config.scheduler.alert_lookback(),
            &config.executor.user_agent,
        );
        queues
            .install(&handlers)
            .await
            .context("Failed to install job handlers")?;

        Ok(Self {
            config,
            store,
            queues,
            scheduler: Scheduler::new(),
            notifier,
            executor,
            started: Instant::now(),
        })
    }

    /// Register the built-in periodic tasks.
    pub async fn start_scheduler(&self) {
        scheduler::install_builtin(
            &self.scheduler,
            &self.config.scheduler,
            self.store.clone(),
            self.queues.clone(),
            self.started,
        )
        .await;
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            queues: self.queues.clone(),
            scheduler: self.scheduler.clone(),
            notifier: self.notifier.clone(),
        }
    }

    pub fn router(&self) -> Router {
        api::router(self.app_state())
    }

    /// Stop periodic tasks and queue workers. Jobs in flight finish.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.queues.shutdown();
        info!("Engine stopped");
    }
}

/// Start the TestFlow daemon: API server, websocket notifier, queues and scheduler.
pub async fn serve(config: EngineConfig) -> Result<()> {
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind))?;

    let engine = Engine::build(config).await?;
    engine.start_scheduler().await;
    let app = engine.router();

    info!(%addr, "TestFlow listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    engine.shutdown();
    Ok(())
}

/// SQLite at the configured path, or an in-process store for `""`/`:memory:`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn Store>> {
    if config.is_in_memory() {
        info!("Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if let Some(parent) = Path::new(&config.path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    info!(path = %config.path, "Initializing database");
    Ok(Arc::new(SqliteStore::open(&config.path)?))
}

/// Verifier for subscriber tokens. Without a configured key an ephemeral
/// one is generated, so no token can verify.
pub fn load_verifier(config: &NotifierConfig) -> Result<Arc<dyn TokenVerifier>> {
    match &config.verifying_key {
        Some(encoded) => Ok(Arc::new(
            Ed25519TokenVerifier::from_base64(encoded).context("Invalid notifier verifying key")?,
        )),
        None => {
            warn!("No notifier verifying key configured; websocket subscribers will be rejected");
            Ok(Arc::new(Ed25519TokenVerifier::new(
                generate_signing_key().verifying_key(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::auth::encode_key;
    use crate::queue::QueueName;

    #[test]
    fn test_open_store_in_memory_and_sqlite() {
        let memory = StorageConfig {
            path: ":memory:".into(),
        };
        assert!(open_store(&memory).is_ok());

        let dir = tempfile::TempDir::new().unwrap();
        let sqlite = StorageConfig {
            path: dir.path().join("nested/testflow.db").display().to_string(),
        };
        assert!(open_store(&sqlite).is_ok());
        assert!(dir.path().join("nested/testflow.db").exists());
    }

    #[test]
    fn test_load_verifier() {
        let key = generate_signing_key();
        let config = NotifierConfig {
            verifying_key: Some(encode_key(key.verifying_key().as_bytes())),
            ..NotifierConfig::default()
        };
        assert!(load_verifier(&config).is_ok());

        let bad = NotifierConfig {
            verifying_key: Some("not base64!".into()),
            ..NotifierConfig::default()
        };
        assert!(load_verifier(&bad).is_err());
        assert!(load_verifier(&NotifierConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_build_creates_every_queue() {
        let mut config = EngineConfig::default();
        config.storage.path = String::new();
        let engine = Engine::build(config).await.unwrap();
        assert_eq!(engine.queues.queue_names().await, QueueName::ALL.to_vec());
        engine.start_scheduler().await;
        assert_eq!(engine.scheduler.tasks().await.len(), 4);
        engine.shutdown();
    }
}
