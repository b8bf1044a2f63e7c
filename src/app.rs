//! Wiring: turns a [`Config`] into running services.

use crate::config::Config;
use crate::consensus::ConsensusChecker;
use crate::gateway::{CredentialStore, Gateway, IdempotencyLedger};
use crate::notify::NotificationDispatcher;
use crate::queue::{JobQueue, MemoryQueue};
use crate::redact::Redactor;
use crate::router::{AiRouter, ProviderRegistry};
use crate::server;
use crate::store::{MemoryStore, MetadataStore};
use crate::worker::{JobProcessor, RetentionSweep, WorkerPool};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared handles for the gateway and the worker pool.
pub struct Services {
    pub gateway: Arc<Gateway>,
    pub processor: Arc<JobProcessor>,
    pub store: Arc<dyn MetadataStore>,
    pub ledger: Arc<IdempotencyLedger>,
}

impl Services {
    /// Build every service with HTTP providers and the configured notifier.
    pub fn build(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        let registry = ProviderRegistry::from_config(&config.providers, &http_client);
        let dispatcher = NotificationDispatcher::from_config(&config.notify, &http_client)?;
        Self::assemble(config, registry, dispatcher)
    }

    /// Build every service around an existing provider registry and dispatcher.
    pub fn assemble(
        config: &Config,
        registry: ProviderRegistry,
        dispatcher: NotificationDispatcher,
    ) -> Result<Self> {
        let redactor = Arc::new(
            Redactor::from_config(&config.redaction).context("Failed to load redaction rules")?,
        );

        let credentials = CredentialStore::from_config(&config.credentials)?;
        if credentials.is_empty() {
            warn!("No credentials configured, every ingest request will be rejected");
        }

        let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new(
            config.worker.queue_capacity,
            config.worker.visibility_timeout(),
        ));
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::with_capacity(config.worker.max_stored_events));
        let ledger = Arc::new(IdempotencyLedger::new(Duration::from_secs(
            config.server.idempotency_retention_seconds,
        )));

        let consensus = if config.consensus.enabled {
            let mut voters = Vec::with_capacity(config.consensus.providers.len());
            for name in &config.consensus.providers {
                match registry.by_name(name) {
                    Some(provider) => voters.push(provider),
                    None => bail!("consensus provider '{}' is not configured", name),
                }
            }
            Some(ConsensusChecker::new(voters, &config.consensus))
        } else {
            None
        };

        if registry.is_empty() {
            warn!("No completion providers configured, every event will be stored as degraded");
        }
        info!(
            apps = credentials.len(),
            providers = registry.len(),
            consensus = consensus.is_some(),
            "Services assembled"
        );

        let gateway = Arc::new(Gateway::new(
            credentials,
            Arc::clone(&ledger),
            Arc::clone(&redactor),
            Arc::clone(&queue),
            Arc::clone(&store),
        ));

        let processor = Arc::new(JobProcessor {
            queue,
            store: Arc::clone(&store),
            router: AiRouter::new(registry),
            consensus,
            consensus_config: config.consensus.clone(),
            redactor,
            dispatcher,
            max_attempts: config.worker.max_attempts,
        });

        Ok(Self {
            gateway,
            processor,
            store,
            ledger,
        })
    }

    /// Start the analysis workers and the retention sweep.
    pub fn start_workers(&self, config: &Config) -> WorkerPool {
        let mut pool = WorkerPool::start(
            Arc::clone(&self.processor),
            config.worker.concurrency,
            config.worker.poll_interval(),
        );
        pool.spawn_sweep(RetentionSweep {
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            retention: config.worker.retention(),
            interval: config.worker.cleanup_interval(),
        });
        pool
    }
}

/// Run the gateway and the workers until Ctrl-C.
pub async fn serve(config: Config) -> Result<()> {
    let services = Services::build(&config)?;
    let pool = services.start_workers(&config);

    let app = server::router(Arc::clone(&services.gateway), config.server.max_body_bytes);
    let queue = Arc::clone(&services.processor.queue);
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Gateway listening on {}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            // In-flight ingests now fail with a retryable 503.
            queue.close().await;
        })
        .await
        .context("HTTP server failed")?;

    pool.shutdown().await;
    Ok(())
}
