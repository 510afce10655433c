//! FlowCatalyst Production Router
//!
//! Consumes messages from the configured broker and routes them through the
//! processing pipeline. Provides an HTTP monitoring surface for health, queue
//! and pool stats, warnings, and circuit breakers.
//!
//! ## Broker Selection
//!
//! The active broker is selected by `[queue].type` in the TOML configuration
//! (or `FLOWCATALYST_QUEUE_TYPE`): `embedded` (SQLite-backed, for local/dev
//! use), `sqs`, `activemq`, or `nats`.
//!
//! ## Active/Standby HA
//!
//! Uses Redis-based leader election for high availability. Only the leader
//! processes messages. Enable with `[router.standby].enabled = true`.

use std::sync::Arc;
use std::time::Duration;
use fc_router::{
    QueueManager, HttpMediator, HttpMediatorConfig, HttpVersion,
    LifecycleManager, LifecycleConfig,
    WarningService, WarningServiceConfig,
    HealthService, HealthServiceConfig,
    CircuitBreakerRegistry, CircuitBreakerConfig,
    StandbyProcessor, StandbyRouterConfig,
    api::create_router,
};
use fc_config::AppConfig;
use fc_queue::{QueueConsumer, QueuePublisher};
use anyhow::{Context, Result};
use tracing::{info, warn, error};
use tokio::{signal, net::TcpListener};
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    fc_common::logging::init_logging("fc-router");

    info!("Starting FlowCatalyst Message Router");

    // 1. Load configuration
    let config = AppConfig::load().context("failed to load configuration")?;

    // 2. Initialize Warning and Health Services
    let warning_service = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health_service = Arc::new(HealthService::new(
        HealthServiceConfig::default(),
        warning_service.clone(),
    ));

    // 3. Initialize Mediator. The circuit breaker registry is shared with the
    // monitoring API below so `/monitoring/circuit-breakers` reports the same
    // per-target state the mediation path actually guards requests with.
    let mediator_config = HttpMediatorConfig {
        timeout: Duration::from_millis(config.router.timeout_ms),
        http_version: if config.dev_mode { HttpVersion::Http1 } else { HttpVersion::Http2 },
        circuit_breaker_window_size: config.router.circuit_breaker_window_size,
        circuit_breaker_failure_rate: (config.router.circuit_breaker_threshold as f64 / config.router.circuit_breaker_window_size.max(1) as f64).min(1.0),
        circuit_breaker_timeout: Duration::from_secs(config.router.circuit_breaker_reset_secs),
        ..HttpMediatorConfig::default()
    };
    let circuit_breaker_registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
        window_size: mediator_config.circuit_breaker_window_size,
        failure_rate_threshold: mediator_config.circuit_breaker_failure_rate,
        reset_timeout: mediator_config.circuit_breaker_timeout,
    }));
    let mediator = Arc::new(HttpMediator::with_registry(mediator_config, circuit_breaker_registry.clone()));

    // 4. Create QueueManager
    let queue_manager = Arc::new(QueueManager::new(mediator.clone()));

    // 5. Initialize Standby Processor (Active/Passive HA)
    let standby_config = load_standby_config(&config);
    let standby = if standby_config.enabled {
        info!(
            redis_url = %standby_config.redis_url,
            lock_key = %standby_config.lock_key,
            "Initializing standby mode (Active/Passive HA)"
        );
        match StandbyProcessor::new(standby_config).await {
            Ok(processor) => {
                if let Err(e) = processor.start().await {
                    error!(error = %e, "Failed to start standby processor");
                    return Err(anyhow::anyhow!("Standby processor failed to start: {}", e));
                }
                Some(Arc::new(processor))
            }
            Err(e) => {
                error!(error = %e, "Failed to create standby processor");
                return Err(anyhow::anyhow!("Standby processor creation failed: {}", e));
            }
        }
    } else {
        info!("Standby mode disabled - this instance will always be active");
        None
    };

    // 6. Wait for leadership if in standby mode
    if let Some(ref standby_proc) = standby {
        if !standby_proc.is_leader() {
            info!("Waiting to become leader before starting message processing...");
            standby_proc.wait_for_leadership().await;
            info!("Acquired leadership - starting message processing");
        }
    }

    // 7. Build the broker consumer/publisher pair for the configured queue type
    let (consumer, publisher): (Arc<dyn QueueConsumer + Send + Sync>, Arc<dyn QueuePublisher + Send + Sync>) =
        build_broker(&config).await?;

    queue_manager.add_consumer(consumer).await;

    // 8. Start lifecycle manager with all features
    let lifecycle = LifecycleManager::start_with_features(
        queue_manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        LifecycleConfig::default(),
        standby.clone(),
    );

    // 9. Setup HTTP API server
    let app = create_router(
        queue_manager.clone(),
        warning_service.clone(),
        health_service.clone(),
        circuit_breaker_registry,
    )
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("{}:{}", config.http.host, config.http.port);
    info!(addr = %addr, "Starting HTTP API server");

    let listener = TcpListener::bind(&addr).await?;
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // publisher is kept alive for the lifetime of the process even though no
    // HTTP endpoint currently re-exposes it; dropping it would close broker
    // connections that future dispatch-triggered publishes rely on.
    let _publisher = publisher;

    // 10. Start QueueManager in background (respecting standby status)
    let (manager_shutdown_tx, mut manager_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let manager_handle = {
        let manager = queue_manager.clone();
        let standby_for_loop = standby.clone();

        tokio::spawn(async move {
            if let Some(ref standby_proc) = standby_for_loop {
                loop {
                    tokio::select! {
                        _ = &mut manager_shutdown_rx => {
                            info!("Manager loop received shutdown signal");
                            break;
                        }
                        _ = async {
                            if standby_proc.should_process() {
                                info!("Leader status confirmed - starting message consumption");
                                if let Err(e) = manager.clone().start().await {
                                    error!("QueueManager error: {}", e);
                                }
                                if !standby_proc.should_process() {
                                    warn!("Lost leadership during processing - pausing");
                                    standby_proc.wait_for_leadership().await;
                                    info!("Re-acquired leadership - resuming");
                                }
                            } else {
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        } => {}
                    }
                }
            } else {
                if let Err(e) = manager.clone().start().await {
                    error!("QueueManager error: {}", e);
                }
            }
        })
    };

    log_startup_summary(&config, &lifecycle);

    info!("FlowCatalyst Router started. Press Ctrl+C to shutdown.");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = manager_shutdown_tx.send(());

    lifecycle.shutdown().await;
    queue_manager.shutdown().await;

    server_task.abort();

    match tokio::time::timeout(std::time::Duration::from_secs(30), manager_handle).await {
        Ok(_) => info!("Manager task completed gracefully"),
        Err(_) => {
            warn!("Manager task did not complete within 30s timeout");
        }
    }

    info!("FlowCatalyst Router shutdown complete");
    Ok(())
}

/// Build the consumer/publisher pair for the configured queue type.
async fn build_broker(config: &AppConfig) -> Result<(Arc<dyn QueueConsumer + Send + Sync>, Arc<dyn QueuePublisher + Send + Sync>)> {
    match config.queue.queue_type.as_str() {
        "embedded" => {
            std::fs::create_dir_all(&config.data_dir)?;
            let db_path = std::path::Path::new(&config.data_dir).join("queue.sqlite");
            let url = format!("sqlite://{}?mode=rwc", db_path.display());
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await
                .context("failed to open embedded queue database")?;
            let queue = fc_queue::sqlite::SqliteQueue::new(
                pool,
                "flowcatalyst".to_string(),
                config.queue.sqs.visibility_timeout,
            );
            fc_queue::EmbeddedQueue::init_schema(&queue)
                .await
                .context("failed to initialize embedded queue schema")?;
            let queue = Arc::new(queue);
            Ok((queue.clone(), queue))
        }
        "sqs" => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_sqs::Client::new(&aws_config);
            let consumer = Arc::new(fc_queue::sqs::SqsQueueConsumer::from_queue_url(
                client.clone(),
                config.queue.sqs.queue_url.clone(),
                config.queue.sqs.visibility_timeout as i32,
            ).await);
            let publisher = Arc::new(SqsPublisher::new(client, config.queue.sqs.queue_url.clone()));
            Ok((consumer, publisher))
        }
        "activemq" => {
            let amq_config = fc_queue::activemq::ActiveMqConfig {
                uri: config.queue.activemq.uri.clone(),
                queue_name: config.queue.activemq.queue_name.clone(),
                prefetch_count: config.queue.activemq.prefetch_count,
                durable: config.queue.activemq.durable,
                ..fc_queue::activemq::ActiveMqConfig::default()
            };
            let consumer = Arc::new(fc_queue::activemq::ActiveMqConsumer::new(amq_config.clone()).await?);
            let publisher = Arc::new(fc_queue::activemq::ActiveMqPublisher::new(amq_config).await?);
            Ok((consumer, publisher))
        }
        "nats" => {
            let nats_config = fc_queue::nats::NatsConfig {
                url: config.queue.nats.url.clone(),
                stream_name: config.queue.nats.stream_name.clone(),
                consumer_name: config.queue.nats.consumer_name.clone(),
                subject: config.queue.nats.subject.clone(),
                ack_wait_seconds: config.queue.nats.ack_wait_seconds,
            };
            let consumer = Arc::new(fc_queue::nats::NatsConsumer::new(nats_config.clone()).await?);
            let publisher = Arc::new(fc_queue::nats::NatsPublisher::new(nats_config).await?);
            Ok((consumer, publisher))
        }
        other => Err(anyhow::anyhow!("unknown queue type: {other} (expected embedded, sqs, activemq, or nats)")),
    }
}

/// Load standby configuration, preferring config-file values with environment overrides
/// already applied by `AppConfig::load`.
fn load_standby_config(config: &AppConfig) -> StandbyRouterConfig {
    let settings = &config.router.standby;
    let redis_url = if settings.redis_url.is_empty() {
        config.redis.url.clone()
    } else {
        settings.redis_url.clone()
    };

    let instance_id = std::env::var("FLOWCATALYST_INSTANCE_ID")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default();

    StandbyRouterConfig {
        enabled: settings.enabled,
        redis_url,
        lock_key: settings.lock_key.clone(),
        lock_ttl_seconds: settings.lock_ttl_seconds,
        heartbeat_interval_seconds: settings.heartbeat_interval_seconds,
        instance_id,
    }
}

/// Log startup summary
fn log_startup_summary(config: &AppConfig, lifecycle: &LifecycleManager) {
    info!("=== FlowCatalyst Router Startup Summary ===");
    info!("  Queue type: {}", config.queue.queue_type);

    if lifecycle.is_leader() {
        info!("  Mode: ACTIVE (processing messages)");
    } else {
        info!("  Mode: STANDBY (waiting for leadership)");
    }

    if lifecycle.standby().is_some() {
        info!("  HA: Enabled (Active/Standby with Redis leader election)");
    } else {
        info!("  HA: Disabled (single instance mode)");
    }

    info!("==========================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

// Simple SQS publisher implementation
use async_trait::async_trait;
use fc_queue::QueueError;
use fc_common::Message;

struct SqsPublisher {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsPublisher {
    fn new(client: aws_sdk_sqs::Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }
}

#[async_trait]
impl QueuePublisher for SqsPublisher {
    fn identifier(&self) -> &str {
        &self.queue_url
    }

    async fn publish(&self, message: Message) -> fc_queue::Result<String> {
        let message_id = message.id.clone();
        let body = serde_json::to_string(&message)?;

        let mut request = self.client.send_message()
            .queue_url(&self.queue_url)
            .message_body(body);

        if self.queue_url.ends_with(".fifo") {
            let group_id = message.message_group_id.clone()
                .unwrap_or_else(|| "default".to_string());
            request = request
                .message_group_id(group_id)
                .message_deduplication_id(&message_id);
        }

        request.send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        Ok(message_id)
    }

    async fn publish_batch(&self, messages: Vec<Message>) -> fc_queue::Result<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let id = self.publish(message).await?;
            ids.push(id);
        }
        Ok(ids)
    }
}
