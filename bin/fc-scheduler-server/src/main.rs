//! FlowCatalyst Dispatch Scheduler Server
//!
//! Polls persisted dispatch jobs and publishes them onto the same broker the
//! message router consumes from. Broker selection follows `[queue].type`,
//! same as `fc-router`. Dispatch job persistence goes through a
//! `DispatchJobRepository`; this binary wires the SQLite reference
//! implementation against `data_dir`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{routing::get, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use fc_config::AppConfig;
use fc_scheduler::{
    DispatchScheduler, MessagePointer, QueueMessage, QueuePublisher as SchedulerQueuePublisher,
    SchedulerConfig, SchedulerError, SqliteDispatchJobRepository,
};
use serde::Serialize;
use tracing::info;

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    scheduler_running: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    fc_common::logging::init_logging("fc-scheduler-server");

    info!("Starting FlowCatalyst Dispatch Scheduler");

    let config = AppConfig::load().context("failed to load configuration")?;
    info!(
        enabled = config.scheduler.enabled,
        poll_interval_ms = config.scheduler.poll_interval_ms,
        queue_type = %config.queue.queue_type,
        "Scheduler configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let repository = Arc::new(build_repository(&config).await?);
    let queue_publisher = build_publisher(&config).await?;

    let scheduler_config = SchedulerConfig {
        enabled: config.scheduler.enabled,
        poll_interval: std::time::Duration::from_millis(config.scheduler.poll_interval_ms),
        batch_size: config.scheduler.batch_size,
        stale_threshold: std::time::Duration::from_secs(config.scheduler.stale_threshold_minutes * 60),
        default_dispatch_mode: config.scheduler.default_dispatch_mode.as_str().into(),
        default_pool_code: "default".to_string(),
        processing_endpoint: format!("http://localhost:{}/api/router/process", config.http.port),
        app_key: if config.scheduler.app_key.is_empty() { None } else { Some(config.scheduler.app_key.clone()) },
        max_concurrent_dispatches: 20,
    };

    let scheduler = Arc::new(DispatchScheduler::new(scheduler_config, repository, queue_publisher));
    scheduler.start().await;

    let scheduler_clone = scheduler.clone();
    let app = Router::new()
        .route("/q/health", get(move || {
            let s = scheduler_clone.clone();
            async move {
                let running = s.is_running().await;
                Json(HealthResponse { status: if running { "UP".to_string() } else { "DOWN".to_string() }, scheduler_running: running })
            }
        }))
        .route("/q/health/live", get(|| async { Json(serde_json::json!({"status": "UP"})) }))
        .route("/q/health/ready", get(|| async { Json(serde_json::json!({"status": "UP"})) }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http.port));
    info!(?addr, "HTTP server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    info!("Scheduler server stopped");
    Ok(())
}

async fn shutdown_signal(scheduler: Arc<DispatchScheduler>) {
    tokio::signal::ctrl_c().await.expect("Failed to install CTRL+C handler");
    info!("Shutdown signal received");
    scheduler.stop().await;
}

/// Build the dispatch-job repository. Local/dev scale uses an on-disk SQLite
/// database under `data_dir`; a production deployment supplies its own
/// `DispatchJobRepository` implementation against its platform database.
async fn build_repository(config: &AppConfig) -> Result<SqliteDispatchJobRepository> {
    let db_path = std::path::Path::new(&config.data_dir).join("dispatch_jobs.sqlite");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .context("failed to open dispatch job database")?;

    let repository = SqliteDispatchJobRepository::new(pool);
    repository
        .init_schema()
        .await
        .context("failed to initialize dispatch_jobs schema")?;
    Ok(repository)
}

/// Build the queue publisher for the configured broker type, matching
/// `fc-router`'s broker selection so dispatched pointers land where the
/// router's consumer polls from.
async fn build_publisher(config: &AppConfig) -> Result<Arc<dyn SchedulerQueuePublisher>> {
    match config.queue.queue_type.as_str() {
        "embedded" => {
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
            fc_queue::EmbeddedQueue::init_schema(&queue).await?;
            Ok(Arc::new(BrokerPublisher::new(Arc::new(queue))))
        }
        "sqs" => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_sqs::Client::new(&aws_config);
            let publisher = Arc::new(SqsPublisher::new(client, config.queue.sqs.queue_url.clone()));
            Ok(Arc::new(BrokerPublisher::new(publisher)))
        }
        "activemq" => {
            let amq_config = fc_queue::activemq::ActiveMqConfig {
                uri: config.queue.activemq.uri.clone(),
                queue_name: config.queue.activemq.queue_name.clone(),
                prefetch_count: config.queue.activemq.prefetch_count,
                durable: config.queue.activemq.durable,
                ..fc_queue::activemq::ActiveMqConfig::default()
            };
            let publisher = Arc::new(fc_queue::activemq::ActiveMqPublisher::new(amq_config).await?);
            Ok(Arc::new(BrokerPublisher::new(publisher)))
        }
        "nats" => {
            let nats_config = fc_queue::nats::NatsConfig {
                url: config.queue.nats.url.clone(),
                stream_name: config.queue.nats.stream_name.clone(),
                consumer_name: config.queue.nats.consumer_name.clone(),
                subject: config.queue.nats.subject.clone(),
                ack_wait_seconds: config.queue.nats.ack_wait_seconds,
            };
            let publisher = Arc::new(fc_queue::nats::NatsPublisher::new(nats_config).await?);
            Ok(Arc::new(BrokerPublisher::new(publisher)))
        }
        other => Err(anyhow::anyhow!("unknown queue type: {other} (expected embedded, sqs, activemq, or nats)")),
    }
}

/// Adapts any `fc_queue::QueuePublisher` broker into `fc_scheduler`'s own
/// publisher trait, recovering the `MessagePointer` fields the scheduler
/// serialized into `QueueMessage::body` and re-expressing them as the wire
/// `fc_common::Message` the router's consumer expects.
struct BrokerPublisher {
    inner: Arc<dyn fc_queue::QueuePublisher>,
}

impl BrokerPublisher {
    fn new(inner: Arc<dyn fc_queue::QueuePublisher>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl SchedulerQueuePublisher for BrokerPublisher {
    async fn publish(&self, message: QueueMessage) -> Result<(), SchedulerError> {
        let pointer: MessagePointer = serde_json::from_str(&message.body)?;

        let wire_message = fc_common::Message {
            id: message.id,
            pool_code: pointer.dispatch_pool_id,
            auth_token: Some(pointer.auth_token),
            signing_secret: None,
            mediation_type: fc_common::MediationType::HTTP,
            mediation_target: pointer.processing_endpoint,
            message_group_id: message.message_group,
        };

        self.inner
            .publish(wire_message)
            .await
            .map(|_| ())
            .map_err(|e| SchedulerError::QueueError(e.to_string()))
    }

    fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }
}

// Simple SQS publisher, mirroring fc-router's own adapter.
use fc_common::Message;
use fc_queue::QueueError;

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
impl fc_queue::QueuePublisher for SqsPublisher {
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
