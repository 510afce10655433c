//! Mediator - HTTP-based message delivery
//!
//! - HTTP POST to mediation target
//! - Auth token handling
//! - HMAC-SHA256 webhook signing (X-FlowCatalyst-Signature, X-FlowCatalyst-Timestamp)
//! - Response code classification
//! - Retry with exponential backoff
//! - Sliding-window circuit breaker
//! - Custom delay parsing from response

use async_trait::async_trait;
use chrono::Utc;
use fc_common::{Message, MediationType, MediationResult, MediationOutcome, WarningCategory, WarningSeverity};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, error, debug};

use crate::circuit_breaker_registry::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerState};
use crate::warning::WarningService;

/// FlowCatalyst webhook signature header
pub const SIGNATURE_HEADER: &str = "X-FlowCatalyst-Signature";
/// FlowCatalyst webhook timestamp header (unix-seconds integer)
pub const TIMESTAMP_HEADER: &str = "X-FlowCatalyst-Timestamp";
/// Message id header sent on every mediation request
pub const MESSAGE_ID_HEADER: &str = "X-FlowCatalyst-MessageId";
/// Message group header sent on every mediation request
pub const MESSAGE_GROUP_HEADER: &str = "X-FlowCatalyst-MessageGroup";

type HmacSha256 = Hmac<Sha256>;

/// Generate an HMAC-SHA256 signature for a webhook payload.
///
/// Signature payload = `timestamp || body`, where `timestamp` is a unix-seconds
/// integer rendered as a decimal string. Returns the hex-encoded signature and
/// the timestamp string used, so callers can send both in headers.
fn sign_webhook(payload: &str, signing_secret: &str) -> (String, String) {
    let timestamp = Utc::now().timestamp().to_string();

    let signature_payload = format!("{}{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(signing_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(signature_payload.as_bytes());
    let result = mac.finalize();

    let signature = hex::encode(result.into_bytes());

    (signature, timestamp)
}

/// Trait for message mediation
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn mediate(&self, message: &Message) -> MediationOutcome;
}

/// Payload sent to mediation target: `{"messageId":"<id>"}`
#[derive(Debug, Serialize)]
struct MediationPayload<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
}

/// Response envelope returned by a mediation target.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct MediationResponse {
    #[serde(default)]
    status: ResponseStatus,
    #[serde(default)]
    #[allow(dead_code)]
    message: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    error_details: Option<serde_json::Value>,
    #[serde(default)]
    delay_seconds: Option<u32>,
}

#[derive(Debug, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
enum ResponseStatus {
    #[default]
    Success,
    Error,
}

/// HTTP version to use for mediation requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpVersion {
    /// HTTP/1.1 - better for development/debugging
    Http1,
    /// HTTP/2 - better for production (multiplexing, header compression)
    #[default]
    Http2,
}

/// Configuration for HTTP mediator
#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    /// Request timeout (default: 900s / 15 minutes)
    pub timeout: Duration,
    /// HTTP version to use
    pub http_version: HttpVersion,
    pub max_retries: u32,
    pub retry_delays: Vec<Duration>,
    /// Sliding window size considered by the circuit breaker
    pub circuit_breaker_window_size: u32,
    /// Failure rate in `[0.0, 1.0]` that trips the breaker
    pub circuit_breaker_failure_rate: f64,
    /// Circuit breaker reset timeout
    pub circuit_breaker_timeout: Duration,
    /// Delay used when the circuit breaker rejects a call outright
    pub open_state_delay_seconds: u32,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900), // 15 minutes
            http_version: HttpVersion::Http2,  // Production default
            max_retries: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
            ],
            circuit_breaker_window_size: 20,
            circuit_breaker_failure_rate: 0.5,
            circuit_breaker_timeout: Duration::from_secs(30),
            open_state_delay_seconds: 30,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl HttpMediatorConfig {
    /// Create config for development mode (HTTP/1.1, shorter timeout)
    pub fn dev() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            http_version: HttpVersion::Http1,
            max_retries: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
            ],
            circuit_breaker_window_size: 20,
            circuit_breaker_failure_rate: 0.5,
            circuit_breaker_timeout: Duration::from_secs(5),
            open_state_delay_seconds: 30,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Create config for production mode (HTTP/2, long timeout)
    pub fn production() -> Self {
        Self::default()
    }
}

/// HTTP-based message mediator. Guards each mediation target with its own
/// circuit breaker via a shared `CircuitBreakerRegistry`, keyed by
/// `message.mediation_target`, so one failing target cannot short-circuit
/// calls to every other target.
pub struct HttpMediator {
    client: Client,
    config: HttpMediatorConfig,
    circuit_breakers: Arc<CircuitBreakerRegistry>,
    warning_service: Option<Arc<WarningService>>,
}

impl HttpMediator {
    pub fn new() -> Self {
        Self::with_config(HttpMediatorConfig::default())
    }

    /// Create mediator with dev mode configuration (HTTP/1.1)
    pub fn dev() -> Self {
        Self::with_config(HttpMediatorConfig::dev())
    }

    /// Create mediator with production configuration (HTTP/2)
    pub fn production() -> Self {
        Self::with_config(HttpMediatorConfig::production())
    }

    pub fn with_config(config: HttpMediatorConfig) -> Self {
        let registry = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            window_size: config.circuit_breaker_window_size,
            failure_rate_threshold: config.circuit_breaker_failure_rate,
            reset_timeout: config.circuit_breaker_timeout,
        }));
        Self::with_registry(config, registry)
    }

    /// Create a mediator that guards targets through an existing registry,
    /// so the same per-target breaker state the monitoring API reports on is
    /// the one actually consulted on the mediation path.
    pub fn with_registry(config: HttpMediatorConfig, circuit_breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10);

        // Configure HTTP version
        match config.http_version {
            HttpVersion::Http1 => {
                // Force HTTP/1.1 only
                builder = builder.http1_only();
                info!("HttpMediator configured for HTTP/1.1");
            }
            HttpVersion::Http2 => {
                // For HTTPS: let ALPN negotiate HTTP/2 (this is the default behavior)
                // Do NOT use http2_prior_knowledge() for HTTPS - that's for h2c (cleartext)
                // reqwest will automatically negotiate HTTP/2 via ALPN for HTTPS
                info!("HttpMediator configured for HTTP/2 (ALPN negotiation)");
            }
        }

        let client = builder.build().expect("Failed to build HTTP client");

        info!(
            timeout_secs = config.timeout.as_secs(),
            http_version = ?config.http_version,
            "HttpMediator initialized"
        );

        Self { client, config, circuit_breakers, warning_service: None }
    }

    /// Set the warning service for generating configuration warnings
    pub fn with_warning_service(mut self, warning_service: Arc<WarningService>) -> Self {
        self.warning_service = Some(warning_service);
        self
    }

    /// Set warning service after construction
    pub fn set_warning_service(&mut self, warning_service: Arc<WarningService>) {
        self.warning_service = Some(warning_service);
    }

    /// Generate a configuration warning
    fn warn_config(&self, message_id: &str, target: &str, status_code: u16, description: &str) {
        if let Some(ref ws) = self.warning_service {
            let severity = if status_code == 501 {
                WarningSeverity::Critical
            } else {
                WarningSeverity::Error
            };
            ws.add_warning(
                WarningCategory::Configuration,
                severity,
                format!("HTTP {} {} for message {}: Target: {}", status_code, description, message_id, target),
                "HttpMediator".to_string(),
            );
        }
    }

    /// Get the circuit breaker state for a mediation target.
    pub fn circuit_state(&self, target: &str) -> CircuitBreakerState {
        self.circuit_breakers.get_state(target).unwrap_or(CircuitBreakerState::Closed)
    }

    async fn mediate_once(&self, message: &Message) -> MediationOutcome {
        if message.mediation_type != MediationType::HTTP {
            return MediationOutcome::error_config(
                0,
                format!("Unsupported mediation type: {:?}", message.mediation_type),
            );
        }

        // Check circuit breaker for this target
        if !self.circuit_breakers.allow_request(&message.mediation_target) {
            debug!(
                message_id = %message.id,
                target = %message.mediation_target,
                "Circuit breaker open, rejecting request"
            );
            return MediationOutcome {
                result: MediationResult::ErrorProcess,
                delay_seconds: Some(fc_common::clamp_delay_seconds(self.config.open_state_delay_seconds)),
                status_code: None,
                error_message: Some("Circuit breaker open".to_string()),
            };
        }

        // Build the mediation request body: {"messageId":"<id>"}
        let payload = MediationPayload {
            message_id: &message.id,
        };

        debug!(
            message_id = %message.id,
            target = %message.mediation_target,
            has_auth_token = message.auth_token.is_some(),
            auth_token_preview = message.auth_token.as_ref().map(|t| if t.len() > 20 { format!("{}...", &t[..20]) } else { t.clone() }),
            "Mediating message"
        );

        // Serialize payload for signing
        let payload_json = serde_json::to_string(&payload)
            .expect("Failed to serialize payload");

        let mut request = self.client
            .post(&message.mediation_target)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header(MESSAGE_ID_HEADER, &message.id);

        if let Some(ref group_id) = message.message_group_id {
            request = request.header(MESSAGE_GROUP_HEADER, group_id);
        }

        // Add webhook signing headers if signing_secret is present
        if let Some(ref signing_secret) = message.signing_secret {
            let (signature, timestamp) = sign_webhook(&payload_json, signing_secret);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(TIMESTAMP_HEADER, timestamp);
        }

        if let Some(token) = &message.auth_token {
            request = request.bearer_auth(token);
        }

        // Add the body after all headers are set
        request = request.body(payload_json);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let status_code = status.as_u16();

                if status.is_success() {
                    // Parse the response envelope; a body that fails to parse or is absent
                    // is treated as an implicit SUCCESS (matches a bare 2xx with no body).
                    let body = response.text().await.unwrap_or_default();
                    let parsed: MediationResponse = if body.trim().is_empty() {
                        MediationResponse::default()
                    } else {
                        serde_json::from_str(&body).unwrap_or_default()
                    };

                    if parsed.status == ResponseStatus::Error {
                        self.circuit_breakers.record_failure(&message.mediation_target);
                        let delay = fc_common::clamp_delay_seconds(parsed.delay_seconds.unwrap_or(30));
                        debug!(
                            message_id = %message.id,
                            delay_seconds = delay,
                            "Target returned status=ERROR in 2xx body"
                        );
                        return MediationOutcome {
                            result: MediationResult::ErrorProcess,
                            delay_seconds: Some(delay),
                            status_code: Some(status_code),
                            error_message: Some(
                                parsed.error_description.unwrap_or_else(|| "Target returned status=ERROR".to_string()),
                            ),
                        };
                    }

                    self.circuit_breakers.record_success(&message.mediation_target);
                    info!(
                        message_id = %message.id,
                        status_code = status_code,
                        "Message delivered successfully"
                    );
                    MediationOutcome::success()
                } else if status_code == 401 || status_code == 403 {
                    // Auth errors - configuration error, not circuit-breaker-counted
                    let desc = if status_code == 401 { "Unauthorized" } else { "Forbidden" };
                    warn!(
                        message_id = %message.id,
                        status_code = status_code,
                        "Authentication/authorization error"
                    );
                    self.warn_config(&message.id, &message.mediation_target, status_code, desc);
                    MediationOutcome::error_config(status_code, format!("HTTP {}: Auth error", status_code))
                } else if status_code == 404 {
                    // Not found - configuration error
                    warn!(
                        message_id = %message.id,
                        status_code = status_code,
                        "Endpoint not found"
                    );
                    self.warn_config(&message.id, &message.mediation_target, status_code, "Not Found");
                    MediationOutcome::error_config(status_code, "HTTP 404: Not found".to_string())
                } else if status_code == 501 {
                    // Not implemented - configuration error (CRITICAL)
                    warn!(
                        message_id = %message.id,
                        status_code = status_code,
                        "Not implemented"
                    );
                    self.warn_config(&message.id, &message.mediation_target, status_code, "Not Implemented");
                    MediationOutcome::error_config(status_code, "HTTP 501: Not implemented".to_string())
                } else if status_code == 400 || status.is_server_error() {
                    // 400 and 5xx (except 501, handled above) - transient, retry
                    self.circuit_breakers.record_failure(&message.mediation_target);

                    let retry_after = response.headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u32>().ok());

                    let delay = fc_common::clamp_delay_seconds(retry_after.unwrap_or(30));
                    warn!(
                        message_id = %message.id,
                        status_code = status_code,
                        delay_seconds = delay,
                        "Transient error - will retry"
                    );
                    MediationOutcome {
                        result: MediationResult::ErrorProcess,
                        delay_seconds: Some(delay),
                        status_code: Some(status_code),
                        error_message: Some(format!("HTTP {}: transient error", status_code)),
                    }
                } else {
                    // Any other client error (not 400/401/403/404/429/501) - configuration error
                    warn!(
                        message_id = %message.id,
                        status_code = status_code,
                        "Client error"
                    );
                    MediationOutcome::error_config(status_code, format!("HTTP {}: Client error", status_code))
                }
            }
            Err(e) => {
                self.circuit_breakers.record_failure(&message.mediation_target);

                if e.is_timeout() {
                    warn!(
                        message_id = %message.id,
                        error = %e,
                        "Request timeout"
                    );
                    MediationOutcome::error_process(Some(30), "Request timeout".to_string())
                } else if e.is_connect() {
                    warn!(
                        message_id = %message.id,
                        error = %e,
                        "Connection error"
                    );
                    MediationOutcome::error_process(Some(30), format!("Connection error: {}", e))
                } else {
                    error!(
                        message_id = %message.id,
                        target = %message.mediation_target,
                        error = %e,
                        error_debug = ?e,
                        is_request = e.is_request(),
                        is_redirect = e.is_redirect(),
                        is_status = e.is_status(),
                        is_body = e.is_body(),
                        is_decode = e.is_decode(),
                        "Request failed"
                    );
                    MediationOutcome::error_process(Some(30), format!("Request failed: {}", e))
                }
            }
        }
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn mediate(&self, message: &Message) -> MediationOutcome {
        let mut attempts = 0;

        loop {
            let outcome = self.mediate_once(message).await;

            // Don't retry on success or config errors
            if outcome.result == MediationResult::Success ||
               outcome.result == MediationResult::ErrorConfig {
                return outcome;
            }

            attempts += 1;
            if attempts >= self.config.max_retries {
                return outcome;
            }

            // Use configured delay or exponential backoff
            let delay = self.config.retry_delays
                .get(attempts as usize - 1)
                .copied()
                .unwrap_or(Duration::from_secs(3));

            debug!(
                message_id = %message.id,
                attempt = attempts,
                delay_ms = delay.as_millis(),
                "Retrying mediation"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for HttpMediator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_breaker_trips_on_failure_rate() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            window_size: 4,
            failure_rate_threshold: 0.5,
            reset_timeout: Duration::from_secs(1),
        });
        let target = "https://example.com/hook";

        assert_eq!(registry.get_state(target), None);
        assert!(registry.allow_request(target));

        // 1 failure, 3 successes - 25% rate, window full but below threshold
        registry.record_failure(target);
        registry.record_success(target);
        registry.record_success(target);
        registry.record_success(target);
        assert_eq!(registry.get_state(target), Some(CircuitBreakerState::Closed));

        // Next window of 4: 2 failures, 2 successes - 50% rate, trips
        registry.record_failure(target);
        registry.record_success(target);
        registry.record_failure(target);
        registry.record_success(target);
        assert_eq!(registry.get_state(target), Some(CircuitBreakerState::Open));
        assert!(!registry.allow_request(target));
    }

    #[test]
    fn test_circuit_breaker_half_open_probe_closes_on_success() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            window_size: 2,
            failure_rate_threshold: 0.5,
            reset_timeout: Duration::from_millis(10),
        });
        let target = "https://example.com/hook";

        registry.record_failure(target);
        registry.record_failure(target);
        assert_eq!(registry.get_state(target), Some(CircuitBreakerState::Open));

        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.allow_request(target));
        assert_eq!(registry.get_state(target), Some(CircuitBreakerState::HalfOpen));

        registry.record_success(target);
        assert_eq!(registry.get_state(target), Some(CircuitBreakerState::Closed));
    }

    #[test]
    fn test_circuit_breaker_half_open_probe_reopens_on_failure() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            window_size: 2,
            failure_rate_threshold: 0.5,
            reset_timeout: Duration::from_millis(10),
        });
        let target = "https://example.com/hook";

        registry.record_failure(target);
        registry.record_failure(target);
        std::thread::sleep(Duration::from_millis(20));
        assert!(registry.allow_request(target));

        registry.record_failure(target);
        assert_eq!(registry.get_state(target), Some(CircuitBreakerState::Open));
        assert!(!registry.allow_request(target));
    }

    #[test]
    fn test_circuit_breaker_is_per_target() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            window_size: 2,
            failure_rate_threshold: 0.5,
            reset_timeout: Duration::from_secs(60),
        });
        let bad = "https://bad.example.com/hook";
        let good = "https://good.example.com/hook";

        registry.record_failure(bad);
        registry.record_failure(bad);
        assert_eq!(registry.get_state(bad), Some(CircuitBreakerState::Open));
        assert!(!registry.allow_request(bad));

        // A tripped breaker for one target must not affect another target.
        assert!(registry.allow_request(good));
        assert_eq!(registry.get_state(good), None);
    }
}
