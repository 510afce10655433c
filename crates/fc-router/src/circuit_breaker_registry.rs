//! Circuit Breaker Registry - per-endpoint circuit breaker tracking for monitoring.
//!
//! Keyed by a stable name derived from the mediation target (the endpoint URL).
//! Breakers are created lazily on first use and share the same sliding-window
//! failure-rate model as the mediator's own breaker (see `mediator::CircuitBreaker`);
//! this registry exists so the monitoring API can list and administer them without
//! threading a reference through every pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerState {
    /// Circuit is closed (normal operation)
    Closed,
    /// Circuit is open (rejecting requests)
    Open,
    /// Circuit is testing a single probe request
    HalfOpen,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self::Closed
    }
}

/// Statistics for a single circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Name/identifier of the circuit breaker (usually the endpoint URL)
    pub name: String,
    /// Current state: CLOSED, OPEN, HALF_OPEN
    pub state: CircuitBreakerState,
    /// Number of successful calls
    #[serde(rename = "successfulCalls")]
    pub successful_calls: u64,
    /// Number of failed calls
    #[serde(rename = "failedCalls")]
    pub failed_calls: u64,
    /// Number of calls rejected while open
    #[serde(rename = "rejectedCalls")]
    pub rejected_calls: u64,
    /// Failure rate over the current window (0.0 - 1.0)
    #[serde(rename = "failureRate")]
    pub failure_rate: f64,
    /// Number of outcomes currently in the window
    #[serde(rename = "bufferedCalls")]
    pub buffered_calls: u32,
    /// Size of the sliding window
    #[serde(rename = "bufferSize")]
    pub buffer_size: u32,
}

/// Per-endpoint circuit breaker tracking.
struct EndpointCircuitBreaker {
    name: String,
    state: RwLock<CircuitBreakerState>,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    last_state_change: RwLock<Instant>,

    window_size: u32,
    failure_rate_threshold: f64,
    reset_timeout: Duration,

    // Sliding window of recent outcomes (true = success)
    window: RwLock<VecDeque<bool>>,
}

impl EndpointCircuitBreaker {
    fn new(name: String, window_size: u32, failure_rate_threshold: f64, reset_timeout: Duration) -> Self {
        Self {
            name,
            state: RwLock::new(CircuitBreakerState::Closed),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            last_state_change: RwLock::new(Instant::now()),
            window_size,
            failure_rate_threshold,
            reset_timeout,
            window: RwLock::new(VecDeque::with_capacity(window_size as usize)),
        }
    }

    fn record(&self, success: bool) {
        let mut window = self.window.write();
        if window.len() >= self.window_size as usize {
            window.pop_front();
        }
        window.push_back(success);

        let state = *self.state.read();
        match state {
            CircuitBreakerState::HalfOpen => {
                if success {
                    *self.state.write() = CircuitBreakerState::Closed;
                    window.clear();
                } else {
                    *self.state.write() = CircuitBreakerState::Open;
                }
                *self.last_state_change.write() = Instant::now();
            }
            CircuitBreakerState::Closed => {
                if window.len() >= self.window_size as usize {
                    let failures = window.iter().filter(|&&s| !s).count();
                    let rate = failures as f64 / window.len() as f64;
                    if rate >= self.failure_rate_threshold {
                        *self.state.write() = CircuitBreakerState::Open;
                        *self.last_state_change.write() = Instant::now();
                    }
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        self.record(true);
    }

    fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        self.record(false);
    }

    fn record_rejected(&self) {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn allow_request(&self) -> bool {
        let state = *self.state.read();

        match state {
            CircuitBreakerState::Closed => true,
            CircuitBreakerState::Open => {
                if self.last_state_change.read().elapsed() >= self.reset_timeout {
                    *self.state.write() = CircuitBreakerState::HalfOpen;
                    *self.last_state_change.write() = Instant::now();
                    true
                } else {
                    false
                }
            }
            CircuitBreakerState::HalfOpen => true,
        }
    }

    fn get_stats(&self) -> CircuitBreakerStats {
        let successful = self.successful_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);

        let window = self.window.read();
        let failure_rate = if window.is_empty() {
            0.0
        } else {
            window.iter().filter(|&&s| !s).count() as f64 / window.len() as f64
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: *self.state.read(),
            successful_calls: successful,
            failed_calls: failed,
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            failure_rate,
            buffered_calls: window.len() as u32,
            buffer_size: self.window_size,
        }
    }

    fn reset(&self) {
        *self.state.write() = CircuitBreakerState::Closed;
        *self.last_state_change.write() = Instant::now();
        self.window.write().clear();
    }
}

/// Configuration for the circuit breaker registry.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of recent outcomes tracked per endpoint
    pub window_size: u32,
    /// Failure rate (0.0 - 1.0) at which the breaker opens
    pub failure_rate_threshold: f64,
    /// Time an open breaker waits before allowing a half-open probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            failure_rate_threshold: 0.5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Registry for per-endpoint circuit breakers.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<EndpointCircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get or create a circuit breaker for an endpoint.
    fn get_or_create(&self, endpoint: &str) -> Arc<EndpointCircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(endpoint) {
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write();
        let breaker = Arc::new(EndpointCircuitBreaker::new(
            endpoint.to_string(),
            self.config.window_size,
            self.config.failure_rate_threshold,
            self.config.reset_timeout,
        ));
        breakers.insert(endpoint.to_string(), Arc::clone(&breaker));
        breaker
    }

    /// Check if a request should be allowed for an endpoint.
    pub fn allow_request(&self, endpoint: &str) -> bool {
        let breaker = self.get_or_create(endpoint);
        let allowed = breaker.allow_request();
        if !allowed {
            breaker.record_rejected();
        }
        allowed
    }

    /// Record a successful call.
    pub fn record_success(&self, endpoint: &str) {
        self.get_or_create(endpoint).record_success();
    }

    /// Record a failed call.
    pub fn record_failure(&self, endpoint: &str) {
        self.get_or_create(endpoint).record_failure();
    }

    /// Get stats for all circuit breakers.
    pub fn get_all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        let breakers = self.breakers.read();
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.get_stats()))
            .collect()
    }

    /// Get stats for a specific circuit breaker.
    pub fn get_stats(&self, endpoint: &str) -> Option<CircuitBreakerStats> {
        let breakers = self.breakers.read();
        breakers.get(endpoint).map(|b| b.get_stats())
    }

    /// Get state of a specific circuit breaker.
    pub fn get_state(&self, endpoint: &str) -> Option<CircuitBreakerState> {
        let breakers = self.breakers.read();
        breakers.get(endpoint).map(|b| *b.state.read())
    }

    /// Reset a specific circuit breaker. Returns false if it doesn't exist.
    pub fn reset(&self, endpoint: &str) -> bool {
        let breakers = self.breakers.read();
        if let Some(breaker) = breakers.get(endpoint) {
            breaker.reset();
            true
        } else {
            false
        }
    }

    /// Reset all circuit breakers.
    pub fn reset_all(&self) {
        let breakers = self.breakers.read();
        for breaker in breakers.values() {
            breaker.reset();
        }
    }

    /// Get count of open circuit breakers.
    pub fn open_count(&self) -> usize {
        let breakers = self.breakers.read();
        breakers
            .values()
            .filter(|b| *b.state.read() == CircuitBreakerState::Open)
            .count()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
