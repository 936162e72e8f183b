use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::provider::{ChatRequest, Provider};
use crate::agent::streaming::StreamingResponse;
use crate::error::Result;

/// Configuration for the circuit breaker guarding a primary provider.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitStateInternal {
    state: CircuitState,
    failures: u32,
    last_failure_time: Option<Instant>,
}

/// Wraps a primary and fallback provider with circuit-breaker failover:
/// the fallback takes over once the primary has failed `failure_threshold`
/// times in a row, until `reset_timeout` has passed and one probe succeeds.
pub struct ResilientProvider<P: Provider, F: Provider> {
    primary: Arc<P>,
    fallback: Arc<F>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<CircuitStateInternal>>,
}

impl<P: Provider, F: Provider> ResilientProvider<P, F> {
    pub fn new(primary: P, fallback: F, config: CircuitBreakerConfig) -> Self {
        Self {
            primary: Arc::new(primary),
            fallback: Arc::new(fallback),
            config,
            state: Arc::new(Mutex::new(CircuitStateInternal {
                state: CircuitState::Closed,
                failures: 0,
                last_failure_time: None,
            })),
        }
    }

    async fn check_state(&self) -> CircuitState {
        let mut guard = self.state.lock().await;
        if guard.state == CircuitState::Open {
            if let Some(last_failure) = guard.last_failure_time {
                if last_failure.elapsed() > self.config.reset_timeout {
                    info!("circuit breaker: reset timeout elapsed, switching to half-open");
                    guard.state = CircuitState::HalfOpen;
                    return CircuitState::HalfOpen;
                }
            }
        }
        guard.state.clone()
    }

    async fn report_success(&self) {
        let mut guard = self.state.lock().await;
        if guard.state == CircuitState::HalfOpen {
            info!("circuit breaker: half-open probe succeeded, closing circuit");
            guard.state = CircuitState::Closed;
        }
        guard.failures = 0;
        guard.last_failure_time = None;
    }

    async fn report_failure(&self) {
        let mut guard = self.state.lock().await;
        guard.failures += 1;
        guard.last_failure_time = Some(Instant::now());
        if guard.state == CircuitState::Closed && guard.failures >= self.config.failure_threshold {
            warn!("circuit breaker: failure threshold reached, opening circuit");
            guard.state = CircuitState::Open;
        } else if guard.state == CircuitState::HalfOpen {
            warn!("circuit breaker: half-open probe failed, re-opening circuit");
            guard.state = CircuitState::Open;
        }
    }
}

#[async_trait]
impl<P: Provider, F: Provider> Provider for ResilientProvider<P, F> {
    fn name(&self) -> &'static str {
        "resilient-provider"
    }

    async fn stream_completion(&self, request: ChatRequest) -> Result<StreamingResponse> {
        let state = self.check_state().await;
        let use_primary = !matches!(state, CircuitState::Open);

        if use_primary {
            match tokio::time::timeout(
                self.config.request_timeout,
                self.primary.stream_completion(request.clone()),
            )
            .await
            {
                Ok(Ok(response)) => {
                    self.report_success().await;
                    return Ok(response);
                }
                Ok(Err(err)) => {
                    warn!(provider = self.primary.name(), %err, "primary provider call failed");
                    self.report_failure().await;
                }
                Err(_) => {
                    warn!(provider = self.primary.name(), "primary provider call timed out");
                    self.report_failure().await;
                }
            }
        }

        self.fallback.stream_completion(request).await
    }
}
