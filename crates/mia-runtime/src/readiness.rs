//! Readiness probing.
//!
//! [`ReadinessProber`] polls a [`HealthCheck`] on a fixed grid: attempt 1
//! at `t = 0`, attempt `k` at `t = (k - 1) * interval`, as long as
//! `t < deadline`. The first healthy answer ends the loop, so readiness is
//! reported exactly once. Each check is also cut off at the deadline.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`ProbeError::Timeout`] | `PROBE_TIMEOUT` | Yes |
//! | [`ProbeError::Cancelled`] | `PROBE_CANCELLED` | No |
//! | [`ProbeError::Client`] | `PROBE_CLIENT` | No |

use crate::config::{BackendConfig, HealthConfig};
use async_trait::async_trait;
use mia_types::ErrorCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Not ready yet, with a human-readable reason.
    NotReady(String),
}

/// A single readiness check against the backend.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthStatus;
}

/// `GET` on the backend health endpoint; any 2xx is healthy.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthCheck {
    /// # Errors
    ///
    /// Returns [`ProbeError::Client`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// # Errors
    ///
    /// Returns [`ProbeError::Client`] if the HTTP client cannot be built.
    pub fn from_config(backend: &BackendConfig, health: &HealthConfig) -> Result<Self, ProbeError> {
        Self::new(backend.health_url(), health.request_timeout())
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self) -> HealthStatus {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_success() => HealthStatus::Healthy,
            Ok(resp) => HealthStatus::NotReady(format!("status {}", resp.status())),
            Err(e) if e.is_connect() => HealthStatus::NotReady("connection refused".into()),
            Err(e) => HealthStatus::NotReady(e.to_string()),
        }
    }
}

/// Emitted once when the backend first answers healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// Checks performed, including the successful one.
    pub attempts: u32,
    /// Time from probe start to the successful check.
    pub elapsed: Duration,
}

/// Readiness probe error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// Deadline elapsed without a healthy answer.
    #[error("backend not ready after {attempts} attempts within {deadline:?}")]
    Timeout { attempts: u32, deadline: Duration },

    /// The probe was cancelled.
    #[error("readiness probe cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    /// The health client could not be constructed.
    #[error("failed to build health client: {0}")]
    Client(String),
}

impl ErrorCode for ProbeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "PROBE_TIMEOUT",
            Self::Cancelled { .. } => "PROBE_CANCELLED",
            Self::Client(_) => "PROBE_CLIENT",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Shortest poll interval; a zero period would never yield to the timer.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Polls a [`HealthCheck`] until healthy or the deadline elapses.
#[derive(Clone)]
pub struct ReadinessProber {
    check: Arc<dyn HealthCheck>,
    interval: Duration,
    deadline: Duration,
}

impl ReadinessProber {
    /// `interval` is raised to 1 ms if smaller.
    #[must_use]
    pub fn new(check: Arc<dyn HealthCheck>, interval: Duration, deadline: Duration) -> Self {
        Self {
            check,
            interval: interval.max(MIN_INTERVAL),
            deadline,
        }
    }

    #[must_use]
    pub fn from_config(check: Arc<dyn HealthCheck>, config: &HealthConfig) -> Self {
        Self::new(check, config.interval(), config.deadline())
    }

    /// Runs the poll loop on the current task.
    ///
    /// # Errors
    ///
    /// - [`ProbeError::Timeout`] when the deadline elapses first
    /// - [`ProbeError::Cancelled`] when `cancel` fires
    pub async fn probe(&self, cancel: &CancellationToken) -> Result<ReadyEvent, ProbeError> {
        let start = Instant::now();
        let deadline = start + self.deadline;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut attempts = 0u32;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProbeError::Cancelled { attempts }),
                () = tokio::time::sleep_until(deadline) => {
                    warn!(attempts, deadline = ?self.deadline, "Readiness deadline elapsed");
                    return Err(ProbeError::Timeout { attempts, deadline: self.deadline });
                }
                _ = ticker.tick() => {}
            }

            attempts += 1;
            let status = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProbeError::Cancelled { attempts }),
                status = tokio::time::timeout_at(deadline, self.check.check()) => status,
            };

            match status {
                Ok(HealthStatus::Healthy) => {
                    let elapsed = start.elapsed();
                    info!(attempts, ?elapsed, "Backend passed health check");
                    return Ok(ReadyEvent { attempts, elapsed });
                }
                Ok(HealthStatus::NotReady(reason)) => {
                    debug!(attempts, %reason, "Backend not ready yet");
                }
                Err(_) => {
                    warn!(attempts, deadline = ?self.deadline, "Health check cut off by deadline");
                    return Err(ProbeError::Timeout {
                        attempts,
                        deadline: self.deadline,
                    });
                }
            }
        }
    }

    /// Runs the poll loop as a task.
    ///
    /// The returned handle owns a child of `parent`, so cancelling either
    /// stops the probe.
    #[must_use]
    pub fn spawn(self, parent: &CancellationToken) -> ProbeHandle {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let task = tokio::spawn(async move { self.probe(&token).await });
        ProbeHandle { cancel, task }
    }
}

impl std::fmt::Debug for ReadinessProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessProber")
            .field("interval", &self.interval)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Handle to a spawned probe.
#[derive(Debug)]
pub struct ProbeHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<ReadyEvent, ProbeError>>,
}

impl ProbeHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the probe outcome. Cancel-safe.
    ///
    /// # Errors
    ///
    /// Returns the probe error; a panicked or aborted task counts as
    /// cancelled.
    pub async fn wait(&mut self) -> Result<ReadyEvent, ProbeError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Readiness task failed");
                Err(ProbeError::Cancelled { attempts: 0 })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedHealth;
    use mia_types::assert_error_codes;

    fn prober(check: &Arc<ScriptedHealth>, interval_ms: u64, deadline_ms: u64) -> ReadinessProber {
        ReadinessProber::new(
            Arc::clone(check) as Arc<dyn HealthCheck>,
            Duration::from_millis(interval_ms),
            Duration::from_millis(deadline_ms),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_first_success() {
        let check = Arc::new(ScriptedHealth::healthy_after(2));
        let event = prober(&check, 100, 1_000)
            .probe(&CancellationToken::new())
            .await
            .expect("backend should become ready");

        assert_eq!(event.attempts, 3);
        assert_eq!(event.elapsed, Duration::from_millis(200));
        assert_eq!(check.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_at_fourth_poll_of_one_second_interval() {
        let check = Arc::new(ScriptedHealth::healthy_after(3));
        let event = prober(&check, 1_000, 30_000)
            .probe(&CancellationToken::new())
            .await
            .expect("backend should become ready");

        assert_eq!(event.attempts, 4);
        assert_eq!(event.elapsed, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_of_five_polls_times_out_after_fifth() {
        let check = Arc::new(ScriptedHealth::never());
        let err = prober(&check, 1_000, 5_000)
            .probe(&CancellationToken::new())
            .await
            .expect_err("never healthy");

        assert!(matches!(err, ProbeError::Timeout { attempts: 5, .. }));
        assert_eq!(check.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_polls_every_millisecond() {
        let check = Arc::new(ScriptedHealth::healthy_after(2));
        let event = prober(&check, 0, 1_000)
            .probe(&CancellationToken::new())
            .await
            .expect("backend should become ready");

        assert_eq!(event.attempts, 3);
        assert_eq!(event.elapsed, Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn no_checks_after_success() {
        let check = Arc::new(ScriptedHealth::healthy_after(0));
        let handle_check = Arc::clone(&check);
        let mut handle = prober(&check, 100, 1_000).spawn(&CancellationToken::new());

        let event = handle.wait().await.expect("ready");
        assert_eq!(event.attempts, 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(handle_check.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_attempts_before_deadline() {
        let check = Arc::new(ScriptedHealth::never());
        let started = Instant::now();
        let err = prober(&check, 100, 1_000)
            .probe(&CancellationToken::new())
            .await
            .expect_err("never healthy");

        assert_eq!(
            err,
            ProbeError::Timeout {
                attempts: 10,
                deadline: Duration::from_secs(1)
            }
        );
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_check_is_bounded_by_deadline() {
        let check = Arc::new(ScriptedHealth::never().with_latency(Duration::from_secs(60)));
        let started = Instant::now();
        let err = prober(&check, 100, 2_000)
            .probe(&CancellationToken::new())
            .await
            .expect_err("hung check must time out");

        assert!(matches!(err, ProbeError::Timeout { attempts: 1, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_spawned_probe() {
        let check = Arc::new(ScriptedHealth::never());
        let parent = CancellationToken::new();
        let mut handle = prober(&check, 100, 10_000).spawn(&parent);

        tokio::time::sleep(Duration::from_millis(250)).await;
        parent.cancel();

        let err = handle.wait().await.expect_err("cancelled");
        assert!(matches!(err, ProbeError::Cancelled { attempts } if attempts == 3));
    }

    #[test]
    fn error_codes() {
        assert_error_codes(
            &[
                ProbeError::Timeout {
                    attempts: 1,
                    deadline: Duration::from_secs(1),
                },
                ProbeError::Cancelled { attempts: 0 },
                ProbeError::Client("tls".into()),
            ],
            "PROBE_",
        );
        assert!(ProbeError::Timeout {
            attempts: 1,
            deadline: Duration::ZERO
        }
        .is_recoverable());
    }

    #[tokio::test]
    async fn http_check_reports_refused_connection_as_not_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let check = HttpHealthCheck::new(format!("http://{addr}/health"), Duration::from_millis(500))
            .expect("client should build");
        assert!(matches!(check.check().await, HealthStatus::NotReady(_)));
    }

    #[tokio::test]
    async fn http_check_maps_status_codes() {
        use axum::http::StatusCode;
        use axum::routing::get;

        let app = axum::Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/starting", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let healthy = HttpHealthCheck::new(format!("http://{addr}/health"), Duration::from_secs(2))
            .expect("client should build");
        assert_eq!(healthy.check().await, HealthStatus::Healthy);

        let starting = HttpHealthCheck::new(format!("http://{addr}/starting"), Duration::from_secs(2))
            .expect("client should build");
        assert_eq!(
            starting.check().await,
            HealthStatus::NotReady("status 503 Service Unavailable".into())
        );
    }
}
