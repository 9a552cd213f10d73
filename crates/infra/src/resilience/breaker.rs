//! Circuit breaker.
//!
//! `Closed → Open → HalfOpen → {Closed | Open}`. All state lives behind one mutex and every
//! transition happens while holding it, so admission and recording are serialized.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use backoffice_core::{AppError, ExternalFailure};

use super::config::BreakerConfig;
use super::window::{RollingWindow, WindowTotals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Observable breaker activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Opened,
    HalfOpened,
    Closed,
    Rejected,
    Timeout,
    Failure,
    Success,
    Fallback,
}

/// Result of a call that may have been served by a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The protected call itself succeeded.
    Genuine(T),
    /// The call was rejected, failed or timed out; the value came from the fallback.
    Degraded(T),
}

impl<T> Outcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Outcome::Genuine(v) | Outcome::Degraded(v) => v,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum BreakerError<E> {
    #[error("circuit '{name}' is open")]
    Open { name: String },

    #[error("call through '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("call through '{name}' failed: {error}")]
    Failed { name: String, error: E },

    #[error("fallback for '{name}' failed after {trigger}: {error}")]
    FallbackFailed {
        name: String,
        trigger: ExternalFailure,
        error: E,
    },
}

impl<E: Display> BreakerError<E> {
    pub fn breaker(&self) -> &str {
        match self {
            BreakerError::Open { name }
            | BreakerError::Timeout { name, .. }
            | BreakerError::Failed { name, .. }
            | BreakerError::FallbackFailed { name, .. } => name,
        }
    }

    /// Why the protected call produced no genuine result.
    pub fn failure(&self) -> ExternalFailure {
        match self {
            BreakerError::Open { .. } => ExternalFailure::CircuitOpen,
            BreakerError::Timeout { .. } => ExternalFailure::Timeout,
            BreakerError::Failed { error, .. } => ExternalFailure::Failed(error.to_string()),
            BreakerError::FallbackFailed { trigger, .. } => trigger.clone(),
        }
    }
}

impl<E: Display> From<BreakerError<E>> for AppError {
    fn from(err: BreakerError<E>) -> Self {
        AppError::ExternalService {
            service: err.breaker().to_string(),
            failure: err.failure(),
            fallback_used: matches!(err, BreakerError::FallbackFailed { .. }),
        }
    }
}

/// Lifetime counters plus the current window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStats {
    pub fires: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejects: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub window_successes: u32,
    pub window_failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    stats: BreakerStats,
}

enum Admission {
    Normal,
    Trial,
    Rejected,
}

/// Clears the trial slot if a half-open trial is cancelled before it settles.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().trial_in_flight = false;
            debug!(breaker = %self.breaker.config.name, "half-open trial abandoned");
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        info!(
            breaker = %config.name,
            timeout_ms = config.timeout.as_millis() as u64,
            error_threshold_percentage = config.error_threshold_percentage,
            volume_threshold = config.volume_threshold,
            "circuit breaker initialized"
        );
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window: RollingWindow::new(config.window, config.buckets),
                opened_at: None,
                trial_in_flight: false,
                stats: BreakerStats::default(),
            }),
            config,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        let WindowTotals {
            successes,
            failures,
        } = inner.window.totals(Instant::now());
        let mut stats = inner.stats.clone();
        stats.window_successes = successes;
        stats.window_failures = failures;
        stats
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BreakerEvent) {
        let _ = self.events.send(event);
    }

    fn admit(&self) -> Admission {
        let mut inner = self.inner.lock();
        let admission = match inner.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed());
                if elapsed.is_none_or(|e| e >= self.config.reset_timeout) {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    warn!(breaker = %self.config.name, "circuit half-open; testing recovery");
                    self.emit(BreakerEvent::HalfOpened);
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Admission::Rejected,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Admission::Trial
            }
        };
        match admission {
            Admission::Rejected => inner.stats.rejects += 1,
            _ => inner.stats.fires += 1,
        }
        admission
    }

    fn settle(&self, success: bool, trial: Option<TrialGuard<'_>>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if success {
            inner.stats.successes += 1;
        } else {
            inner.stats.failures += 1;
        }

        if let Some(mut guard) = trial {
            guard.armed = false;
            inner.trial_in_flight = false;
            if success {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.window.clear();
                info!(breaker = %self.config.name, "circuit closed; back to normal");
                self.emit(BreakerEvent::Closed);
            } else {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                error!(breaker = %self.config.name, "circuit re-opened; trial call failed");
                self.emit(BreakerEvent::Opened);
            }
            return;
        }

        // Late outcomes from calls admitted before the circuit opened are not sampled.
        if inner.state != CircuitState::Closed {
            return;
        }
        inner.window.record(now, success);
        if success {
            return;
        }

        let totals = inner.window.totals(now);
        if totals.samples() >= self.config.volume_threshold
            && totals.failure_percentage() >= f64::from(self.config.error_threshold_percentage)
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            error!(
                breaker = %self.config.name,
                samples = totals.samples(),
                failures = totals.failures,
                "circuit open; too many failures"
            );
            self.emit(BreakerEvent::Opened);
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected immediately while open. Otherwise bounded by the configured timeout; a call
    /// that exceeds it is dropped and counted as a failure.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let trial = match self.admit() {
            Admission::Rejected => {
                warn!(breaker = %self.config.name, "call rejected; circuit is open");
                self.emit(BreakerEvent::Rejected);
                return Err(BreakerError::Open {
                    name: self.config.name.clone(),
                });
            }
            Admission::Normal => None,
            Admission::Trial => Some(TrialGuard {
                breaker: self,
                armed: true,
            }),
        };

        match tokio::time::timeout(self.config.timeout, op()).await {
            Ok(Ok(value)) => {
                self.settle(true, trial);
                self.emit(BreakerEvent::Success);
                Ok(value)
            }
            Ok(Err(error)) => {
                warn!(breaker = %self.config.name, error = %error, "protected call failed");
                self.settle(false, trial);
                self.emit(BreakerEvent::Failure);
                Err(BreakerError::Failed {
                    name: self.config.name.clone(),
                    error,
                })
            }
            Err(_) => {
                warn!(
                    breaker = %self.config.name,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "protected call timed out"
                );
                self.inner.lock().stats.timeouts += 1;
                self.settle(false, trial);
                self.emit(BreakerEvent::Timeout);
                Err(BreakerError::Timeout {
                    name: self.config.name.clone(),
                    after: self.config.timeout,
                })
            }
        }
    }

    /// Like [`call`](Self::call), but when the call is rejected, fails or times out the
    /// fallback produces the result instead, tagged as [`Outcome::Degraded`].
    pub async fn call_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        op: F,
        fallback: G,
    ) -> Result<Outcome<T>, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(ExternalFailure) -> GFut,
        GFut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let trigger = match self.call(op).await {
            Ok(value) => return Ok(Outcome::Genuine(value)),
            Err(err) => err.failure(),
        };

        self.inner.lock().stats.fallbacks += 1;
        warn!(breaker = %self.config.name, trigger = %trigger, "fallback used");
        self.emit(BreakerEvent::Fallback);

        match fallback(trigger.clone()).await {
            Ok(value) => Ok(Outcome::Degraded(value)),
            Err(error) => Err(BreakerError::FallbackFailed {
                name: self.config.name.clone(),
                trigger,
                error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            name: "test".to_string(),
            timeout: Duration::from_secs(1),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_secs(30),
            volume_threshold: 5,
            window: Duration::from_secs(10),
            buckets: 10,
        })
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        b.call(|| async { Err::<(), _>("boom".to_string()) }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        b.call(|| async { Ok::<_, String>(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_volume_threshold_and_stops_invoking() {
        let b = breaker();
        for _ in 0..4 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Failed { .. })));
            assert_eq!(b.state(), CircuitState::Closed);
        }
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let sixth = b
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(sixth, Err(BreakerError::Open { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(b.stats().rejects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn below_volume_threshold_never_opens() {
        let b = breaker();
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_rate_below_threshold_stays_closed() {
        let b = breaker();
        for _ in 0..6 {
            succeed(&b).await.unwrap();
        }
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        // 5 of 11 failed.
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_age_out_of_the_window() {
        let b = breaker();
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.stats().window_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_through_half_open_and_reaccumulates_volume() {
        let b = breaker();
        let mut events = b.subscribe();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));

        tokio::time::advance(Duration::from_secs(1)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        // Window was cleared: four fresh failures are below the volume threshold.
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                BreakerEvent::Opened | BreakerEvent::HalfOpened | BreakerEvent::Closed
            ) {
                seen.push(event);
            }
        }
        assert_eq!(
            seen,
            vec![
                BreakerEvent::Opened,
                BreakerEvent::HalfOpened,
                BreakerEvent::Closed,
                BreakerEvent::Opened
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_with_fresh_timestamp() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));
        tokio::time::advance(Duration::from_secs(15)).await;
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_trial_runs_while_half_open() {
        let b = Arc::new(breaker());
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure_and_abandons_the_call() {
        let b = breaker();
        let finished = AtomicUsize::new(0);
        let result = b
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        let stats = b.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.window_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_results_are_tagged_degraded() {
        let b = breaker();
        let ok = b
            .call_with_fallback(|| async { Ok::<_, String>(1) }, |_| async { Ok(0) })
            .await
            .unwrap();
        assert_eq!(ok, Outcome::Genuine(1));

        let degraded = b
            .call_with_fallback(
                || async { Err::<i32, _>("down".to_string()) },
                |trigger| async move {
                    assert!(matches!(trigger, ExternalFailure::Failed(_)));
                    Ok(-1)
                },
            )
            .await
            .unwrap();
        assert!(degraded.is_degraded());
        assert_eq!(degraded.into_inner(), -1);
        assert_eq!(b.stats().fallbacks, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_runs_fallback_without_invoking_call() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        let result = b
            .call_with_fallback(
                || async { Ok::<_, String>("live") },
                |trigger| async move {
                    assert_eq!(trigger, ExternalFailure::CircuitOpen);
                    Ok("cached")
                },
            )
            .await
            .unwrap();
        assert_eq!(result, Outcome::Degraded("cached"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_fallback_surfaces_external_service_error() {
        let b = breaker();
        let err = b
            .call_with_fallback(
                || async { Err::<(), _>("down".to_string()) },
                |_| async { Err("fallback down".to_string()) },
            )
            .await
            .unwrap_err();

        let app: AppError = err.into();
        match app {
            AppError::ExternalService {
                service,
                failure,
                fallback_used,
            } => {
                assert_eq!(service, "test");
                assert_eq!(failure, ExternalFailure::Failed("down".to_string()));
                assert!(fallback_used);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
