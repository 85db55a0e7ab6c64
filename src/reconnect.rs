//! Per-worker supervised reconnect loop: state transitions, retry cycle,
//! wait-cycle, keep-alive (spec §4.B).
//!
//! Shaped after the teacher's `runtime::reconnect::ReconnectHelper` (an owned
//! policy + context + stats struct with `mark_connected`/`mark_disconnected`
//! and an `execute_*` entry point taking a connect closure) but the delay
//! model is replaced: the teacher uses unbounded exponential backoff with
//! jitter, this controller uses the spec's fixed `retry_interval_ms` within a
//! bounded cycle followed by one fixed `wait_time_after_max_retries_ms` cool-down,
//! and every sleep is interruptible via a `CancellationToken` rather than a
//! plain `tokio::time::sleep` (the teacher's helper has no cancellation path).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::ReconnectionSettings;

/// Controller-owned state machine position (a subset of `WorkerState` relevant
/// to reconnect supervision — the worker maps these onto the full `WorkerState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Stopped,
    Starting,
    Running,
    WaitingRetry,
    CommunicationError,
    Stopping,
}

impl ReconnectState {
    fn encode(self) -> u8 {
        match self {
            ReconnectState::Stopped => 0,
            ReconnectState::Starting => 1,
            ReconnectState::Running => 2,
            ReconnectState::WaitingRetry => 3,
            ReconnectState::CommunicationError => 4,
            ReconnectState::Stopping => 5,
        }
    }

    fn decode(raw: u8) -> Self {
        match raw {
            0 => ReconnectState::Stopped,
            1 => ReconnectState::Starting,
            2 => ReconnectState::Running,
            3 => ReconnectState::WaitingRetry,
            4 => ReconnectState::CommunicationError,
            _ => ReconnectState::Stopping,
        }
    }
}

/// Lock-free handle observers (the worker's status snapshot) use to read the
/// controller's current phase while `run()` holds `&mut self` on its own task.
/// Spec §4.B: "the controller is the single writer of the state variable;
/// readers observe via atomic load."
#[derive(Clone)]
pub struct ReconnectStateHandle(Arc<AtomicU8>);

impl ReconnectStateHandle {
    pub fn get(&self) -> ReconnectState {
        ReconnectState::decode(self.0.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReconnectStats {
    pub total_connections: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub reconnection_cycles: u64,
    pub keep_alive_sent: u64,
    pub keep_alive_failed: u64,
    /// Exponentially-weighted mean of (disconnect_time - last_successful_connection), in seconds.
    pub avg_connection_duration_s: f64,
}

/// Result of one supervised run, reported back to the worker so it can update `WorkerState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Connected,
    Stopped,
}

/// Hooks the controller drives; implemented by the concrete worker over its
/// transport base + driver (spec §4.B: "worker's connect/check/keepalive/close primitives").
#[async_trait::async_trait]
pub trait ReconnectHooks: Send + Sync {
    async fn connect(&self) -> Result<(), String>;
    async fn close(&self) -> Result<(), String>;
    async fn check_connection(&self) -> Result<(), String>;
    async fn send_keep_alive(&self) -> Result<(), String>;
}

pub struct ReconnectController {
    settings: ReconnectionSettings,
    state: ReconnectState,
    published: Arc<AtomicU8>,
    retry_counter: u32,
    stats: ReconnectStats,
    last_successful_connection: Option<std::time::Instant>,
    last_keep_alive: Option<std::time::Instant>,
    cancel: CancellationToken,
}

impl ReconnectController {
    pub fn new(settings: ReconnectionSettings) -> Self {
        Self {
            settings,
            state: ReconnectState::Stopped,
            published: Arc::new(AtomicU8::new(ReconnectState::Stopped.encode())),
            retry_counter: 0,
            stats: ReconnectStats::default(),
            last_successful_connection: None,
            last_keep_alive: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    /// Cloneable, lock-free handle for observers outside the task running `run()`.
    pub fn state_handle(&self) -> ReconnectStateHandle {
        ReconnectStateHandle(self.published.clone())
    }

    fn set_state(&mut self, new: ReconnectState) {
        self.state = new;
        self.published.store(new.encode(), Ordering::Release);
    }

    pub fn stats(&self) -> ReconnectStats {
        self.stats.clone()
    }

    /// `UpdateReconnectionSettings`: replaces settings atomically and resets the retry counter.
    pub fn update_settings(&mut self, settings: ReconnectionSettings) -> Result<(), String> {
        settings.validate()?;
        self.settings = settings;
        self.retry_counter = 0;
        Ok(())
    }

    /// A cloneable handle stop()/force_reconnect() can use to interrupt sleeps from outside.
    pub fn cancellation_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Manual `ForceReconnect`: drop the connection, clear the retry counter, re-enter STARTING.
    pub fn force_reconnect(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.retry_counter = 0;
        self.set_state(ReconnectState::Starting);
    }

    pub fn request_stop(&mut self) {
        self.cancel.cancel();
    }

    /// Interruptible sleep: returns `true` if the sleep elapsed fully, `false` if
    /// cancelled (stop or force-reconnect), matching the cooperative-cancellation
    /// contract of spec §4.B/§5 ("worst-case shutdown latency is one retry_interval_ms").
    async fn interruptible_sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Run the supervised loop to completion: STOPPED -> STARTING -> RUNNING (keep-alive
    /// loop) until cancellation or a keep-alive/check failure returns control to the
    /// caller with `CommunicationError`, which re-enters the retry cycle.
    ///
    /// Returns once the caller's stop request is observed, with state == Stopped.
    pub async fn run(&mut self, hooks: &dyn ReconnectHooks) -> ReconnectOutcome {
        self.set_state(ReconnectState::Starting);
        loop {
            if self.cancel.is_cancelled() {
                self.set_state(ReconnectState::Stopping);
                let _ = hooks.close().await;
                self.set_state(ReconnectState::Stopped);
                return ReconnectOutcome::Stopped;
            }

            match self.state {
                ReconnectState::Starting => {
                    self.attempt_connect_cycle(hooks).await;
                },
                ReconnectState::Running => {
                    if !self.keep_alive_loop(hooks).await {
                        // keep_alive_loop returns false only when cancellation fired
                        self.set_state(ReconnectState::Stopping);
                        let _ = hooks.close().await;
                        self.set_state(ReconnectState::Stopped);
                        return ReconnectOutcome::Stopped;
                    }
                    // communication error path: keep_alive_loop already set state = CommunicationError
                },
                ReconnectState::CommunicationError => {
                    let _ = hooks.close().await;
                    self.set_state(ReconnectState::Starting);
                },
                ReconnectState::WaitingRetry | ReconnectState::Stopped | ReconnectState::Stopping => {
                    // defensive: run() only drives Starting/Running/CommunicationError directly
                    self.set_state(ReconnectState::Starting);
                },
            }
        }
    }

    /// One bounded retry cycle: attempt connect up to `max_retries_per_cycle` times,
    /// sleeping `retry_interval_ms` between attempts; on exhaustion, WAITING_RETRY for
    /// `wait_time_after_max_retries_ms`, then reset and return to Starting.
    async fn attempt_connect_cycle(&mut self, hooks: &dyn ReconnectHooks) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            self.stats.total_connections += 1;
            match hooks.connect().await {
                Ok(()) => {
                    self.stats.successful_connections += 1;
                    self.retry_counter = 0;
                    self.last_successful_connection = Some(std::time::Instant::now());
                    self.last_keep_alive = Some(std::time::Instant::now());
                    self.set_state(ReconnectState::Running);
                    info!("reconnect controller: connected");
                    return;
                },
                Err(e) => {
                    self.stats.failed_connections += 1;
                    self.retry_counter += 1;
                    warn!(error = %e, attempt = self.retry_counter, "reconnect controller: connect failed");

                    if self.retry_counter >= self.settings.max_retries_per_cycle {
                        self.stats.reconnection_cycles += 1;
                        self.set_state(ReconnectState::WaitingRetry);
                        debug!(wait_ms = self.settings.wait_time_after_max_retries_ms, "entering wait cycle");
                        let waited = self
                            .interruptible_sleep(Duration::from_millis(self.settings.wait_time_after_max_retries_ms))
                            .await;
                        self.retry_counter = 0;
                        if !waited {
                            return;
                        }
                        self.set_state(ReconnectState::Starting);
                    } else {
                        let waited = self
                            .interruptible_sleep(Duration::from_millis(self.settings.retry_interval_ms))
                            .await;
                        if !waited {
                            return;
                        }
                    }
                },
            }
        }
    }

    /// While RUNNING: periodically send keep-alive / check connection. Returns
    /// `false` on cancellation (caller should stop), `true` after transitioning
    /// to `CommunicationError` on a keep-alive/check failure (caller retries).
    async fn keep_alive_loop(&mut self, hooks: &dyn ReconnectHooks) -> bool {
        loop {
            let poll_interval = Duration::from_millis(200.min(self.settings.retry_interval_ms.max(1)));
            if !self.interruptible_sleep(poll_interval).await {
                return false;
            }

            if self.settings.keep_alive_enabled {
                let due = self
                    .last_keep_alive
                    .map(|t| t.elapsed() >= Duration::from_secs(self.settings.keep_alive_interval_s))
                    .unwrap_or(true);
                if due {
                    match hooks.send_keep_alive().await {
                        Ok(()) => {
                            self.stats.keep_alive_sent += 1;
                            self.last_keep_alive = Some(std::time::Instant::now());
                        },
                        Err(e) => {
                            self.stats.keep_alive_failed += 1;
                            warn!(error = %e, "keep-alive failed, entering communication error");
                            self.record_disconnect();
                            self.set_state(ReconnectState::CommunicationError);
                            return true;
                        },
                    }
                }
            }

            if let Err(e) = hooks.check_connection().await {
                warn!(error = %e, "connection check failed, entering communication error");
                self.record_disconnect();
                self.set_state(ReconnectState::CommunicationError);
                return true;
            }
        }
    }

    fn record_disconnect(&mut self) {
        if let Some(connected_at) = self.last_successful_connection.take() {
            let duration = connected_at.elapsed().as_secs_f64();
            // exponentially-weighted mean, alpha = 0.3 as a fixed smoothing constant
            self.stats.avg_connection_duration_s = if self.stats.avg_connection_duration_s == 0.0 {
                duration
            } else {
                0.3 * duration + 0.7 * self.stats.avg_connection_duration_s
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FailNTimesThenSucceed {
        remaining_failures: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ReconnectHooks for FailNTimesThenSucceed {
        async fn connect(&self) -> Result<(), String> {
            if self.remaining_failures.load(Ordering::SeqCst) > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                Err("refused".into())
            } else {
                Ok(())
            }
        }
        async fn close(&self) -> Result<(), String> {
            Ok(())
        }
        async fn check_connection(&self) -> Result<(), String> {
            Ok(())
        }
        async fn send_keep_alive(&self) -> Result<(), String> {
            Ok(())
        }
    }

    fn fast_settings() -> ReconnectionSettings {
        ReconnectionSettings {
            auto_reconnect: true,
            retry_interval_ms: 5,
            max_retries_per_cycle: 3,
            wait_time_after_max_retries_ms: 20,
            keep_alive_enabled: false,
            keep_alive_interval_s: 30,
            connection_timeout_s: 1,
        }
    }

    #[tokio::test]
    async fn connects_after_retries_within_one_cycle() {
        let hooks = FailNTimesThenSucceed { remaining_failures: AtomicU32::new(2) };
        let mut controller = ReconnectController::new(fast_settings());
        controller.attempt_connect_cycle(&hooks).await;
        assert_eq!(controller.state(), ReconnectState::Running);
        assert_eq!(controller.stats().failed_connections, 2);
        assert_eq!(controller.stats().successful_connections, 1);
        assert_eq!(controller.stats().reconnection_cycles, 0);
    }

    #[tokio::test]
    async fn exhausting_retries_enters_wait_cycle_then_reconnects() {
        // fails 3 times (== max_retries_per_cycle), enters wait, then succeeds.
        let hooks = FailNTimesThenSucceed { remaining_failures: AtomicU32::new(3) };
        let mut controller = ReconnectController::new(fast_settings());
        controller.attempt_connect_cycle(&hooks).await;
        assert_eq!(controller.state(), ReconnectState::Running);
        assert_eq!(controller.stats().reconnection_cycles, 1);
        assert_eq!(controller.stats().failed_connections, 3);
    }

    #[tokio::test]
    async fn force_reconnect_clears_retry_counter() {
        let mut controller = ReconnectController::new(fast_settings());
        controller.retry_counter = 2;
        controller.force_reconnect();
        assert_eq!(controller.retry_counter, 0);
        assert_eq!(controller.state(), ReconnectState::Starting);
    }

    #[tokio::test]
    async fn update_settings_rejects_invalid_and_resets_counter_on_success() {
        let mut controller = ReconnectController::new(fast_settings());
        controller.retry_counter = 1;
        let mut bad = fast_settings();
        bad.retry_interval_ms = 0;
        assert!(controller.update_settings(bad).is_err());

        let good = fast_settings();
        assert!(controller.update_settings(good).is_ok());
        assert_eq!(controller.retry_counter, 0);
    }

    struct AlwaysFail;
    #[async_trait::async_trait]
    impl ReconnectHooks for AlwaysFail {
        async fn connect(&self) -> Result<(), String> {
            Err("refused".into())
        }
        async fn close(&self) -> Result<(), String> {
            Ok(())
        }
        async fn check_connection(&self) -> Result<(), String> {
            Ok(())
        }
        async fn send_keep_alive(&self) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_during_wait_cycle_is_cooperative() {
        let hooks = Arc::new(AlwaysFail);
        let mut controller = ReconnectController::new(fast_settings());
        let cancel = controller.cancellation_handle();

        // Request stop shortly after the loop starts failing its connect attempts;
        // run() must observe it at the next sleep boundary instead of retrying forever.
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            cancel.cancel();
        });

        let outcome = controller.run(&*hooks).await;
        stopper.await.unwrap();

        assert_eq!(outcome, ReconnectOutcome::Stopped);
        assert_eq!(controller.state(), ReconnectState::Stopped);
    }
}
