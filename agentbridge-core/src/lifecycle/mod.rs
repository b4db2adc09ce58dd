//! Process lifecycle for the bridge.
//!
//! ```text
//! Starting ──(all conditions met)──► Ready ──► ShuttingDown ──► Stopped
//!     └──────────────────────────────────────────┘
//! ```
//!
//! States only move forward. The bridge promotes itself to `Ready` once every
//! [`Condition`] is satisfied: configuration loaded and the registration log
//! replayed. Shutdown refuses new calls, drains the ones in progress, then
//! tears components down.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod health;

pub use health::{ReadinessChecks, health_router};

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Starting,
    /// Serving calls
    Ready,
    /// Draining; new calls are refused
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs gating readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Configuration parsed and validated
    ConfigLoaded,
    /// Registration log replayed up to its end offsets
    RegistrationsLoaded,
}

impl Condition {
    pub const ALL: [Condition; 2] = [Condition::ConfigLoaded, Condition::RegistrationsLoaded];

    const fn bit(self) -> u8 {
        match self {
            Self::ConfigLoaded => 0b01,
            Self::RegistrationsLoaded => 0b10,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConfigLoaded => "config_loaded",
            Self::RegistrationsLoaded => "registrations_loaded",
        }
    }
}

const ALL_CONDITIONS: u8 = Condition::ConfigLoaded.bit() | Condition::RegistrationsLoaded.bit();

/// Outcome of [`LifecycleManager::drain_calls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// The deadline passed with calls still running
    Abandoned { in_flight: usize },
}

// ============================================================================
// Lifecycle Manager
// ============================================================================

pub struct LifecycleManager {
    state: ArcSwap<LifecycleState>,
    conditions: AtomicU8,
    in_flight: AtomicUsize,
    call_finished: Notify,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("state", &self.state())
            .field("checks", &self.readiness_checks())
            .field("in_flight", &self.in_flight_calls())
            .finish()
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(LifecycleState::Starting),
            conditions: AtomicU8::new(0),
            in_flight: AtomicUsize::new(0),
            call_finished: Notify::new(),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == LifecycleState::Ready
    }

    /// True from the moment shutdown begins.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state() >= LifecycleState::ShuttingDown
    }

    /// Moves to `next` unless the current state is already at or past it.
    fn advance(&self, next: LifecycleState) -> bool {
        let previous = self.state.rcu(|current| {
            if **current < next {
                Arc::new(next)
            } else {
                Arc::clone(current)
            }
        });
        *previous < next
    }

    // ------------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------------

    /// Records `condition`. The last one to arrive makes the bridge ready.
    pub fn satisfy(&self, condition: Condition) {
        let before = self.conditions.fetch_or(condition.bit(), Ordering::AcqRel);
        debug!(condition = condition.name(), "Readiness condition satisfied");
        if before | condition.bit() == ALL_CONDITIONS && self.advance(LifecycleState::Ready) {
            info!(
                version = self.version(),
                startup_ms = self.started_at.elapsed().as_millis() as u64,
                "AgentBridge ready"
            );
        }
    }

    #[must_use]
    pub fn readiness_checks(&self) -> ReadinessChecks {
        let bits = self.conditions.load(Ordering::Acquire);
        ReadinessChecks::from_fn(|condition| bits & condition.bit() != 0)
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    /// Admits one call, or `None` once shutdown has begun.
    ///
    /// The call counts as in flight until the guard drops.
    #[must_use]
    pub fn begin_call(self: &Arc<Self>) -> Option<CallGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(CallGuard {
            lifecycle: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn in_flight_calls(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Waits until no call is in flight or `timeout` passes.
    pub async fn drain_calls(&self, timeout: Duration) -> DrainOutcome {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.call_finished.notified();
                if self.in_flight_calls() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await;

        match drained {
            Ok(()) => DrainOutcome::Drained,
            Err(_) => {
                let in_flight = self.in_flight_calls();
                warn!(in_flight, "Calls still running after drain timeout");
                DrainOutcome::Abandoned { in_flight }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Token cancelled when shutdown begins.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Refuses new calls and cancels the shutdown token. Idempotent.
    pub fn begin_shutdown(&self) {
        if self.advance(LifecycleState::ShuttingDown) {
            info!(in_flight = self.in_flight_calls(), "Shutdown initiated");
        }
        self.shutdown.cancel();
    }

    pub fn mark_stopped(&self) {
        self.shutdown.cancel();
        if self.advance(LifecycleState::Stopped) {
            info!(uptime_seconds = self.uptime_seconds(), "AgentBridge stopped");
        }
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    #[must_use]
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

/// Marks one admitted call; dropping it ends the call.
#[derive(Debug)]
pub struct CallGuard {
    lifecycle: Arc<LifecycleManager>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.lifecycle.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lifecycle.call_finished.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_once_every_condition_holds() {
        let lifecycle = LifecycleManager::new();
        assert_eq!(lifecycle.state(), LifecycleState::Starting);
        assert_eq!(
            lifecycle.readiness_checks().first_failure(),
            Some("config_loaded")
        );

        lifecycle.satisfy(Condition::RegistrationsLoaded);
        assert!(!lifecycle.is_ready());
        assert_eq!(
            lifecycle.readiness_checks().first_failure(),
            Some("config_loaded")
        );

        lifecycle.satisfy(Condition::ConfigLoaded);
        assert!(lifecycle.is_ready());
        assert!(lifecycle.readiness_checks().all_pass());
    }

    #[test]
    fn test_states_never_move_backwards() {
        let lifecycle = LifecycleManager::new();
        lifecycle.begin_shutdown();
        assert!(lifecycle.shutdown_token().is_cancelled());

        // Replay finishing during shutdown must not revive the bridge.
        for condition in Condition::ALL {
            lifecycle.satisfy(condition);
        }
        assert_eq!(lifecycle.state(), LifecycleState::ShuttingDown);

        lifecycle.mark_stopped();
        lifecycle.begin_shutdown();
        assert_eq!(lifecycle.state().to_string(), "stopped");
    }

    #[test]
    fn test_calls_refused_after_shutdown() {
        let lifecycle = Arc::new(LifecycleManager::new());
        let guard = lifecycle.begin_call();
        assert!(guard.is_some());
        assert_eq!(lifecycle.in_flight_calls(), 1);
        drop(guard);
        assert_eq!(lifecycle.in_flight_calls(), 0);

        lifecycle.begin_shutdown();
        assert!(lifecycle.begin_call().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_calls() {
        let lifecycle = Arc::new(LifecycleManager::new());
        let first = lifecycle.begin_call();
        let second = lifecycle.begin_call();

        assert_eq!(
            lifecycle.drain_calls(Duration::from_millis(200)).await,
            DrainOutcome::Abandoned { in_flight: 2 }
        );

        let drain = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.drain_calls(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!drain.is_finished());
        drop(second);
        assert_eq!(drain.await.unwrap(), DrainOutcome::Drained);
    }

    #[tokio::test]
    async fn test_drain_with_nothing_in_flight() {
        let lifecycle = LifecycleManager::new();
        assert_eq!(
            lifecycle.drain_calls(Duration::from_millis(1)).await,
            DrainOutcome::Drained
        );
    }
}
