//! Route status state machine with in-flight exchange tracking.
//!
//! Status reads are lock-free through `ArcSwap`; transitions are serialized by
//! a mutex so a check-then-store cannot race another transition. An atomic
//! counter with RAII guards tracks exchanges inside the route.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::RouteError;

/// Route status.
///
/// ```text
/// Stopped -> Starting -> Started <-> Suspended
///               |           |           |
///               v           v           v
///            Stopped     Stopping <-----+
///                           |
///                           v
///                        Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
    Suspended,
}

impl RouteStatus {
    #[must_use]
    pub fn can_transition_to(self, next: RouteStatus) -> bool {
        use RouteStatus::{Started, Starting, Stopped, Stopping, Suspended};
        matches!(
            (self, next),
            (Stopped | Starting, Starting | Stopped)
                | (Starting, Started)
                | (Started, Suspended)
                | (Suspended, Started)
                | (Started | Suspended, Stopping)
                | (Stopping, Stopped)
        ) && self != next
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Suspended => "suspended",
        })
    }
}

/// Status and in-flight bookkeeping for one route.
#[derive(Debug)]
pub struct RouteLifecycle {
    route_id: String,
    status: Arc<ArcSwap<RouteStatus>>,
    transition: Mutex<()>,
    in_flight: Arc<AtomicU64>,
}

impl RouteLifecycle {
    #[must_use]
    pub fn new(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            status: Arc::new(ArcSwap::from_pointee(RouteStatus::Stopped)),
            transition: Mutex::new(()),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn status(&self) -> RouteStatus {
        **self.status.load()
    }

    /// Moves to `next` if the state machine allows it from the current status.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::InvalidTransition`] otherwise.
    pub fn transition(&self, next: RouteStatus) -> Result<RouteStatus, RouteError> {
        let _serialized = self.transition.lock();
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(RouteError::InvalidTransition {
                route_id: self.route_id.clone(),
                from: current,
                to: next,
            });
        }
        self.status.store(Arc::new(next));
        Ok(current)
    }

    /// Tracks one exchange for as long as the guard lives, including while
    /// unwinding from a panic.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until no exchange is in flight, polling every 10ms. Returns
    /// `false` if `timeout` expires first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Decrements the route's in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_stopped() {
        let lifecycle = RouteLifecycle::new("r1");
        assert_eq!(lifecycle.status(), RouteStatus::Stopped);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn full_lifecycle() {
        let lifecycle = RouteLifecycle::new("r1");
        for next in [
            RouteStatus::Starting,
            RouteStatus::Started,
            RouteStatus::Suspended,
            RouteStatus::Started,
            RouteStatus::Stopping,
            RouteStatus::Stopped,
        ] {
            lifecycle.transition(next).unwrap();
            assert_eq!(lifecycle.status(), next);
        }
    }

    #[test]
    fn rejects_invalid_transitions() {
        let lifecycle = RouteLifecycle::new("r1");
        let err = lifecycle.transition(RouteStatus::Started).unwrap_err();
        assert!(matches!(
            err,
            RouteError::InvalidTransition {
                from: RouteStatus::Stopped,
                to: RouteStatus::Started,
                ..
            }
        ));
        assert_eq!(err.to_string(), "route r1 cannot move from stopped to started");

        assert!(!RouteStatus::Stopped.can_transition_to(RouteStatus::Suspended));
        assert!(!RouteStatus::Started.can_transition_to(RouteStatus::Started));
        assert!(!RouteStatus::Stopping.can_transition_to(RouteStatus::Started));
        assert!(RouteStatus::Starting.can_transition_to(RouteStatus::Stopped));
    }

    #[test]
    fn guards_track_in_flight() {
        let lifecycle = RouteLifecycle::new("r1");
        let first = lifecycle.in_flight_guard();
        let second = lifecycle.in_flight_guard();
        assert_eq!(lifecycle.in_flight_count(), 2);
        drop(first);
        assert_eq!(lifecycle.in_flight_count(), 1);
        drop(second);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_guards() {
        let lifecycle = RouteLifecycle::new("r1");
        let guard = lifecycle.in_flight_guard();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(1)).await);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out() {
        let lifecycle = RouteLifecycle::new("r1");
        let _guard = lifecycle.in_flight_guard();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(50)).await);
    }
}
