//! Periodic scanner that cancels requests exceeding TTFB, stall, or hard
//! timeouts.
//!
//! Owns only cancellation handles, never the request bodies or streams
//! themselves — the actual teardown happens in [`crate::tap`] once its
//! `select!` observes the token firing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::tap::{CancelReason, RequestCancelToken};
use crate::tracker::{RequestStatus, Tracker};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(with = "duration_millis", default = "default_ttfb_timeout")]
    pub ttfb_timeout: Duration,
    #[serde(with = "duration_millis", default = "default_stall_timeout")]
    pub stall_timeout: Duration,
    #[serde(with = "duration_millis", default = "default_hard_timeout")]
    pub hard_timeout: Duration,
    #[serde(with = "duration_millis", default = "default_scan_interval")]
    pub scan_interval: Duration,
}

/// (De)serialize a `Duration` as a plain millisecond integer, since the
/// config file is flat JSON rather than humantime strings.
mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

fn default_ttfb_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_stall_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_hard_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_scan_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            ttfb_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_secs(600),
            scan_interval: Duration::from_secs(1),
        }
    }
}

struct Registered {
    cancel: Arc<RequestCancelToken>,
    start: Instant,
}

/// Watches in-flight requests registered by the Proxy Handler and cancels
/// ones that have overstayed their timeout budget.
pub struct Watchdog {
    config: WatchdogConfig,
    registered: Mutex<HashMap<u64, Registered>>,
    tracker: Arc<Tracker>,
    shutdown: CancellationToken,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, tracker: Arc<Tracker>) -> Self {
        Self {
            config,
            registered: Mutex::new(HashMap::new()),
            tracker,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a request's cancellation handle at request start.
    pub fn register(&self, id: u64, cancel: Arc<RequestCancelToken>) {
        self.registered.lock().insert(
            id,
            Registered {
                cancel,
                start: Instant::now(),
            },
        );
    }

    /// Deregister a request that finished on its own (success, client
    /// disconnect, upstream error) before the watchdog ever touched it.
    pub fn deregister(&self, id: u64) {
        self.registered.lock().remove(&id);
    }

    /// Spawn the periodic scanner task. Returns immediately; the task runs
    /// until [`Watchdog::shutdown`] is called.
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.scan_interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let watchdog = self.clone();
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            watchdog.scan_once();
                        }));
                        if let Err(panic) = result {
                            error!(?panic, "watchdog scan panicked, continuing");
                        }
                    }
                }
            }
        });
    }

    fn scan_once(&self) {
        let now = Instant::now();
        let snapshot = self.tracker.snapshot();
        let by_id: HashMap<u64, _> = snapshot
            .in_flight
            .into_iter()
            .map(|info| (info.id, info))
            .collect();

        // Collect expirations first so we don't mutate `registered` while
        // holding it across the tracker snapshot work above.
        let mut expired: Vec<(u64, Arc<RequestCancelToken>, CancelReason)> = Vec::new();
        {
            let guard = self.registered.lock();
            for (&id, reg) in guard.iter() {
                let Some(info) = by_id.get(&id) else {
                    // No longer in-flight; will be cleaned up by deregister()
                    // or the next cancellation attempt below finding it gone.
                    continue;
                };

                let reason = if info.first_byte.is_none()
                    && now.duration_since(reg.start) > self.config.ttfb_timeout
                {
                    Some(CancelReason::TimeoutTtfb)
                } else if let Some(last_activity) = info.last_activity {
                    if now.saturating_duration_since(last_activity) > self.config.stall_timeout {
                        Some(CancelReason::TimeoutStall)
                    } else {
                        None
                    }
                } else {
                    None
                };

                let reason = reason.or_else(|| {
                    if now.duration_since(reg.start) > self.config.hard_timeout {
                        Some(CancelReason::TimeoutHard)
                    } else {
                        None
                    }
                });

                if let Some(reason) = reason {
                    expired.push((id, reg.cancel.clone(), reason));
                }
            }
        }

        if expired.is_empty() {
            return;
        }

        let mut guard = self.registered.lock();
        for (id, cancel, reason) in expired {
            // Map-remove-before-cancel: prevents this id from being
            // double-cancelled by a later scan if it's still present when
            // cancellation propagates.
            if guard.remove(&id).is_none() {
                continue;
            }
            drop(guard);

            cancel.cancel(reason);
            self.tracker.finish(id, reason.status(), None);
            warn!(request_id = id, status = reason.status().as_str(), "watchdog canceled request");

            guard = self.registered.lock();
        }
    }

    /// Idempotent shutdown of the scanner task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::tracker::Endpoint;

    fn watchdog_with(config: WatchdogConfig) -> (Arc<Watchdog>, Arc<Tracker>) {
        let tracker = Arc::new(Tracker::new(16, EventBus::new(100, 10), Duration::from_millis(10)));
        let watchdog = Arc::new(Watchdog::new(config, tracker.clone()));
        (watchdog, tracker)
    }

    #[test]
    fn ttfb_timeout_cancels_request_without_first_byte() {
        let (watchdog, tracker) = watchdog_with(WatchdogConfig {
            ttfb_timeout: Duration::from_millis(1),
            stall_timeout: Duration::from_secs(999),
            hard_timeout: Duration::from_secs(999),
            scan_interval: Duration::from_secs(1),
        });
        let id = tracker.next_id();
        tracker.start(id, Endpoint::Chat, "m1".into(), false);
        let cancel = Arc::new(RequestCancelToken::new());
        watchdog.register(id, cancel.clone());

        std::thread::sleep(Duration::from_millis(5));
        watchdog.scan_once();

        assert!(cancel.is_cancelled());
        assert_eq!(cancel.reason(), Some(CancelReason::TimeoutTtfb));
        assert!(tracker.get(id).is_none());
    }

    #[test]
    fn stall_timeout_cancels_after_first_byte_but_no_activity() {
        let (watchdog, tracker) = watchdog_with(WatchdogConfig {
            ttfb_timeout: Duration::from_secs(999),
            stall_timeout: Duration::from_millis(1),
            hard_timeout: Duration::from_secs(999),
            scan_interval: Duration::from_secs(1),
        });
        let id = tracker.next_id();
        tracker.start(id, Endpoint::Chat, "m1".into(), false);
        tracker.mark_first_byte(id);
        let cancel = Arc::new(RequestCancelToken::new());
        watchdog.register(id, cancel.clone());

        std::thread::sleep(Duration::from_millis(10));
        watchdog.scan_once();

        assert_eq!(cancel.reason(), Some(CancelReason::TimeoutStall));
    }

    #[test]
    fn hard_timeout_fires_independently() {
        let (watchdog, tracker) = watchdog_with(WatchdogConfig {
            ttfb_timeout: Duration::from_secs(999),
            stall_timeout: Duration::from_secs(999),
            hard_timeout: Duration::from_millis(1),
            scan_interval: Duration::from_secs(1),
        });
        let id = tracker.next_id();
        tracker.start(id, Endpoint::Chat, "m1".into(), false);
        tracker.mark_first_byte(id);
        let cancel = Arc::new(RequestCancelToken::new());
        watchdog.register(id, cancel.clone());

        std::thread::sleep(Duration::from_millis(5));
        watchdog.scan_once();

        assert_eq!(cancel.reason(), Some(CancelReason::TimeoutHard));
    }

    #[test]
    fn healthy_request_is_left_alone() {
        let (watchdog, tracker) = watchdog_with(WatchdogConfig::default());
        let id = tracker.next_id();
        tracker.start(id, Endpoint::Chat, "m1".into(), false);
        let cancel = Arc::new(RequestCancelToken::new());
        watchdog.register(id, cancel.clone());

        watchdog.scan_once();

        assert!(!cancel.is_cancelled());
        assert!(tracker.get(id).is_some());
    }

    #[test]
    fn deregister_removes_request_from_scan_consideration() {
        let (watchdog, tracker) = watchdog_with(WatchdogConfig {
            ttfb_timeout: Duration::from_millis(1),
            ..WatchdogConfig::default()
        });
        let id = tracker.next_id();
        tracker.start(id, Endpoint::Chat, "m1".into(), false);
        let cancel = Arc::new(RequestCancelToken::new());
        watchdog.register(id, cancel.clone());
        watchdog.deregister(id);

        std::thread::sleep(Duration::from_millis(5));
        watchdog.scan_once();

        assert!(!cancel.is_cancelled());
    }
}
