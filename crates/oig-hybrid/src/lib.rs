//! Hybrid state machine (C8): decides, per frame, whether to forward to the
//! cloud or synthesize a local reply.
//!
//! Pure deterministic logic — no IO, no wall-clock reads. The caller
//! supplies `now` (a monotonic `Instant`) at every call, so the state
//! machine itself stays trivially unit-testable.

use std::time::{Duration, Instant};

/// The three configured operating modes (`proxy_mode` config key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfiguredMode {
    Online,
    Hybrid,
    Offline,
}

/// An offline transition, emitted by [`HybridState::record_failure`] the
/// instant the machine actually flips to offline (not on every failure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineEvent {
    pub reason: String,
}

/// Tracks the configured mode, the current failure streak against cloud
/// calls, and when (if ever) the machine tripped into offline operation.
#[derive(Debug, Clone)]
pub struct HybridState {
    configured_mode: ConfiguredMode,
    fail_count: u32,
    fail_threshold: u32,
    retry_interval: Duration,
    last_offline_time: Option<Instant>,
    in_offline: bool,
    last_offline_reason: Option<String>,
}

impl HybridState {
    pub fn new(configured_mode: ConfiguredMode, fail_threshold: u32, retry_interval: Duration) -> Self {
        Self {
            configured_mode,
            fail_count: 0,
            fail_threshold: fail_threshold.max(1),
            retry_interval,
            last_offline_time: None,
            in_offline: false,
            last_offline_reason: None,
        }
    }

    pub fn configured_mode(&self) -> ConfiguredMode {
        self.configured_mode
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    pub fn in_offline(&self) -> bool {
        self.in_offline
    }

    pub fn last_offline_reason(&self) -> Option<&str> {
        self.last_offline_reason.as_deref()
    }

    /// The runtime mode reported to status/telemetry: for `Hybrid`, flips
    /// between logically `Online`/`Offline` depending on `in_offline`.
    pub fn runtime_mode(&self) -> ConfiguredMode {
        match self.configured_mode {
            ConfiguredMode::Hybrid if self.in_offline => ConfiguredMode::Offline,
            ConfiguredMode::Hybrid => ConfiguredMode::Online,
            other => other,
        }
    }

    /// `true` when this frame should be forwarded to the cloud rather than
    /// synthesized locally.
    pub fn should_try_cloud(&self, now: Instant) -> bool {
        match self.configured_mode {
            ConfiguredMode::Offline => false,
            ConfiguredMode::Online => true,
            ConfiguredMode::Hybrid => {
                if !self.in_offline {
                    return true;
                }
                match self.last_offline_time {
                    Some(t) => now.duration_since(t) >= self.retry_interval,
                    None => true,
                }
            }
        }
    }

    /// Records a cloud failure (connect, timeout, EOF, or error). Only
    /// `Hybrid` mode accumulates failures; `Online`/`Offline` ignore this.
    /// Returns `Some(OfflineEvent)` exactly at the instant the machine
    /// transitions into offline.
    pub fn record_failure(&mut self, reason: impl Into<String>, now: Instant) -> Option<OfflineEvent> {
        if self.configured_mode != ConfiguredMode::Hybrid {
            return None;
        }
        let reason = reason.into();
        self.fail_count += 1;
        if self.in_offline {
            self.last_offline_time = Some(now);
            self.last_offline_reason = Some(reason);
            return None;
        }
        if self.fail_count >= self.fail_threshold {
            self.in_offline = true;
            self.last_offline_time = Some(now);
            self.last_offline_reason = Some(reason.clone());
            return Some(OfflineEvent { reason });
        }
        None
    }

    /// Records a successful cloud round-trip. Clears `fail_count` and, if
    /// the machine was offline, transitions back to online.
    pub fn record_success(&mut self) {
        if self.configured_mode != ConfiguredMode::Hybrid {
            return;
        }
        if self.in_offline {
            self.in_offline = false;
            self.last_offline_reason = None;
        }
        self.fail_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn threshold_3() -> HybridState {
        HybridState::new(ConfiguredMode::Hybrid, 3, Duration::from_secs(30))
    }

    #[test]
    fn online_mode_always_tries_cloud() {
        let s = HybridState::new(ConfiguredMode::Online, 3, Duration::from_secs(30));
        assert!(s.should_try_cloud(Instant::now()));
    }

    #[test]
    fn offline_mode_never_tries_cloud() {
        let s = HybridState::new(ConfiguredMode::Offline, 3, Duration::from_secs(30));
        assert!(!s.should_try_cloud(Instant::now()));
    }

    #[test]
    fn hybrid_trips_after_threshold_failures() {
        let mut s = threshold_3();
        let t0 = Instant::now();
        assert!(s.record_failure("timeout", t0).is_none());
        assert!(s.record_failure("timeout", t0).is_none());
        let event = s.record_failure("timeout", t0).unwrap();
        assert_eq!(event.reason, "timeout");
        assert!(s.in_offline());
    }

    #[test]
    fn hybrid_blocks_cloud_until_retry_interval_elapses() {
        let mut s = threshold_3();
        let t0 = Instant::now();
        for _ in 0..3 {
            s.record_failure("timeout", t0);
        }
        assert!(s.in_offline());
        assert!(!s.should_try_cloud(t0 + Duration::from_secs(5)));
        assert!(s.should_try_cloud(t0 + Duration::from_secs(31)));
    }

    #[test]
    fn success_after_offline_restores_online() {
        let mut s = threshold_3();
        let t0 = Instant::now();
        for _ in 0..3 {
            s.record_failure("timeout", t0);
        }
        assert!(s.in_offline());
        s.record_success();
        assert!(!s.in_offline());
        assert_eq!(s.fail_count(), 0);
        assert!(s.last_offline_reason().is_none());
    }

    #[test]
    fn repeated_offline_failures_bump_window_without_retripping() {
        let mut s = threshold_3();
        let t0 = Instant::now();
        for _ in 0..3 {
            s.record_failure("timeout", t0);
        }
        let t1 = t0 + Duration::from_secs(10);
        assert!(s.record_failure("timeout", t1).is_none());
        // Window restarted from t1, so t0+31s (21s after t1) is not yet enough.
        assert!(!s.should_try_cloud(t0 + Duration::from_secs(31)));
        assert!(s.should_try_cloud(t1 + Duration::from_secs(31)));
    }

    #[test]
    fn online_and_offline_modes_never_accumulate_failures() {
        let mut s = HybridState::new(ConfiguredMode::Online, 1, Duration::from_secs(1));
        assert!(s.record_failure("x", Instant::now()).is_none());
        assert_eq!(s.fail_count(), 0);
    }
}
