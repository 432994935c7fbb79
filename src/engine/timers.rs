//! Timeout timers shared between the timer context and the poll loop
//!
//! Expiry is published through a `TimerHandle`: the timer side only ever sets
//! a flag, the poll loop is the only consumer that clears it. A late expiry
//! for a cancelled timer can still be observed, so consumers guard every
//! expiry with the networking flags.

use super::budget::RetryBudget;
use crate::config::TimingConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Broker session not accepted in time
    Session,
    /// WiFi association not completed in time
    Wifi,
    /// Delay before (re)initializing the cloud connection
    CloudReset,
}

impl TimeoutKind {
    pub const ALL: [TimeoutKind; 3] = [TimeoutKind::Session, TimeoutKind::Wifi, TimeoutKind::CloudReset];

    fn slot(self) -> usize {
        match self {
            TimeoutKind::Session => 0,
            TimeoutKind::Wifi => 1,
            TimeoutKind::CloudReset => 2,
        }
    }
}

/// Cloneable write side of the expiry flags
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    expired: Arc<[AtomicBool; 3]>,
}

impl TimerHandle {
    pub fn fire(&self, kind: TimeoutKind) {
        self.expired[kind.slot()].store(true, Ordering::Release);
    }

    pub fn is_pending(&self, kind: TimeoutKind) -> bool {
        self.expired[kind.slot()].load(Ordering::Acquire)
    }

    /// Read and clear the expiry flag
    pub fn take(&self, kind: TimeoutKind) -> bool {
        self.expired[kind.slot()].swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug)]
pub struct Timers {
    handle: TimerHandle,
    session: RetryBudget,
    wifi: RetryBudget,
    cloud_reset: RetryBudget,
}

impl Timers {
    pub fn new(timing: &TimingConfig) -> Self {
        let tick = timing.tick();
        Self {
            handle: TimerHandle::default(),
            session: RetryBudget::from_timeout("session", timing.session_timeout(), tick),
            wifi: RetryBudget::from_timeout("wifi", timing.wifi_timeout(), tick),
            cloud_reset: RetryBudget::from_timeout("cloud_reset", timing.reset_delay(), tick),
        }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    fn budget_mut(&mut self, kind: TimeoutKind) -> &mut RetryBudget {
        match kind {
            TimeoutKind::Session => &mut self.session,
            TimeoutKind::Wifi => &mut self.wifi,
            TimeoutKind::CloudReset => &mut self.cloud_reset,
        }
    }

    pub fn budget(&self, kind: TimeoutKind) -> &RetryBudget {
        match kind {
            TimeoutKind::Session => &self.session,
            TimeoutKind::Wifi => &self.wifi,
            TimeoutKind::CloudReset => &self.cloud_reset,
        }
    }

    pub fn is_armed(&self, kind: TimeoutKind) -> bool {
        self.budget(kind).is_armed()
    }

    pub fn arm(&mut self, kind: TimeoutKind) {
        self.budget_mut(kind).arm();
    }

    pub fn cancel(&mut self, kind: TimeoutKind) {
        self.budget_mut(kind).cancel();
        self.handle.take(kind);
    }

    pub fn cancel_all(&mut self) {
        for kind in TimeoutKind::ALL {
            self.cancel(kind);
        }
    }

    /// Count down every armed timer by one tick, firing the ones that expire
    pub fn advance(&mut self) {
        for kind in TimeoutKind::ALL {
            if self.budget_mut(kind).tick() {
                self.handle.fire(kind);
            }
        }
    }

    pub fn take_expired(&self, kind: TimeoutKind) -> bool {
        self.handle.take(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> TimingConfig {
        TimingConfig {
            tick_ms: 500,
            session_timeout_ms: 1_000,
            wifi_timeout_ms: 500,
            ..TimingConfig::default()
        }
    }

    #[test]
    fn test_timer_fires_after_budget() {
        let mut timers = Timers::new(&timing());
        timers.arm(TimeoutKind::Session);

        timers.advance();
        assert!(!timers.take_expired(TimeoutKind::Session));
        timers.advance();
        assert!(timers.take_expired(TimeoutKind::Session));
        assert!(!timers.take_expired(TimeoutKind::Session));
    }

    #[test]
    fn test_cancel_clears_pending_expiry() {
        let mut timers = Timers::new(&timing());
        timers.arm(TimeoutKind::Wifi);
        timers.advance();
        assert!(timers.handle().is_pending(TimeoutKind::Wifi));

        timers.cancel(TimeoutKind::Wifi);
        assert!(!timers.take_expired(TimeoutKind::Wifi));
    }

    #[test]
    fn test_external_handle_fires() {
        let timers = Timers::new(&timing());
        let handle = timers.handle();
        handle.fire(TimeoutKind::CloudReset);
        assert!(timers.take_expired(TimeoutKind::CloudReset));
    }
}
