use std::time::Duration;

/// Tick-based countdown guarding one transient condition
///
/// Armed budgets count down once per scheduler tick; `tick` reports the
/// transition to zero exactly once, after which the budget is disarmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    name: &'static str,
    max_ticks: u32,
    remaining: Option<u32>,
}

impl RetryBudget {
    pub fn new(name: &'static str, max_ticks: u32) -> Self {
        Self {
            name,
            max_ticks: max_ticks.max(1),
            remaining: None,
        }
    }

    /// Budget lasting `timeout`, rounded up to whole ticks
    pub fn from_timeout(name: &'static str, timeout: Duration, tick: Duration) -> Self {
        let tick_ms = tick.as_millis().max(1);
        let ticks = timeout.as_millis().div_ceil(tick_ms);
        Self::new(name, u32::try_from(ticks).unwrap_or(u32::MAX))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_ticks(&self) -> u32 {
        self.max_ticks
    }

    pub fn remaining(&self) -> Option<u32> {
        self.remaining
    }

    pub fn is_armed(&self) -> bool {
        self.remaining.is_some()
    }

    /// Restart the countdown from the configured maximum
    pub fn arm(&mut self) {
        self.remaining = Some(self.max_ticks);
    }

    pub fn cancel(&mut self) {
        self.remaining = None;
    }

    /// Consume one tick; returns true on the tick that reaches zero
    pub fn tick(&mut self) -> bool {
        match self.remaining {
            Some(left) if left <= 1 => {
                self.remaining = None;
                true
            }
            Some(left) => {
                self.remaining = Some(left - 1);
                false
            }
            None => false,
        }
    }
}
