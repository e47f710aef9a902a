use std::time::Duration;

/// Exponential retry delay: each `next()` yields the current delay and
/// doubles it, capped at the ceiling. `reset()` restores the floor.
pub struct BackoffStrategy {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl BackoffStrategy {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}
