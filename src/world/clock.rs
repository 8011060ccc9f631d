use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GameTick(pub u64);

/// Fixed-rate simulation clock. The tick thread advances it exactly once per
/// cycle; everything else only reads it.
#[derive(Debug, Clone)]
pub struct GameClock {
    tick_length: Duration,
    tick: GameTick,
}

impl GameClock {
    pub fn new(tick_length: Duration) -> Self {
        let tick_length = if tick_length.is_zero() {
            Duration::from_millis(1)
        } else {
            tick_length
        };
        Self {
            tick_length,
            tick: GameTick(0),
        }
    }

    pub fn tick_length(&self) -> Duration {
        self.tick_length
    }

    pub fn now(&self) -> GameTick {
        self.tick
    }

    pub fn advance(&mut self, ticks: u64) -> GameTick {
        self.tick.0 = self.tick.0.saturating_add(ticks);
        self.tick
    }

    pub fn ticks_from_duration_round_up(&self, duration: Duration) -> u64 {
        if duration.is_zero() {
            return 0;
        }
        let tick_nanos = self.tick_length.as_nanos().max(1);
        let duration_nanos = duration.as_nanos();
        let ticks = (duration_nanos + tick_nanos - 1) / tick_nanos;
        ticks.min(u64::MAX as u128) as u64
    }

    pub fn duration_for_ticks(&self, ticks: u64) -> Duration {
        let nanos = self
            .tick_length
            .as_nanos()
            .saturating_mul(ticks as u128)
            .min(u64::MAX as u128) as u64;
        Duration::from_nanos(nanos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cooldown {
    ready_at: GameTick,
}

impl Cooldown {
    pub fn ready() -> Self {
        Self {
            ready_at: GameTick(0),
        }
    }

    pub fn from_ticks_from_now(clock: &GameClock, ticks: u64) -> Self {
        Self {
            ready_at: GameTick(clock.now().0.saturating_add(ticks)),
        }
    }

    pub fn ready_at(&self) -> GameTick {
        self.ready_at
    }

    pub fn is_ready(&self, clock: &GameClock) -> bool {
        clock.now() >= self.ready_at
    }

    pub fn remaining_ticks(&self, clock: &GameClock) -> u64 {
        self.ready_at.0.saturating_sub(clock.now().0)
    }

    pub fn reset_from_now_ticks(&mut self, clock: &GameClock, ticks: u64) {
        self.ready_at = GameTick(clock.now().0.saturating_add(ticks));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_advances_monotonically() {
        let mut clock = GameClock::new(Duration::from_millis(600));
        assert_eq!(clock.now(), GameTick(0));
        clock.advance(1);
        clock.advance(3);
        assert_eq!(clock.now(), GameTick(4));
    }

    #[test]
    fn zero_tick_length_is_clamped() {
        let clock = GameClock::new(Duration::ZERO);
        assert!(!clock.tick_length().is_zero());
    }

    #[test]
    fn duration_conversion_rounds_up() {
        let clock = GameClock::new(Duration::from_millis(600));
        assert_eq!(clock.ticks_from_duration_round_up(Duration::ZERO), 0);
        assert_eq!(
            clock.ticks_from_duration_round_up(Duration::from_millis(1)),
            1
        );
        assert_eq!(
            clock.ticks_from_duration_round_up(Duration::from_millis(600)),
            1
        );
        assert_eq!(
            clock.ticks_from_duration_round_up(Duration::from_millis(601)),
            2
        );
        assert_eq!(clock.duration_for_ticks(3), Duration::from_millis(1800));
    }

    #[test]
    fn cooldown_tracks_readiness() {
        let mut clock = GameClock::new(Duration::from_millis(600));
        let mut cooldown = Cooldown::ready();
        assert!(cooldown.is_ready(&clock));

        cooldown.reset_from_now_ticks(&clock, 4);
        assert!(!cooldown.is_ready(&clock));
        assert_eq!(cooldown.remaining_ticks(&clock), 4);

        clock.advance(4);
        assert!(cooldown.is_ready(&clock));
        assert_eq!(cooldown.remaining_ticks(&clock), 0);
    }
}
