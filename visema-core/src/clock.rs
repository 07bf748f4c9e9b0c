// Session clock: maps wall-clock time to animation time and tick deadlines.
//
// Animation time is always `now - start`. It is never derived from a frame
// counter, so dropped or late frames do not skew the mouth movement.

use std::time::Duration;
use tokio::time::Instant;

const NANOS_PER_SEC: u128 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn start_now() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn starting_at(start: Instant) -> Self {
        Self { start }
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        millis(self.elapsed())
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// Scheduled instant of tick `tick` at `fps` frames per second: `start + tick / fps`.
    pub fn tick_deadline(&self, tick: u64, fps: u32) -> Instant {
        let fps = u128::from(fps.max(1));
        let nanos = u128::from(tick) * NANOS_PER_SEC / fps;
        self.start + duration_from_nanos(nanos)
    }

    /// Index of the first tick scheduled strictly after `now`.
    ///
    /// Ticks missed during a stall are skipped, not replayed.
    pub fn next_tick_after(&self, now: Instant, fps: u32) -> u64 {
        let fps = u128::from(fps.max(1));
        let elapsed = self.elapsed_at(now).as_nanos();
        let current = elapsed * fps / NANOS_PER_SEC;
        u64::try_from(current + 1).unwrap_or(u64::MAX)
    }
}

pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    let subsec = (nanos % NANOS_PER_SEC) as u32;
    Duration::new(secs, subsec)
}
