//! Rate limiting for outbound media frames.
//!
//! Newest frame wins: a frame offered before the minimum interval has elapsed
//! is dropped, never queued, so a slow link never sends a backlog of stale
//! frames.

use std::time::Duration;

use tokio::time::Instant;

/// Lowest accepted frame rate.
pub const MIN_FPS: u32 = 1;

/// Highest accepted frame rate.
pub const MAX_FPS: u32 = 30;

/// Verdict for one offered frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Emit,
    Drop,
}

/// Minimum-interval gate. Holds only the last emission time.
#[derive(Debug, Clone)]
pub struct Throttle {
    min_interval: Duration,
    last_emit_at: Option<Instant>,
}

impl Throttle {
    /// Throttle to `fps` frames per second, clamped to `1..=30`.
    pub fn from_fps(fps: u32) -> Self {
        let fps = fps.clamp(MIN_FPS, MAX_FPS);
        Self::with_interval(Duration::from_secs(1) / fps)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit_at: None,
        }
    }

    pub fn offer(&mut self, now: Instant) -> ThrottleDecision {
        if let Some(last) = self.last_emit_at {
            if now.saturating_duration_since(last) < self.min_interval {
                return ThrottleDecision::Drop;
            }
        }
        self.last_emit_at = Some(now);
        ThrottleDecision::Emit
    }

    /// Forget the last emission, e.g. when a new connection becomes ready.
    pub fn reset(&mut self) {
        self.last_emit_at = None;
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn last_emit_at(&self) -> Option<Instant> {
        self.last_emit_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_first_and_post_interval_frames_emit() {
        let interval = Duration::from_millis(500);
        let eps = Duration::from_millis(1);
        let mut throttle = Throttle::with_interval(interval);
        let t = Instant::now();

        let decisions = [
            throttle.offer(t),
            throttle.offer(t + eps),
            throttle.offer(t + interval - eps),
            throttle.offer(t + interval + eps),
        ];
        assert_eq!(
            decisions,
            [
                ThrottleDecision::Emit,
                ThrottleDecision::Drop,
                ThrottleDecision::Drop,
                ThrottleDecision::Emit,
            ]
        );
    }

    #[test]
    fn test_window_restarts_at_last_emission() {
        let mut throttle = Throttle::with_interval(Duration::from_secs(1));
        let t = Instant::now();
        assert_eq!(throttle.offer(t), ThrottleDecision::Emit);
        assert_eq!(throttle.offer(t + Duration::from_millis(1500)), ThrottleDecision::Emit);
        // Measured from 1.5s, not from 1s
        assert_eq!(throttle.offer(t + Duration::from_millis(2200)), ThrottleDecision::Drop);
        assert_eq!(throttle.last_emit_at(), Some(t + Duration::from_millis(1500)));
    }

    #[test]
    fn test_dropped_frames_do_not_extend_window() {
        let mut throttle = Throttle::with_interval(Duration::from_secs(1));
        let t = Instant::now();
        throttle.offer(t);
        for ms in (100..1000).step_by(100) {
            assert_eq!(
                throttle.offer(t + Duration::from_millis(ms)),
                ThrottleDecision::Drop
            );
        }
        assert_eq!(throttle.offer(t + Duration::from_secs(1)), ThrottleDecision::Emit);
    }

    #[test]
    fn test_from_fps_clamps() {
        assert_eq!(Throttle::from_fps(1).min_interval(), Duration::from_secs(1));
        assert_eq!(Throttle::from_fps(0).min_interval(), Duration::from_secs(1));
        assert_eq!(
            Throttle::from_fps(10).min_interval(),
            Duration::from_millis(100)
        );
        assert_eq!(
            Throttle::from_fps(240).min_interval(),
            Duration::from_secs(1) / 30
        );
    }

    #[test]
    fn test_reset_allows_immediate_emit() {
        let mut throttle = Throttle::from_fps(1);
        let t = Instant::now();
        throttle.offer(t);
        throttle.reset();
        assert_eq!(throttle.offer(t + Duration::from_millis(10)), ThrottleDecision::Emit);
    }
}
