//! Reconnection backoff and heartbeat liveness.

use std::time::Duration;

use tokio::time::Instant;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on any single retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retries before giving up with `ReconnectExhausted`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 12;

/// Delay before retry `attempt` (0-indexed): `min(base * 2^attempt, cap)`.
pub fn compute_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    // checked_shl is None once the shift reaches the bit width
    let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(multiplier).unwrap_or(cap).min(cap)
}

/// Roughly thirty years; stands in for "never" when a deadline would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + span`, saturating instead of panicking on overflow.
pub fn deadline_after(now: Instant, span: Duration) -> Instant {
    now.checked_add(span)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Attempt counter for one run of consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    /// Consume one attempt slot and return its delay, or `None` once every
    /// slot has been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = compute_backoff(self.attempt, self.base, self.cap);
        self.attempt += 1;
        Some(delay)
    }

    /// Give back the most recent slot. Used when a scheduled attempt was
    /// suspended rather than tried.
    pub fn refund(&mut self) {
        self.attempt = self.attempt.saturating_sub(1);
    }

    /// Called once a connection reaches `Ready`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Slots consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Heartbeat schedule and inbound-traffic watchdog for a `Ready` connection.
///
/// A heartbeat goes out every `interval`. Once one has been sent, some
/// inbound traffic must arrive within `grace` or the connection is declared
/// dead. Any inbound frame counts, not only the heartbeat reply.
#[derive(Debug, Clone)]
pub struct Liveness {
    interval: Duration,
    grace: Duration,
    next_heartbeat: Instant,
    awaiting_since: Option<Instant>,
    last_inbound: Instant,
}

impl Liveness {
    /// A zero `interval` disables heartbeats entirely.
    pub fn new(interval: Duration, grace: Duration, now: Instant) -> Self {
        Self {
            interval,
            grace,
            next_heartbeat: deadline_after(now, interval),
            awaiting_since: None,
            last_inbound: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// When the next heartbeat should be sent.
    pub fn heartbeat_due(&self) -> Option<Instant> {
        self.is_enabled().then_some(self.next_heartbeat)
    }

    pub fn heartbeat_sent(&mut self, now: Instant) {
        self.next_heartbeat = deadline_after(now, self.interval);
        if self.awaiting_since.is_none() {
            self.awaiting_since = Some(now);
        }
    }

    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
        self.awaiting_since = None;
    }

    /// Deadline for inbound traffic, set while a heartbeat is unanswered.
    pub fn grace_deadline(&self) -> Option<Instant> {
        self.awaiting_since.map(|sent| deadline_after(sent, self.grace))
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.grace_deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn last_inbound(&self) -> Instant {
        self.last_inbound
    }
}
