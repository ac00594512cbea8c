//! In-flight call correlation.
//!
//! [`CallTracker`] matches RPC responses to requests by id. [`TurnQueue`]
//! does the same for session-dialect turns, which carry no id on the wire and
//! are therefore matched in FIFO order.
//!
//! Both are owned by the connection task, so every mutation happens on a
//! single task. Each completion handle receives exactly one resolution:
//! a response, a timeout, or a cancellation.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use livewire_core::prelude::*;

use crate::reconnect::deadline_after;

/// Completion handle returned to callers.
pub type Completion<T> = oneshot::Receiver<Result<T>>;

struct PendingCall<T> {
    label: String,
    issued_at: Instant,
    deadline: Instant,
    timeout: Duration,
    tx: oneshot::Sender<Result<T>>,
}

/// Tracks in-flight calls on one connection instance.
///
/// Ids are decimal strings from a per-instance counter and never repeat for
/// the lifetime of the tracker. Dropping the tracker cancels whatever is still
/// pending with [`Error::ConnectionLost`].
pub struct CallTracker<T> {
    next_id: u64,
    pending: HashMap<String, PendingCall<T>>,
}

impl<T> Default for CallTracker<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallTracker<T> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate an id without tracking it (fire-and-forget requests).
    pub fn next_untracked_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    /// Register a new call and return its id and completion handle.
    pub fn register(&mut self, label: impl Into<String>, timeout: Duration) -> (String, Completion<T>) {
        let (tx, rx) = oneshot::channel();
        let id = self.register_with(label, timeout, tx);
        (id, rx)
    }

    /// Register a call whose completion sender was created by the caller.
    pub fn register_with(
        &mut self,
        label: impl Into<String>,
        timeout: Duration,
        tx: oneshot::Sender<Result<T>>,
    ) -> String {
        let id = self.next_untracked_id();
        let now = Instant::now();
        self.pending.insert(
            id.clone(),
            PendingCall {
                label: label.into(),
                issued_at: now,
                deadline: deadline_after(now, timeout),
                timeout,
                tx,
            },
        );
        id
    }

    /// Complete the call with `id`.
    ///
    /// Returns `false` (and changes nothing) when the id is unknown, e.g. a
    /// late response to a call that already timed out.
    pub fn resolve(&mut self, id: &str, result: Result<T>) -> bool {
        match self.pending.remove(id) {
            Some(call) => {
                trace!(
                    "Call {} '{}' resolved after {:?}",
                    id,
                    call.label,
                    call.issued_at.elapsed()
                );
                // Receiver may have been dropped by an impatient caller
                let _ = call.tx.send(result);
                true
            }
            None => {
                debug!("Discarding response for unknown call id {}", id);
                false
            }
        }
    }

    /// Earliest deadline among pending calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|call| call.deadline).min()
    }

    /// Fail every call whose deadline is at or before `now` with
    /// [`Error::CallTimeout`]. Returns the expired ids.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(call) = self.pending.remove(id) {
                warn!("Call {} '{}' timed out after {:?}", id, call.label, call.timeout);
                let _ = call.tx.send(Err(Error::call_timeout(call.label, call.timeout)));
            }
        }
        expired
    }

    /// Fail every pending call with the error produced by `reason`.
    pub fn cancel_all(&mut self, mut reason: impl FnMut() -> Error) -> usize {
        let count = self.pending.len();
        for (_, call) in self.pending.drain() {
            let _ = call.tx.send(Err(reason()));
        }
        if count > 0 {
            debug!("Cancelled {} pending call(s)", count);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}

impl<T> Drop for CallTracker<T> {
    fn drop(&mut self) {
        self.cancel_all(|| Error::ConnectionLost);
    }
}

// ---------------------------------------------------------------------------
// Turn correlation
// ---------------------------------------------------------------------------

/// Result of a completed session-dialect turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TurnOutput {
    /// All model text received for the turn.
    pub text: String,
    /// Whether the server cut the turn short.
    pub interrupted: bool,
}

enum TurnSlot {
    Live {
        deadline: Instant,
        timeout: Duration,
        tx: oneshot::Sender<Result<TurnOutput>>,
    },
    /// Timed out locally. The server's completion for it is still expected
    /// and must not resolve the next turn. The tombstone lapses at `until`
    /// (one more timeout span) so a server that never completes the turn
    /// cannot shift every later completion by one.
    Expired { until: Instant },
}

impl TurnSlot {
    fn is_lapsed(&self, now: Instant) -> bool {
        matches!(self, TurnSlot::Expired { until } if *until <= now)
    }
}

/// FIFO correlation of turns with `serverContent` completions.
#[derive(Default)]
pub struct TurnQueue {
    slots: VecDeque<TurnSlot>,
    buffer: String,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, timeout: Duration) -> Completion<TurnOutput> {
        let (tx, rx) = oneshot::channel();
        self.push_with(timeout, tx);
        rx
    }

    pub fn push_with(&mut self, timeout: Duration, tx: oneshot::Sender<Result<TurnOutput>>) {
        self.slots.push_back(TurnSlot::Live {
            deadline: deadline_after(Instant::now(), timeout),
            timeout,
            tx,
        });
    }

    /// Drop tombstones whose completion never came.
    fn prune_lapsed(&mut self, now: Instant) {
        let before = self.slots.len();
        self.slots.retain(|slot| !slot.is_lapsed(now));
        let pruned = before - self.slots.len();
        if pruned > 0 {
            debug!("Gave up on {} expired turn(s) the server never completed", pruned);
        }
    }

    /// Accumulate model text for the oldest open turn.
    pub fn append_text(&mut self, text: &str) {
        self.prune_lapsed(Instant::now());
        if matches!(self.slots.front(), Some(TurnSlot::Live { .. })) {
            self.buffer.push_str(text);
        }
    }

    /// Close the oldest turn. Returns `true` when a waiting caller was
    /// resolved, `false` when the completion belonged to an expired turn or
    /// no turn was open.
    pub fn complete(&mut self, interrupted: bool) -> bool {
        self.prune_lapsed(Instant::now());
        let text = std::mem::take(&mut self.buffer);
        match self.slots.pop_front() {
            Some(TurnSlot::Live { tx, .. }) => {
                let _ = tx.send(Ok(TurnOutput { text, interrupted }));
                true
            }
            Some(TurnSlot::Expired { .. }) => {
                debug!("Discarding completion of an expired turn");
                false
            }
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                TurnSlot::Live { deadline, .. } => Some(*deadline),
                TurnSlot::Expired { .. } => None,
            })
            .min()
    }

    /// Fail turns whose deadline has passed, leaving tombstones in their
    /// place. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        self.prune_lapsed(now);
        let mut count = 0;
        for slot in self.slots.iter_mut() {
            let due = matches!(slot, TurnSlot::Live { deadline, .. } if *deadline <= now);
            if !due {
                continue;
            }
            let tombstone = TurnSlot::Expired {
                until: deadline_after(now, live_timeout(slot)),
            };
            if let TurnSlot::Live { timeout, tx, .. } = std::mem::replace(slot, tombstone) {
                warn!("Turn timed out after {:?}", timeout);
                let _ = tx.send(Err(Error::call_timeout("turn", timeout)));
                count += 1;
            }
        }
        if matches!(self.slots.front(), Some(TurnSlot::Expired { .. })) {
            self.buffer.clear();
        }
        count
    }

    pub fn cancel_all(&mut self, mut reason: impl FnMut() -> Error) -> usize {
        let mut count = 0;
        for slot in self.slots.drain(..) {
            if let TurnSlot::Live { tx, .. } = slot {
                let _ = tx.send(Err(reason()));
                count += 1;
            }
        }
        self.buffer.clear();
        count
    }

    /// Turns still waiting for a result (tombstones excluded).
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, TurnSlot::Live { .. }))
            .count()
    }
}

fn live_timeout(slot: &TurnSlot) -> Duration {
    match slot {
        TurnSlot::Live { timeout, .. } => *timeout,
        TurnSlot::Expired { .. } => Duration::ZERO,
    }
}

impl Drop for TurnQueue {
    fn drop(&mut self) {
        self.cancel_all(|| Error::ConnectionLost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::oneshot::error::TryRecvError;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_register_and_resolve() {
        let mut tracker = CallTracker::<u32>::new();
        let (id, rx) = tracker.register("ping", TIMEOUT);
        assert_eq!(tracker.pending_count(), 1);
        assert!(tracker.contains(&id));

        assert!(tracker.resolve(&id, Ok(7)));
        assert_eq!(rx.await.unwrap().unwrap(), 7);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn test_completion_pending_until_resolved() {
        let mut tracker = CallTracker::<u32>::new();
        let (id, rx) = tracker.register("ping", TIMEOUT);
        let (other, _other_rx) = tracker.register("pong", TIMEOUT);
        let mut completion = tokio_test::task::spawn(rx);

        tokio_test::assert_pending!(completion.poll());
        tracker.resolve(&other, Ok(1));
        tokio_test::assert_pending!(completion.poll());

        tracker.resolve(&id, Ok(2));
        assert!(completion.is_woken());
        let result = tokio_test::assert_ready!(completion.poll());
        assert_eq!(result.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ids_are_unique_per_instance() {
        let mut tracker = CallTracker::<()>::new();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let (id, _rx) = tracker.register("x", TIMEOUT);
            assert!(seen.insert(id));
        }
        assert!(seen.insert(tracker.next_untracked_id()));
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_is_noop() {
        let mut tracker = CallTracker::<u32>::new();
        let (id, mut rx) = tracker.register("ping", TIMEOUT);

        assert!(!tracker.resolve("999", Ok(1)));
        assert_eq!(tracker.pending_count(), 1);
        assert!(tracker.contains(&id));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_resolve_twice_delivers_once() {
        let mut tracker = CallTracker::<u32>::new();
        let (id, rx) = tracker.register("ping", TIMEOUT);
        assert!(tracker.resolve(&id, Ok(1)));
        assert!(!tracker.resolve(&id, Ok(2)));
        assert_eq!(rx.await.unwrap().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_fails_with_call_timeout() {
        let mut tracker = CallTracker::<u32>::new();
        let (short_id, short_rx) = tracker.register("short", Duration::from_secs(1));
        let (long_id, mut long_rx) = tracker.register("long", Duration::from_secs(5));

        assert_eq!(
            tracker.next_deadline(),
            Some(Instant::now() + Duration::from_secs(1))
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        let expired = tracker.expire(Instant::now());
        assert_eq!(expired, vec![short_id.clone()]);

        let err = short_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::CallTimeout { ref label, .. } if label == "short"));
        assert!(matches!(long_rx.try_recv(), Err(TryRecvError::Empty)));

        // A late response for the expired call is discarded
        assert!(!tracker.resolve(&short_id, Ok(1)));
        assert!(tracker.contains(&long_id));
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_every_call_once() {
        let mut tracker = CallTracker::<u32>::new();
        let receivers: Vec<_> = (0..5).map(|_| tracker.register("x", TIMEOUT).1).collect();

        assert_eq!(tracker.cancel_all(|| Error::ConnectionLost), 5);
        assert_eq!(tracker.cancel_all(|| Error::ConnectionLost), 0);

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionLost)));
        }
    }

    #[tokio::test]
    async fn test_drop_cancels_pending() {
        let mut tracker = CallTracker::<u32>::new();
        let (_, rx) = tracker.register("x", TIMEOUT);
        drop(tracker);
        assert!(matches!(rx.await.unwrap(), Err(Error::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_turns_resolve_in_order_with_accumulated_text() {
        let mut turns = TurnQueue::new();
        let first = turns.push(TIMEOUT);
        let second = turns.push(TIMEOUT);

        turns.append_text("Hel");
        turns.append_text("lo");
        assert!(turns.complete(false));
        turns.append_text("bye");
        assert!(turns.complete(true));

        assert_eq!(
            first.await.unwrap().unwrap(),
            TurnOutput {
                text: "Hello".into(),
                interrupted: false
            }
        );
        assert_eq!(
            second.await.unwrap().unwrap(),
            TurnOutput {
                text: "bye".into(),
                interrupted: true
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_turn_swallows_its_late_completion() {
        let mut turns = TurnQueue::new();
        let first = turns.push(Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(500)).await;
        let mut second = turns.push(Duration::from_secs(5));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(turns.expire(Instant::now()), 1);
        assert!(matches!(
            first.await.unwrap(),
            Err(Error::CallTimeout { .. })
        ));
        assert_eq!(turns.pending_count(), 1);

        // Late answer to the first turn
        turns.append_text("stale");
        assert!(!turns.complete(false));
        assert!(matches!(second.try_recv(), Err(TryRecvError::Empty)));

        turns.append_text("fresh");
        assert!(turns.complete(false));
        assert_eq!(second.await.unwrap().unwrap().text, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncompleted_tombstone_lapses() {
        let mut turns = TurnQueue::new();
        let first = turns.push(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(turns.expire(Instant::now()), 1);
        assert!(first.await.unwrap().is_err());

        // The server never completes the first turn
        let second = turns.push(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(1)).await;

        turns.append_text("fresh");
        assert!(turns.complete(false));
        assert_eq!(second.await.unwrap().unwrap().text, "fresh");
        assert_eq!(turns.next_deadline(), None);
    }

    #[tokio::test]
    async fn test_completion_without_turn_is_ignored() {
        let mut turns = TurnQueue::new();
        turns.append_text("unsolicited");
        assert!(!turns.complete(false));
        let rx = turns.push(TIMEOUT);
        turns.append_text("answer");
        turns.complete(false);
        assert_eq!(rx.await.unwrap().unwrap().text, "answer");
    }

    #[tokio::test]
    async fn test_turn_cancel_all() {
        let mut turns = TurnQueue::new();
        let a = turns.push(TIMEOUT);
        let b = turns.push(TIMEOUT);
        assert_eq!(turns.cancel_all(|| Error::ConnectionLost), 2);
        assert_eq!(turns.pending_count(), 0);
        assert!(matches!(a.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(b.await.unwrap(), Err(Error::ConnectionLost)));
    }
}
