//! Per-player input buffers that pair same-tick inputs from both players.
//!
//! Each player has a bounded FIFO. Adding an input blocks while that player's
//! buffer is full; whenever both sides have inputs available the oldest ones are
//! popped together as an [`InputPair`] and parked until the tick driver consumes
//! them.
//!
//! The local player's newest `local_delay` inputs are held back from pairing. That
//! gives the remote peer `local_delay` ticks of slack before a stall becomes visible.

mod prediction;

pub use prediction::{BlankPrediction, HoldButtons, PredictionStrategy, RepeatLastConfirmed};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;
use web_time::{Duration, Instant};

use crate::error::{CancelReason, LinkError};
use crate::input::{Input, InputPair};
use crate::PlayerIndex;

/// Default per-player buffer capacity (one second at 60 ticks per second).
pub const DEFAULT_QUEUE_CAPACITY: usize = 60;

/// Something blocked on a condition variable that a cancellation must wake.
///
/// `wake` must take the same lock the waiter holds while it checks its token,
/// then notify; a waiter between its check and its wait then cannot miss it.
pub(crate) trait Wake: Send + Sync {
    fn wake(&self);
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<dyn Wake>>>,
}

impl std::fmt::Debug for TokenInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenInner")
            .field("cancelled", &self.cancelled.load(Ordering::Acquire))
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}

/// A cancellation signal for blocking waits: an explicit abort flag plus an optional deadline.
///
/// Clones share the same flag, so any clone can abort every wait using the token.
/// Aborting wakes every wait registered on the token at once.
///
/// # Examples
///
/// ```
/// use rollback_link::{CancellationToken, LinkError};
///
/// let token = CancellationToken::new();
/// assert!(token.check().is_ok());
/// token.clone().cancel();
/// assert!(matches!(token.check(), Err(LinkError::Cancelled { .. })));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// Creates a token with no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that expires `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::default(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Returns a token sharing this one's abort flag that additionally expires after
    /// `timeout` (or at this token's deadline, whichever is first).
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            inner: Arc::clone(&self.inner),
            deadline: Some(self.deadline.map_or(deadline, |own| own.min(deadline))),
        }
    }

    /// Aborts every wait using this token or any of its clones.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let waiters: Vec<Arc<dyn Wake>> = self
            .inner
            .waiters
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for waiter in waiters {
            waiter.wake();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The instant this token expires, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `Err(Cancelled)` if the token was aborted or its deadline has passed.
    pub fn check(&self) -> Result<(), LinkError> {
        if self.is_cancelled() {
            return Err(LinkError::Cancelled {
                reason: CancelReason::Aborted,
            });
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(LinkError::Cancelled {
                reason: CancelReason::TimedOut,
            });
        }
        Ok(())
    }

    /// Registers `waiter` to be woken by [`cancel`](Self::cancel). Registering the
    /// same waiter twice is a no-op; dropped waiters are pruned.
    ///
    /// Register before checking the token, so a concurrent cancel either sees
    /// the registration or is seen by the check.
    pub(crate) fn register<W: Wake + 'static>(&self, waiter: &Arc<W>) {
        let address = Arc::as_ptr(waiter).cast::<()>();
        let mut waiters = self.inner.waiters.lock();
        waiters.retain(|registered| registered.strong_count() > 0);
        if !waiters
            .iter()
            .any(|registered| registered.as_ptr().cast::<()>() == address)
        {
            let weak: Weak<dyn Wake> = Arc::<W>::downgrade(waiter);
            waiters.push(weak);
        }
    }

    /// Blocks on `condvar` until notified, or until the deadline if there is one.
    pub(crate) fn wait<T>(&self, condvar: &Condvar, guard: &mut MutexGuard<'_, T>) {
        match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let _ = condvar.wait_for(guard, remaining);
            },
            None => condvar.wait(guard),
        }
    }

    /// Blocks the calling thread until the token is cancelled or expires.
    pub(crate) fn park(&self) {
        let parker = Arc::new(Parker::default());
        self.register(&parker);
        let mut parked = parker.lock.lock();
        while self.check().is_ok() {
            self.wait(&parker.woken, &mut parked);
        }
    }
}

#[derive(Default)]
struct Parker {
    lock: Mutex<()>,
    woken: Condvar,
}

impl Wake for Parker {
    fn wake(&self) {
        let _held = self.lock.lock();
        self.woken.notify_all();
    }
}

#[derive(Debug)]
struct QueueState {
    buffers: [VecDeque<Input>; 2],
    consumable: Vec<InputPair>,
}

#[derive(Debug)]
struct QueueShared {
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl Wake for QueueShared {
    fn wake(&self) {
        let _held = self.state.lock();
        self.changed.notify_all();
    }
}

/// Bounded, blocking input buffers for both players of one battle.
///
/// All methods take `&self`; the queue is meant to be shared (behind an `Arc`)
/// between the tick driver and the network receive loop.
#[derive(Debug)]
pub struct InputQueue {
    shared: Arc<QueueShared>,
    capacity: usize,
    local_player: PlayerIndex,
    local_delay: usize,
}

impl InputQueue {
    /// Creates a queue holding up to `capacity` inputs per player.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidRequest`] if `capacity` is zero or
    /// `local_delay >= capacity` (the local buffer could never release an input).
    pub fn new(
        capacity: usize,
        local_player: PlayerIndex,
        local_delay: usize,
    ) -> Result<Self, LinkError> {
        if capacity == 0 {
            return Err(LinkError::invalid_request("input queue capacity must be positive"));
        }
        if local_delay >= capacity {
            return Err(LinkError::invalid_request(format!(
                "local delay {} must be less than the queue capacity {}",
                local_delay, capacity
            )));
        }
        Ok(Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    buffers: [
                        VecDeque::with_capacity(capacity),
                        VecDeque::with_capacity(capacity),
                    ],
                    consumable: Vec::new(),
                }),
                changed: Condvar::new(),
            }),
            capacity,
            local_player,
            local_delay,
        })
    }

    /// Which seat is local in this queue.
    #[must_use]
    pub const fn local_player(&self) -> PlayerIndex {
        self.local_player
    }

    /// Number of ticks local inputs are held back from pairing.
    #[must_use]
    pub const fn local_delay(&self) -> usize {
        self.local_delay
    }

    /// Per-player buffer capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Adds an input for `player`, blocking while that player's buffer is full.
    ///
    /// Any pairs the new input completes are moved to the consumable list.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Cancelled`] if `cancel` fires before space frees up.
    pub fn add_input(
        &self,
        player: PlayerIndex,
        input: Input,
        cancel: &CancellationToken,
    ) -> Result<(), LinkError> {
        let mut state = self.shared.state.lock();
        if state.buffers[player.as_usize()].len() >= self.capacity {
            cancel.register(&self.shared);
        }
        while state.buffers[player.as_usize()].len() >= self.capacity {
            cancel.check()?;
            trace!(%player, "input buffer full, waiting");
            cancel.wait(&self.shared.changed, &mut state);
        }

        state.buffers[player.as_usize()].push_back(input);
        let pairs = self.advance_locked(&mut state);
        state.consumable.extend(pairs);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Takes every pair completed so far, and peeks the local inputs that are
    /// exposed for pairing but still waiting for their remote counterpart.
    ///
    /// The peeked inputs are what the rollback engine pairs with predicted remote input.
    #[must_use]
    pub fn consume_and_peek_local(&self) -> (Vec<InputPair>, Vec<Input>) {
        let mut state = self.shared.state.lock();
        let pairs = std::mem::take(&mut state.consumable);
        let local = &state.buffers[self.local_player.as_usize()];
        let exposed = local.len().saturating_sub(self.local_delay);
        let backlog = local.iter().take(exposed).cloned().collect();
        self.shared.changed.notify_all();
        (pairs, backlog)
    }

    /// Buffered count of the other player minus buffered count of `player`.
    ///
    /// A positive lag means `player` is behind.
    #[must_use]
    pub fn lag(&self, player: PlayerIndex) -> isize {
        let state = self.shared.state.lock();
        state.buffers[player.opponent().as_usize()].len() as isize
            - state.buffers[player.as_usize()].len() as isize
    }

    /// Number of unpaired inputs buffered for `player`.
    #[must_use]
    pub fn queue_length(&self, player: PlayerIndex) -> usize {
        self.shared.state.lock().buffers[player.as_usize()].len()
    }

    fn advance_locked(&self, state: &mut QueueState) -> Vec<InputPair> {
        let local = self.local_player.as_usize();
        let remote = self.local_player.opponent().as_usize();
        let available = state.buffers[local]
            .len()
            .saturating_sub(self.local_delay)
            .min(state.buffers[remote].len());

        let mut pairs = Vec::with_capacity(available);
        for _ in 0..available {
            let (Some(local_input), Some(remote_input)) = (
                state.buffers[local].pop_front(),
                state.buffers[remote].pop_front(),
            ) else {
                break;
            };
            pairs.push(InputPair::from_local_remote(
                self.local_player,
                local_input,
                remote_input,
            ));
        }
        pairs
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::Tick;
    use proptest::prelude::*;
    use std::thread;

    fn input(tick: u32, joyflags: u16) -> Input {
        Input::new(Tick::new(tick), Tick::ZERO, joyflags, 0)
    }

    #[test]
    fn rejects_delay_not_below_capacity() {
        assert!(InputQueue::new(0, PlayerIndex::P1, 0).is_err());
        assert!(InputQueue::new(4, PlayerIndex::P1, 4).is_err());
        assert!(InputQueue::new(4, PlayerIndex::P1, 3).is_ok());
    }

    #[test]
    fn pairs_once_both_players_have_input() {
        let queue = InputQueue::new(8, PlayerIndex::P1, 0).unwrap();
        let token = CancellationToken::new();

        queue.add_input(PlayerIndex::P1, input(0, 1), &token).unwrap();
        let (pairs, backlog) = queue.consume_and_peek_local();
        assert!(pairs.is_empty());
        assert_eq!(backlog, vec![input(0, 1)]);

        queue.add_input(PlayerIndex::P2, input(0, 2), &token).unwrap();
        let (pairs, backlog) = queue.consume_and_peek_local();
        assert_eq!(pairs, vec![InputPair::new(input(0, 1), input(0, 2))]);
        assert!(backlog.is_empty());
    }

    #[test]
    fn local_delay_holds_back_newest_inputs() {
        let delay = 3;
        let queue = InputQueue::new(16, PlayerIndex::P2, delay).unwrap();
        let token = CancellationToken::new();
        for tick in 0..5 {
            queue.add_input(PlayerIndex::P1, input(tick, 0), &token).unwrap();
        }

        for tick in 0..delay as u32 {
            queue.add_input(PlayerIndex::P2, input(tick, 0), &token).unwrap();
            let (pairs, backlog) = queue.consume_and_peek_local();
            assert!(pairs.is_empty(), "tick {tick} paired too early");
            assert!(backlog.is_empty());
        }

        // The (delay + 1)-th local input releases the first one.
        queue.add_input(PlayerIndex::P2, input(3, 0), &token).unwrap();
        let (pairs, _) = queue.consume_and_peek_local();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].tick(), Tick::new(0));
        assert_eq!(pairs[0].p2().local_tick, Tick::new(0));
    }

    #[test]
    fn backlog_excludes_delayed_inputs() {
        let queue = InputQueue::new(16, PlayerIndex::P1, 2).unwrap();
        let token = CancellationToken::new();
        for tick in 0..5 {
            queue.add_input(PlayerIndex::P1, input(tick, 0), &token).unwrap();
        }
        let (_, backlog) = queue.consume_and_peek_local();
        let ticks: Vec<u32> = backlog.iter().map(|i| i.local_tick.as_u32()).collect();
        assert_eq!(ticks, vec![0, 1, 2]);
    }

    #[test]
    fn full_buffer_times_out() {
        let queue = InputQueue::new(2, PlayerIndex::P1, 0).unwrap();
        let token = CancellationToken::new();
        queue.add_input(PlayerIndex::P2, input(0, 0), &token).unwrap();
        queue.add_input(PlayerIndex::P2, input(1, 0), &token).unwrap();

        let short = CancellationToken::with_timeout(Duration::from_millis(20));
        let err = queue
            .add_input(PlayerIndex::P2, input(2, 0), &short)
            .unwrap_err();
        assert_eq!(
            err,
            LinkError::Cancelled {
                reason: CancelReason::TimedOut
            }
        );
        assert_eq!(queue.queue_length(PlayerIndex::P2), 2);
    }

    #[test]
    fn explicit_cancel_wakes_blocked_add() {
        let queue = Arc::new(InputQueue::new(1, PlayerIndex::P1, 0).unwrap());
        let token = CancellationToken::new();
        queue.add_input(PlayerIndex::P2, input(0, 0), &token).unwrap();

        let blocked = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            thread::spawn(move || queue.add_input(PlayerIndex::P2, input(1, 0), &token))
        };
        thread::sleep(std::time::Duration::from_millis(30));
        token.cancel();

        let result = blocked.join().unwrap();
        assert_eq!(
            result,
            Err(LinkError::Cancelled {
                reason: CancelReason::Aborted
            })
        );
    }

    #[test]
    fn blocked_add_resumes_when_pairs_drain() {
        let queue = Arc::new(InputQueue::new(1, PlayerIndex::P1, 0).unwrap());
        let token = CancellationToken::new();
        queue.add_input(PlayerIndex::P2, input(0, 0), &token).unwrap();

        let blocked = {
            let queue = Arc::clone(&queue);
            let token = token.clone();
            thread::spawn(move || queue.add_input(PlayerIndex::P2, input(1, 0), &token))
        };
        thread::sleep(std::time::Duration::from_millis(20));
        // Pairing frees the remote slot.
        queue.add_input(PlayerIndex::P1, input(0, 0), &token).unwrap();

        blocked.join().unwrap().unwrap();
        assert_eq!(queue.queue_length(PlayerIndex::P2), 1);
    }

    #[derive(Default)]
    struct CountingWaiter(std::sync::atomic::AtomicUsize);

    impl Wake for CountingWaiter {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_wakes_each_registered_waiter_once() {
        let token = CancellationToken::new();
        let child = token.child_with_timeout(Duration::from_secs(60));
        let waiter = Arc::new(CountingWaiter::default());
        token.register(&waiter);
        child.register(&waiter);
        {
            let dropped = Arc::new(CountingWaiter::default());
            token.register(&dropped);
        }

        child.cancel();
        assert_eq!(waiter.0.load(Ordering::SeqCst), 1);
        assert_eq!(token.inner.waiters.lock().len(), 1);
    }

    #[test]
    fn park_returns_on_cancel_and_on_deadline() {
        let token = CancellationToken::new();
        let parked = {
            let token = token.clone();
            thread::spawn(move || token.park())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        token.cancel();
        parked.join().unwrap();

        let started = Instant::now();
        CancellationToken::with_timeout(Duration::from_millis(20)).park();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn child_token_shares_abort_flag() {
        let parent = CancellationToken::new();
        let child = parent.child_with_timeout(Duration::from_secs(60));
        assert!(child.deadline().is_some());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn alternating_inputs_produce_ten_ordered_pairs() {
        let queue = InputQueue::new(DEFAULT_QUEUE_CAPACITY, PlayerIndex::P1, 0).unwrap();
        let token = CancellationToken::new();
        for tick in 0..10 {
            queue.add_input(PlayerIndex::P1, input(tick, 0xfc10), &token).unwrap();
            queue.add_input(PlayerIndex::P2, input(tick, 0xfc20), &token).unwrap();
        }
        let (pairs, backlog) = queue.consume_and_peek_local();
        assert!(backlog.is_empty());
        assert_eq!(pairs.len(), 10);
        for (tick, pair) in pairs.iter().enumerate() {
            assert_eq!(pair.check_aligned(), Ok(Tick::new(tick as u32)));
            assert_eq!(pair.p1().joyflags, 0xfc10);
            assert_eq!(pair.p2().joyflags, 0xfc20);
        }
    }

    proptest! {
        /// Lag always equals the other player's buffered count minus this player's,
        /// and pairs come out in tick order.
        #[test]
        fn lag_and_ordering_hold_for_any_interleaving(
            delay in 0usize..4,
            local_first in proptest::collection::vec(any::<bool>(), 1..60),
        ) {
            let queue = InputQueue::new(128, PlayerIndex::P1, delay).unwrap();
            let token = CancellationToken::new();
            let mut next = [0u32; 2];
            let mut last_paired: Option<Tick> = None;

            for is_local in local_first {
                let player = if is_local { PlayerIndex::P1 } else { PlayerIndex::P2 };
                let tick = next[player.as_usize()];
                next[player.as_usize()] += 1;
                queue.add_input(player, input(tick, 0), &token).unwrap();

                let p1 = queue.queue_length(PlayerIndex::P1) as isize;
                let p2 = queue.queue_length(PlayerIndex::P2) as isize;
                prop_assert_eq!(queue.lag(PlayerIndex::P1), p2 - p1);
                prop_assert_eq!(queue.lag(PlayerIndex::P2), p1 - p2);

                let (pairs, _) = queue.consume_and_peek_local();
                for pair in pairs {
                    let tick = pair.check_aligned().unwrap();
                    if let Some(prev) = last_paired {
                        prop_assert_eq!(tick, prev.next());
                    }
                    last_paired = Some(tick);
                }
            }
        }
    }
}
