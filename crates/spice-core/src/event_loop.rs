//! Cooperative single-threaded scheduling primitives for the server thread.
//!
//! The original leaves the event-loop backend itself out of scope and only
//! specifies the Timer/Watch contract; this backend is `mio::Poll` plus a
//! small deadline heap for millisecond timers, since `mio` has no native
//! timer source.

use std::{
    collections::BinaryHeap,
    cmp::{Ordering, Reverse},
    time::{Duration, Instant},
};

use mio::{Events, Interest, Registry, Token};
use spice_utils::safe_assert;

pub type TimerCallback = Box<dyn FnMut(&mut EventLoop)>;
pub type WatchCallback = Box<dyn FnMut(&mut EventLoop, Interest)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub Token);

struct TimerSlot {
    callback: TimerCallback,
    /// `None` means cancelled/never armed.
    deadline: Option<Instant>,
    /// Set while the callback is mid-invocation and it asked to be removed;
    /// the outer loop performs the actual removal once the callback returns.
    remove_pending: bool,
}

struct WatchSlot {
    callback: WatchCallback,
    mask: Option<Interest>,
}

#[derive(Eq, PartialEq)]
struct HeapEntry(Reverse<Instant>, u64);

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0).then_with(|| self.1.cmp(&other.1))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Drives timers and fd watches cooperatively on one thread.
pub struct EventLoop {
    poll: mio::Poll,
    events: Events,
    timers: std::collections::HashMap<u64, TimerSlot>,
    timer_heap: BinaryHeap<HeapEntry>,
    next_timer_id: u64,
    watches: std::collections::HashMap<Token, WatchSlot>,
    next_token: usize,
    in_dispatch: u32,
    dispatching_watch: Option<Token>,
    watch_removed_mid_dispatch: bool,
}

impl EventLoop {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: mio::Poll::new()?,
            events: Events::with_capacity(256),
            timers: Default::default(),
            timer_heap: BinaryHeap::new(),
            next_timer_id: 0,
            watches: Default::default(),
            next_token: 0,
            in_dispatch: 0,
            dispatching_watch: None,
            watch_removed_mid_dispatch: false,
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Registers a timer in the disarmed state. Call [`start_timer`] to arm it.
    pub fn add_timer(&mut self, callback: TimerCallback) -> TimerHandle {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.insert(id, TimerSlot { callback, deadline: None, remove_pending: false });
        TimerHandle(id)
    }

    /// Arms (or re-arms) a timer to fire `ms` milliseconds from now.
    pub fn start_timer(&mut self, handle: TimerHandle, ms: u64) {
        if let Some(slot) = self.timers.get_mut(&handle.0) {
            let deadline = Instant::now() + Duration::from_millis(ms);
            slot.deadline = Some(deadline);
            self.timer_heap.push(HeapEntry(Reverse(deadline), handle.0));
        }
    }

    /// Disarms a timer. Idempotent — cancelling an already-cancelled or
    /// already-fired timer is a no-op.
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.timers.get_mut(&handle.0) {
            slot.deadline = None;
        }
    }

    /// Removes a timer entirely. Idempotent. Safe to call from within the
    /// timer's own callback — actual removal is deferred until the
    /// dispatch loop returns control.
    pub fn remove_timer(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.timers.get_mut(&handle.0) {
            if self.in_dispatch > 0 {
                slot.remove_pending = true;
            } else {
                self.timers.remove(&handle.0);
            }
        }
    }

    /// Registers a fd/socket watch with `mask` and returns its handle.
    /// `source` must already be registered with [`registry`] using `token`.
    pub fn add_watch(&mut self, token: Token, mask: Interest, callback: WatchCallback) -> WatchHandle {
        self.watches.insert(token, WatchSlot { callback, mask: Some(mask) });
        WatchHandle(token)
    }

    /// Updates the interest mask. `None` disarms the watch (caller is
    /// expected to have deregistered/reregistered the underlying source to
    /// match, since `mio` tracks interest on the source itself).
    pub fn update_watch_mask(&mut self, handle: WatchHandle, mask: Option<Interest>) {
        if let Some(slot) = self.watches.get_mut(&handle.0) {
            slot.mask = mask;
        }
    }

    pub fn remove_watch(&mut self, handle: WatchHandle) {
        if self.dispatching_watch == Some(handle.0) {
            self.watch_removed_mid_dispatch = true;
        } else {
            self.watches.remove(&handle.0);
        }
    }

    /// Runs one iteration: computes a poll timeout bounded by the soonest
    /// timer deadline, polls for readiness, dispatches watch callbacks, then
    /// fires any timers whose deadline has passed.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        let timeout = self.next_timer_timeout();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let ready: Vec<(Token, Interest)> = self
            .events
            .iter()
            .filter_map(|ev| {
                let interest = event_to_interest(ev)?;
                Some((ev.token(), interest))
            })
            .collect();

        for (token, interest) in ready {
            self.dispatch_watch(token, interest);
        }

        self.fire_expired_timers();
        Ok(())
    }

    fn dispatch_watch(&mut self, token: Token, interest: Interest) {
        let Some(mut slot) = self.watches.remove(&token) else { return };
        if slot.mask.is_some() {
            self.in_dispatch += 1;
            self.dispatching_watch = Some(token);
            self.watch_removed_mid_dispatch = false;
            (slot.callback)(self, interest);
            let removed = self.watch_removed_mid_dispatch;
            self.dispatching_watch = None;
            self.in_dispatch -= 1;
            if removed {
                return;
            }
        }
        self.watches.entry(token).or_insert(slot);
    }

    fn fire_expired_timers(&mut self) {
        let now = Instant::now();
        safe_assert!(self.in_dispatch == 0, "timer fire should happen outside nested dispatch");
        while let Some(top) = self.timer_heap.peek() {
            if top.0.0 > now {
                break;
            }
            let HeapEntry(_, id) = self.timer_heap.pop().unwrap();
            let Some(mut slot) = self.timers.remove(&id) else { continue };

            // Stale heap entry: timer was cancelled/restarted since this push.
            let still_due = slot.deadline.is_some_and(|d| d <= now);
            if !still_due {
                self.timers.insert(id, slot);
                continue;
            }
            slot.deadline = None;

            self.in_dispatch += 1;
            (slot.callback)(self);
            self.in_dispatch -= 1;

            if !slot.remove_pending {
                self.timers.insert(id, slot);
            }
        }
    }

    fn next_timer_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timer_heap.peek().map(|HeapEntry(Reverse(deadline), _)| {
            deadline.saturating_duration_since(now)
        })
    }
}

fn event_to_interest(ev: &mio::event::Event) -> Option<Interest> {
    match (ev.is_readable(), ev.is_writable()) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}
