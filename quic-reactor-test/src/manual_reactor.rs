//! Deterministic reactor driven by a virtual clock.
//!
//! Timers fire only when the test calls [`ManualReactor::advance`] or fires
//! one explicitly, so races between engine code and timer expiry can be laid
//! out step by step.

use quic_reactor::{Clock, Reactor, TimerCallback, TimerToken};

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

/// Clock that only moves when told to. Its wall-clock reading moves with it.
#[derive(Debug)]
pub struct VirtualClock {
    now: Cell<Instant>,
    wall: Cell<SystemTime>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
            wall: Cell::new(SystemTime::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
        self.wall.set(self.wall.get() + by);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn wall_now(&self) -> SystemTime {
        self.wall.get()
    }
}

#[derive(Default)]
struct TimerSlot {
    /// Taken out while the callback runs.
    callback: Option<TimerCallback>,
    deadline: Option<Instant>,
    last_delay: Option<Duration>,
    arm_count: u32,
}

/// [`Reactor`] with virtual time and inspectable timers.
#[derive(Default)]
pub struct ManualReactor {
    clock: Rc<VirtualClock>,
    next_token: Cell<u64>,
    timers: RefCell<BTreeMap<TimerToken, TimerSlot>>,
    in_flight: RefCell<BTreeMap<TimerToken, TimerCallback>>,
    writable_watches: Cell<u32>,
}

impl ManualReactor {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn clock(&self) -> Rc<VirtualClock> {
        self.clock.clone()
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Move virtual time forward and fire every timer that comes due, in
    /// deadline order. Timers armed by a callback fire too if they fall
    /// within the window.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        while let Some(token) = self.next_due() {
            self.fire(token);
        }
    }

    /// Run a timer's callback now, as a reactor that fires early or late
    /// would. The timer is disarmed first. Returns whether a callback ran.
    pub fn fire(&self, token: TimerToken) -> bool {
        self.dequeue(token) && self.deliver(token)
    }

    /// Take an expiry off the queue without running it yet: the timer is
    /// disarmed and its callback held until [`deliver`](Self::deliver).
    /// Returns whether there was a callback to hold.
    pub fn dequeue(&self, token: TimerToken) -> bool {
        let callback = {
            let mut timers = self.timers.borrow_mut();
            let Some(slot) = timers.get_mut(&token) else {
                return false;
            };
            slot.deadline = None;
            slot.callback.take()
        };
        match callback {
            Some(callback) => {
                self.in_flight.borrow_mut().insert(token, callback);
                true
            }
            None => false,
        }
    }

    /// Run a callback held by [`dequeue`](Self::dequeue).
    pub fn deliver(&self, token: TimerToken) -> bool {
        let Some(mut callback) = self.in_flight.borrow_mut().remove(&token) else {
            return false;
        };

        callback();

        if let Some(slot) = self.timers.borrow_mut().get_mut(&token) {
            slot.callback = Some(callback);
        }
        true
    }

    /// Whether the timer exists and is armed.
    pub fn is_armed(&self, token: TimerToken) -> bool {
        self.timers
            .borrow()
            .get(&token)
            .is_some_and(|slot| slot.deadline.is_some())
    }

    /// Whether the timer has not been destroyed.
    pub fn exists(&self, token: TimerToken) -> bool {
        self.timers.borrow().contains_key(&token)
    }

    /// Delay passed to the most recent `arm_timer` for this timer.
    pub fn last_delay(&self, token: TimerToken) -> Option<Duration> {
        self.timers.borrow().get(&token).and_then(|s| s.last_delay)
    }

    /// How often the timer has been armed.
    pub fn arm_count(&self, token: TimerToken) -> u32 {
        self.timers.borrow().get(&token).map_or(0, |s| s.arm_count)
    }

    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn armed_count(&self) -> usize {
        self.timers
            .borrow()
            .values()
            .filter(|s| s.deadline.is_some())
            .count()
    }

    /// Number of `watch_writable` requests seen.
    pub fn writable_watches(&self) -> u32 {
        self.writable_watches.get()
    }

    fn next_due(&self) -> Option<TimerToken> {
        let now = self.clock.now();
        self.timers
            .borrow()
            .iter()
            .filter_map(|(token, slot)| slot.deadline.map(|d| (d, *token)))
            .filter(|(deadline, _)| *deadline <= now)
            .min()
            .map(|(_, token)| token)
    }
}

impl Reactor for ManualReactor {
    fn create_timer(&self, callback: TimerCallback) -> TimerToken {
        let token = TimerToken::new(self.next_token.get());
        self.next_token.set(token.raw() + 1);
        self.timers.borrow_mut().insert(
            token,
            TimerSlot {
                callback: Some(callback),
                ..Default::default()
            },
        );
        token
    }

    fn arm_timer(&self, token: TimerToken, delay: Duration) {
        let now = self.clock.now();
        if let Some(slot) = self.timers.borrow_mut().get_mut(&token) {
            assert!(slot.deadline.is_none(), "timer {token} armed twice");
            slot.deadline = Some(now + delay);
            slot.last_delay = Some(delay);
            slot.arm_count += 1;
        }
    }

    fn disarm_timer(&self, token: TimerToken) {
        if let Some(slot) = self.timers.borrow_mut().get_mut(&token) {
            slot.deadline = None;
        }
    }

    fn destroy_timer(&self, token: TimerToken) {
        self.timers.borrow_mut().remove(&token);
    }

    fn watch_writable(&self) {
        self.writable_watches.set(self.writable_watches.get() + 1);
    }
}
