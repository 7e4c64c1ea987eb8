//! Timer bridge between engine alarms and reactor timers.
//!
//! The engine asks for "call me back at deadline T" through [`Alarm`]s made by
//! an [`AlarmFactory`]. Each alarm owns exactly one reactor timer for its whole
//! life: the timer is created with the alarm, armed and disarmed as the
//! deadline changes, and destroyed when the alarm is dropped.
//!
//! # Late fires
//!
//! The reactor callback only holds a [`Weak`] link back to the alarm. A fire
//! that races a cancellation, or arrives after the owning alarm was dropped,
//! finds either no deadline or no alarm and does nothing.

use crate::clock::Clock;
use crate::reactor::{Reactor, TimerToken};

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

/// Engine-side callback run when an alarm's deadline passes.
pub trait AlarmDelegate {
    fn on_alarm(&mut self);
}

impl<F: FnMut()> AlarmDelegate for F {
    fn on_alarm(&mut self) {
        self()
    }
}

/// Creates [`Alarm`]s backed by the host reactor's timers.
#[derive(Clone)]
pub struct AlarmFactory {
    reactor: Rc<dyn Reactor>,
    clock: Rc<dyn Clock>,
}

impl AlarmFactory {
    pub fn new(reactor: Rc<dyn Reactor>, clock: Rc<dyn Clock>) -> Self {
        Self { reactor, clock }
    }

    /// The clock deadlines are measured against.
    pub fn clock(&self) -> &Rc<dyn Clock> {
        &self.clock
    }

    /// Create an unarmed alarm that runs `delegate` when it fires.
    pub fn create_alarm(&self, delegate: impl AlarmDelegate + 'static) -> Alarm {
        let inner = Rc::new_cyclic(|weak: &Weak<AlarmInner>| {
            let weak = weak.clone();
            let token = self.reactor.create_timer(Box::new(move || match weak.upgrade() {
                Some(alarm) => alarm.fire(),
                None => trace!("timer fired for a released alarm"),
            }));
            AlarmInner {
                token,
                deadline: Cell::new(None),
                armed: Cell::new(false),
                delegate: RefCell::new(Box::new(delegate)),
                reactor: self.reactor.clone(),
                clock: self.clock.clone(),
            }
        });
        trace!(token = %inner.token, "alarm created");
        Alarm { inner }
    }
}

struct AlarmInner {
    token: TimerToken,
    deadline: Cell<Option<Instant>>,
    /// Whether the reactor timer is currently armed.
    armed: Cell<bool>,
    delegate: RefCell<Box<dyn AlarmDelegate>>,
    reactor: Rc<dyn Reactor>,
    clock: Rc<dyn Clock>,
}

impl AlarmInner {
    fn arm(&self, deadline: Instant) {
        self.disarm();
        let delay = delay_until(self.clock.now(), deadline);
        self.reactor.arm_timer(self.token, delay);
        self.armed.set(true);
    }

    fn disarm(&self) {
        if self.armed.replace(false) {
            self.reactor.disarm_timer(self.token);
        }
    }

    /// Timer expiry. It may be stale when the alarm was cancelled or set
    /// again after the reactor dequeued it; `armed` then describes the newer
    /// arming.
    fn fire(&self) {
        let Some(deadline) = self.deadline.get() else {
            trace!(token = %self.token, "timer fired after cancel");
            return;
        };

        let now = self.clock.now();
        if now < deadline {
            self.arm(deadline);
            return;
        }

        self.deadline.set(None);
        self.disarm();
        match self.delegate.try_borrow_mut() {
            Ok(mut delegate) => delegate.on_alarm(),
            Err(_) => warn!(token = %self.token, "alarm fired while its delegate is running"),
        }
    }
}

/// An engine alarm backed by a single reactor timer.
///
/// Dropping the alarm destroys the reactor timer.
pub struct Alarm {
    inner: Rc<AlarmInner>,
}

impl Alarm {
    /// Arm the alarm for `deadline`, replacing any earlier deadline.
    pub fn set(&self, deadline: Instant) {
        self.inner.deadline.set(Some(deadline));
        self.inner.arm(deadline);
    }

    /// Cancel the alarm. Cancelling an idle alarm is a no-op.
    pub fn cancel(&self) {
        self.inner.deadline.set(None);
        self.inner.disarm();
    }

    /// Move the deadline, unless it is already within `granularity` of it.
    pub fn update(&self, deadline: Instant, granularity: Duration) {
        if let Some(current) = self.inner.deadline.get() {
            let diff = if current > deadline {
                current - deadline
            } else {
                deadline - current
            };
            if diff < granularity {
                return;
            }
        }
        self.set(deadline);
    }

    pub fn is_set(&self) -> bool {
        self.inner.deadline.get().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline.get()
    }

    /// The reactor timer backing this alarm.
    pub fn token(&self) -> TimerToken {
        self.inner.token
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
        self.inner.reactor.destroy_timer(self.inner.token);
    }
}

/// Delay from `now` to `deadline`, rounded up to whole milliseconds.
fn delay_until(now: Instant, deadline: Instant) -> Duration {
    let nanos = deadline.saturating_duration_since(now).as_nanos();
    let millis = nanos.div_ceil(1_000_000);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::TimerCallback;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Slot {
        callback: Option<TimerCallback>,
        delay: Option<Duration>,
    }

    #[derive(Default)]
    struct TestReactor {
        next: Cell<u64>,
        slots: RefCell<HashMap<TimerToken, Slot>>,
    }

    impl TestReactor {
        fn delay(&self, token: TimerToken) -> Option<Duration> {
            self.slots.borrow().get(&token).and_then(|s| s.delay)
        }

        fn exists(&self, token: TimerToken) -> bool {
            self.slots.borrow().contains_key(&token)
        }

        /// Run a timer callback regardless of its armed state.
        fn fire(&self, token: TimerToken) {
            let callback = self.slots.borrow_mut().get_mut(&token).and_then(|s| {
                s.delay = None;
                s.callback.take()
            });
            if let Some(mut callback) = callback {
                callback();
                if let Some(slot) = self.slots.borrow_mut().get_mut(&token) {
                    slot.callback = Some(callback);
                }
            }
        }
    }

    impl Reactor for TestReactor {
        fn create_timer(&self, callback: TimerCallback) -> TimerToken {
            let token = TimerToken::new(self.next.get());
            self.next.set(self.next.get() + 1);
            self.slots.borrow_mut().insert(
                token,
                Slot {
                    callback: Some(callback),
                    delay: None,
                },
            );
            token
        }

        fn arm_timer(&self, token: TimerToken, delay: Duration) {
            let mut slots = self.slots.borrow_mut();
            let slot = slots.get_mut(&token).expect("arm of unknown timer");
            assert!(slot.delay.is_none(), "timer armed twice");
            slot.delay = Some(delay);
        }

        fn disarm_timer(&self, token: TimerToken) {
            if let Some(slot) = self.slots.borrow_mut().get_mut(&token) {
                slot.delay = None;
            }
        }

        fn destroy_timer(&self, token: TimerToken) {
            self.slots.borrow_mut().remove(&token);
        }

        fn watch_writable(&self) {}
    }

    struct TestClock(Cell<Instant>);

    impl TestClock {
        fn advance(&self, by: Duration) {
            self.0.set(self.0.get() + by);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    fn setup() -> (Rc<TestReactor>, Rc<TestClock>, AlarmFactory) {
        let reactor = Rc::new(TestReactor::default());
        let clock = Rc::new(TestClock(Cell::new(Instant::now())));
        let factory = AlarmFactory::new(reactor.clone(), clock.clone());
        (reactor, clock, factory)
    }

    fn counting_alarm(factory: &AlarmFactory) -> (Alarm, Rc<Cell<u32>>) {
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        let alarm = factory.create_alarm(move || counter.set(counter.get() + 1));
        (alarm, fired)
    }

    #[test]
    fn test_delay_rounds_up_to_millis() {
        let now = Instant::now();
        assert_eq!(delay_until(now, now), Duration::ZERO);
        assert_eq!(
            delay_until(now, now + Duration::from_micros(1)),
            Duration::from_millis(1)
        );
        assert_eq!(
            delay_until(now, now + Duration::from_millis(25)),
            Duration::from_millis(25)
        );
        // Deadlines in the past fire on the next reactor turn.
        assert_eq!(
            delay_until(now + Duration::from_secs(1), now),
            Duration::ZERO
        );
    }

    #[test]
    fn test_set_and_fire() {
        let (reactor, clock, factory) = setup();
        let (alarm, fired) = counting_alarm(&factory);

        alarm.set(clock.now() + Duration::from_millis(40));
        assert!(alarm.is_set());
        assert_eq!(reactor.delay(alarm.token()), Some(Duration::from_millis(40)));

        clock.advance(Duration::from_millis(40));
        reactor.fire(alarm.token());
        assert_eq!(fired.get(), 1);
        assert!(!alarm.is_set());
    }

    #[test]
    fn test_cancel_before_fire_is_noop() {
        let (reactor, clock, factory) = setup();
        let (alarm, fired) = counting_alarm(&factory);

        alarm.set(clock.now() + Duration::from_millis(10));
        alarm.cancel();
        assert_eq!(reactor.delay(alarm.token()), None);

        // The reactor had already dequeued the timer when the cancel landed.
        clock.advance(Duration::from_millis(10));
        reactor.fire(alarm.token());
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn test_fire_then_cancel_is_noop() {
        let (reactor, clock, factory) = setup();
        let (alarm, fired) = counting_alarm(&factory);

        alarm.set(clock.now());
        reactor.fire(alarm.token());
        alarm.cancel();
        alarm.cancel();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_fire_after_drop_is_noop() {
        let (reactor, clock, factory) = setup();
        let (alarm, fired) = counting_alarm(&factory);
        let token = alarm.token();

        alarm.set(clock.now());
        drop(alarm);
        assert!(!reactor.exists(token));
        reactor.fire(token);
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn test_callback_outliving_alarm_is_noop() {
        let (reactor, clock, factory) = setup();
        let (alarm, fired) = counting_alarm(&factory);
        let token = alarm.token();
        alarm.set(clock.now());

        // The reactor already took the callback off its queue for this turn.
        let mut callback = reactor
            .slots
            .borrow_mut()
            .get_mut(&token)
            .and_then(|s| s.callback.take())
            .unwrap();
        drop(alarm);
        callback();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn test_early_fire_rearms() {
        let (reactor, clock, factory) = setup();
        let (alarm, fired) = counting_alarm(&factory);

        alarm.set(clock.now() + Duration::from_millis(30));
        clock.advance(Duration::from_millis(20));
        reactor.fire(alarm.token());
        assert_eq!(fired.get(), 0);
        assert_eq!(reactor.delay(alarm.token()), Some(Duration::from_millis(10)));

        clock.advance(Duration::from_millis(10));
        reactor.fire(alarm.token());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_stale_fire_after_reset_keeps_single_arming() {
        let (reactor, clock, factory) = setup();
        let (alarm, fired) = counting_alarm(&factory);
        let token = alarm.token();
        alarm.set(clock.now() + Duration::from_millis(10));

        // The reactor dequeues the expiry, then the alarm is reset before
        // the callback runs.
        let mut callback = reactor
            .slots
            .borrow_mut()
            .get_mut(&token)
            .and_then(|s| {
                s.delay = None;
                s.callback.take()
            })
            .unwrap();
        alarm.cancel();
        alarm.set(clock.now() + Duration::from_millis(50));
        callback();
        reactor.slots.borrow_mut().get_mut(&token).unwrap().callback = Some(callback);

        assert_eq!(fired.get(), 0);
        assert_eq!(reactor.delay(token), Some(Duration::from_millis(50)));
        alarm.cancel();
        assert_eq!(reactor.delay(token), None);
    }

    #[test]
    fn test_set_replaces_deadline() {
        let (reactor, clock, factory) = setup();
        let (alarm, _fired) = counting_alarm(&factory);

        alarm.set(clock.now() + Duration::from_millis(50));
        alarm.set(clock.now() + Duration::from_millis(5));
        assert_eq!(reactor.delay(alarm.token()), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_update_within_granularity() {
        let (reactor, clock, factory) = setup();
        let (alarm, _fired) = counting_alarm(&factory);
        let start = clock.now();

        alarm.update(start + Duration::from_millis(100), Duration::from_millis(1));
        assert_eq!(alarm.deadline(), Some(start + Duration::from_millis(100)));

        alarm.update(start + Duration::from_millis(102), Duration::from_millis(5));
        assert_eq!(alarm.deadline(), Some(start + Duration::from_millis(100)));

        alarm.update(start + Duration::from_millis(200), Duration::from_millis(5));
        assert_eq!(alarm.deadline(), Some(start + Duration::from_millis(200)));
        assert_eq!(reactor.delay(alarm.token()), Some(Duration::from_millis(200)));
    }
}
