//! Host reactor boundary.
//!
//! The host event loop owns readiness notification and timers. It is injected
//! once at initialization as an `Rc<dyn Reactor>` and shared by the timer
//! bridge and the packet writer.
//!
//! All methods take `&self`: a timer callback runs inside the reactor's turn
//! and may call straight back into `arm_timer`/`disarm_timer`, so
//! implementations must not hold a borrow of their own state while invoking
//! a callback.

use std::fmt;
use std::time::Duration;

/// Callback invoked by the reactor when an armed timer expires.
pub type TimerCallback = Box<dyn FnMut()>;

/// Opaque reactor-side timer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl TimerToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Services the host event loop provides to the server.
pub trait Reactor {
    /// Register a timer and its callback. The timer starts disarmed.
    fn create_timer(&self, callback: TimerCallback) -> TimerToken;

    /// Arm a timer to fire once after `delay`.
    ///
    /// The bridge always disarms before re-arming, so implementations may
    /// assume the timer is not already armed.
    fn arm_timer(&self, token: TimerToken, delay: Duration);

    /// Disarm a timer. Disarming an idle timer has no effect.
    fn disarm_timer(&self, token: TimerToken);

    /// Release a timer. The callback must never run afterwards.
    fn destroy_timer(&self, token: TimerToken);

    /// Start watching the socket for writability.
    ///
    /// Writability is not observed by default; the writer asks for it when a
    /// send would block.
    fn watch_writable(&self);
}
