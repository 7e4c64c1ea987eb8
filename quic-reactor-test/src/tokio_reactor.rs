//! Host loop on a tokio current-thread runtime.
//!
//! Timers are `spawn_local` tasks sleeping on tokio time. Socket readiness
//! comes from an edge-triggered [`AsyncFd`]. Must run inside a
//! [`tokio::task::LocalSet`].

use quic_reactor::{Dispatcher, QuicServer, Reactor, TimerCallback, TimerToken};

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

struct TimerEntry {
    callback: Rc<RefCell<TimerCallback>>,
    task: Option<JoinHandle<()>>,
}

type TimerTable = RefCell<HashMap<TimerToken, TimerEntry>>;

/// [`Reactor`] backed by tokio timers.
pub struct TokioReactor {
    timers: Rc<TimerTable>,
    next_token: Cell<u64>,
    write_interest: Cell<bool>,
    write_interest_changed: Notify,
}

impl TokioReactor {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            timers: Rc::new(RefCell::new(HashMap::new())),
            next_token: Cell::new(0),
            write_interest: Cell::new(false),
            write_interest_changed: Notify::new(),
        })
    }

    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn wants_writable(&self) -> bool {
        self.write_interest.get()
    }

    fn abort(entry: &mut TimerEntry) {
        if let Some(task) = entry.task.take() {
            task.abort();
        }
    }
}

fn fire(timers: &Weak<TimerTable>, token: TimerToken) {
    let Some(timers) = timers.upgrade() else {
        return;
    };
    let callback = {
        let mut table = timers.borrow_mut();
        let Some(entry) = table.get_mut(&token) else {
            return;
        };
        entry.task = None;
        entry.callback.clone()
    };
    trace!(%token, "timer fired");
    (*callback.borrow_mut())();
}

impl Reactor for TokioReactor {
    fn create_timer(&self, callback: TimerCallback) -> TimerToken {
        let token = TimerToken::new(self.next_token.get());
        self.next_token.set(token.raw() + 1);
        self.timers.borrow_mut().insert(
            token,
            TimerEntry {
                callback: Rc::new(RefCell::new(callback)),
                task: None,
            },
        );
        token
    }

    fn arm_timer(&self, token: TimerToken, delay: Duration) {
        let mut table = self.timers.borrow_mut();
        let Some(entry) = table.get_mut(&token) else {
            return;
        };
        Self::abort(entry);
        let timers = Rc::downgrade(&self.timers);
        entry.task = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            fire(&timers, token);
        }));
    }

    fn disarm_timer(&self, token: TimerToken) {
        if let Some(entry) = self.timers.borrow_mut().get_mut(&token) {
            Self::abort(entry);
        }
    }

    fn destroy_timer(&self, token: TimerToken) {
        let entry = self.timers.borrow_mut().remove(&token);
        if let Some(mut entry) = entry {
            Self::abort(&mut entry);
        }
    }

    fn watch_writable(&self) {
        if !self.write_interest.replace(true) {
            self.write_interest_changed.notify_one();
        }
    }
}

/// Feed readiness of `fd` into `server` until `until` completes.
///
/// Readable and writable edges are delivered as `on_readable` and
/// `on_writable`. Writability is only watched after the writer asked for it
/// and until `on_writable` returns `false`.
pub async fn run_server<D, F>(
    server: &RefCell<QuicServer<D>>,
    fd: RawFd,
    reactor: &TokioReactor,
    until: F,
) -> std::io::Result<F::Output>
where
    D: Dispatcher,
    F: Future,
{
    let afd = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?;
    tokio::pin!(until);

    loop {
        let want_write = reactor.write_interest.get();
        tokio::select! {
            out = &mut until => return Ok(out),
            guard = afd.readable() => {
                let mut guard = guard?;
                server.borrow_mut().on_readable();
                guard.clear_ready();
            }
            guard = afd.writable(), if want_write => {
                let mut guard = guard?;
                if server.borrow_mut().on_writable() {
                    guard.clear_ready();
                } else {
                    reactor.write_interest.set(false);
                }
            }
            _ = reactor.write_interest_changed.notified() => {}
        }
    }
}
