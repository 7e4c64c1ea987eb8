//! Bounded admission of buffered handshake attempts.

use crate::dispatcher::Dispatcher;

use tracing::trace;

/// Caps how many new connections one readiness event may create.
///
/// A flood of handshake attempts otherwise turns a single reactor turn into
/// unbounded work and starves every other socket served by the same thread.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeBatcher {
    max_per_event: usize,
}

impl HandshakeBatcher {
    pub fn new(max_per_event: usize) -> Self {
        Self { max_per_event }
    }

    pub fn max_per_event(&self) -> usize {
        self.max_per_event
    }

    /// Ask the dispatcher to admit up to `max_per_event` attempts.
    pub fn process_batch<D: Dispatcher>(&self, dispatcher: &mut D) {
        trace!(max = self.max_per_event, "processing buffered handshakes");
        dispatcher.process_buffered_handshakes(self.max_per_event);
    }

    pub fn has_backlog<D: Dispatcher>(&self, dispatcher: &D) -> bool {
        dispatcher.has_buffered_handshakes()
    }
}
