//! Trailing-edge debouncer.
//!
//! Each push restarts the quiet window and replaces the pending value;
//! only the last value of a burst is released, once the window elapses
//! without another push. Time is passed in so the debouncer stays pure.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    window: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    pub fn push(&mut self, value: T, now: Instant) {
        self.pending = Some((value, now + self.window));
    }

    /// When the pending value becomes due, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, at)| *at)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Release the pending value if its window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match self.pending.as_ref() {
            Some((_, at)) if *at <= now => self.pending.take().map(|(v, _)| v),
            _ => None,
        }
    }

    /// Release the pending value regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|(v, _)| v)
    }
}
