//! Deadline timers for decorated connections.

use std::future::Future;
use std::pin::Pin;
use std::task::Context;

use tokio::time::{sleep_until, Instant, Sleep};

/// An optional point in time after which an operation fails.
///
/// The timer is allocated on first use and reset in place afterwards.
#[derive(Debug, Default)]
pub(crate) struct Deadline {
    at: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    pub(crate) fn set(&mut self, at: Option<Instant>) {
        self.at = at;
        if let Some(at) = at {
            match self.sleep.as_mut() {
                Some(sleep) => sleep.as_mut().reset(at),
                None => self.sleep = Some(Box::pin(sleep_until(at))),
            }
        }
    }

    pub(crate) fn get(&self) -> Option<Instant> {
        self.at
    }

    /// True once the deadline has passed. Registers the waker otherwise.
    pub(crate) fn poll_elapsed(&mut self, cx: &mut Context<'_>) -> bool {
        if self.at.is_none() {
            return false;
        }
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}
