//! Interaction lock controller.
//!
//! Suspends host input while an answer streams and keeps it suspended until
//! the player has seen the whole answer. One controller is shared by the
//! whole host session; at most one conversation holds it at a time.
//!
//! ```text
//! Unlocked --begin--> AwaitingStream --commit--> AwaitingAcknowledgement
//!                          |                              |
//!                        abort                  acknowledge at end of scroll
//!                          v                              v
//!                      Unlocking  -------------------> Unlocked
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::error::Error;
use crate::host::{InputLock, RenderSurface};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    AwaitingStream,
    AwaitingAcknowledgement,
    Unlocking,
}

/// Result of feeding one acknowledgement gesture to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Not waiting for an acknowledgement; the gesture had no effect.
    Ignored,
    /// The view was behind; it has been scrolled to the end.
    CaughtUp,
    /// The answer was fully visible; the host is unlocked.
    Released,
}

struct Held {
    input: Arc<dyn InputLock>,
    actor: Option<Arc<dyn InputLock>>,
}

struct Inner {
    state: LockState,
    held: Option<Held>,
}

#[derive(Clone)]
pub struct InteractionLock {
    inner: Arc<Mutex<Inner>>,
}

impl Default for InteractionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl InteractionLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: LockState::Unlocked,
                held: None,
            })),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LockState {
        self.inner().state
    }

    /// Whether the host must keep its own input handling suspended.
    /// Hosts poll this once per frame.
    pub fn is_busy(&self) -> bool {
        self.state() != LockState::Unlocked
    }

    /// Enter `AwaitingStream`, suspending `input` and the optional `actor`
    /// direction lock. Rejected with [`Error::Busy`] unless unlocked.
    pub fn begin(
        &self,
        input: Arc<dyn InputLock>,
        actor: Option<Arc<dyn InputLock>>,
    ) -> Result<StreamLease> {
        {
            let mut inner = self.inner();
            if inner.state != LockState::Unlocked {
                return Err(Error::Busy);
            }
            inner.state = LockState::AwaitingStream;
            inner.held = Some(Held {
                input: Arc::clone(&input),
                actor: actor.clone(),
            });
        }

        // Capabilities run outside the mutex so they may query the lock.
        input.lock();
        if let Some(actor) = &actor {
            actor.lock();
        }
        info!("Interaction locked");

        Ok(StreamLease {
            lock: self.clone(),
            settled: false,
        })
    }

    /// Feed one forward-acknowledgement gesture.
    ///
    /// The first gesture on a view that is not at its end only scrolls it
    /// there; a gesture on a fully scrolled view releases the lock.
    pub fn acknowledge(&self, surface: &dyn RenderSurface) -> Acknowledgement {
        if self.state() != LockState::AwaitingAcknowledgement {
            return Acknowledgement::Ignored;
        }

        if !surface.is_scrolled_to_end() {
            surface.scroll_to_end();
            debug!("Acknowledgement caught the view up");
            return Acknowledgement::CaughtUp;
        }

        self.release();
        Acknowledgement::Released
    }

    fn transition(&self, from: LockState, to: LockState) -> bool {
        let mut inner = self.inner();
        if inner.state == from {
            inner.state = to;
            true
        } else {
            false
        }
    }

    /// Restore every suspended capability exactly once and return to
    /// `Unlocked`. Safe to call from any state.
    fn release(&self) {
        let held = {
            let mut inner = self.inner();
            if inner.state == LockState::Unlocked {
                return;
            }
            inner.state = LockState::Unlocking;
            inner.held.take()
        };

        if let Some(held) = held {
            if let Some(actor) = held.actor {
                actor.unlock();
            }
            held.input.unlock();
        }

        self.inner().state = LockState::Unlocked;
        info!("Interaction unlocked");
    }
}

/// Proof that a stream currently holds the lock.
///
/// Settle it with [`commit`](Self::commit) once the answer is rendered, or
/// [`abort`](Self::abort) on failure. Dropping an unsettled lease aborts, so
/// the host is never left locked by an early return.
#[must_use = "an unsettled lease releases the lock when dropped"]
pub struct StreamLease {
    lock: InteractionLock,
    settled: bool,
}

impl StreamLease {
    /// `AwaitingStream -> AwaitingAcknowledgement`.
    pub fn commit(mut self) {
        self.settled = true;
        if self
            .lock
            .transition(LockState::AwaitingStream, LockState::AwaitingAcknowledgement)
        {
            debug!("Answer committed, awaiting acknowledgement");
        }
    }

    /// `AwaitingStream -> Unlocking -> Unlocked`, skipping acknowledgement.
    pub fn abort(mut self) {
        self.settled = true;
        self.lock.release();
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if !self.settled {
            self.lock.release();
        }
    }
}
