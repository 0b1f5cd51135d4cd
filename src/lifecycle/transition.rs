use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::Status;
use crate::error::{CacheError, Result};

/// One edge of the lifecycle state machine while it is in flight.
///
/// The thread that created the transition owns it. The owner reads an optimistic value
/// while the transition is unresolved; every other thread blocks in `get()` until the
/// owner calls `succeeded()` or `failed()`. A transition resolves exactly once.
#[derive(Debug)]
pub struct Transition {
    from: Status,
    to: Status,
    owner: ThreadId,
    done: Mutex<Option<Status>>,
    resolved: Condvar,
}

impl Transition {
    pub(crate) fn new(from: Status, to: Status) -> Transition {
        Transition {
            from,
            to,
            owner: thread::current().id(),
            done: Mutex::new(None),
            resolved: Condvar::new(),
        }
    }

    /// an already resolved transition used as the initial state of a state machine
    pub(crate) fn settled(status: Status) -> Transition {
        let transition = Transition::new(status, status);
        *transition.done.lock() = Some(status);
        transition
    }

    pub fn from(&self) -> Status {
        self.from
    }

    pub fn to(&self) -> Status {
        self.to
    }

    pub fn is_owner(&self) -> bool {
        self.owner == thread::current().id()
    }

    /// the resolved state; the owner gets the more advanced of `from`/`to` without blocking
    pub fn get(&self) -> Status {
        let mut done = self.done.lock();
        if let Some(status) = *done {
            return status;
        }

        if self.is_owner() {
            return self.from.max(self.to);
        }

        // spurious wakeups just re-check
        while done.is_none() {
            self.resolved.wait(&mut done);
        }

        done.unwrap_or(self.from)
    }

    pub fn is_done(&self) -> bool {
        self.done.lock().is_some()
    }

    pub fn succeeded(&self) -> Result<Status> {
        self.resolve(self.to)
    }

    /// resolves toward UNINITIALIZED: an advancing edge rolls back to `from`, a closing edge lands on `to`
    pub fn failed(&self) -> Result<Status> {
        let rollback = if self.to > self.from {
            self.from
        } else {
            self.to
        };
        self.resolve(rollback)
    }

    fn resolve(&self, status: Status) -> Result<Status> {
        let mut done = self.done.lock();
        if done.is_some() {
            return Err(CacheError::TransitionResolved {
                from: self.from,
                to: self.to,
            });
        }

        *done = Some(status);
        self.resolved.notify_all();
        Ok(status)
    }
}
