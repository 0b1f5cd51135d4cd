//! lifecycle state machine shared by caches, cache managers and write-behind engines.
//!
//! Every manageable object owns one `StatusTransitioner`. A transition request returns a
//! `StateTransition` that the requesting thread resolves once its side effects are done;
//! readers on other threads block until then, so they never observe a half-initialized object.

pub mod transition;

use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use log::*;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
pub use transition::Transition;

/// public lifecycle states, ordered from least to most advanced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    Uninitialized,
    Maintenance,
    Available,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Uninitialized => "UNINITIALIZED",
            Status::Maintenance => "MAINTENANCE",
            Status::Available => "AVAILABLE",
        };
        f.write_str(name)
    }
}

impl Status {
    fn init(self) -> Result<Status> {
        match self {
            Status::Uninitialized => Ok(Status::Available),
            state => Err(CacheError::IllegalTransition {
                action: "init",
                state,
            }),
        }
    }

    fn maintenance(self) -> Result<Status> {
        match self {
            Status::Uninitialized => Ok(Status::Maintenance),
            state => Err(CacheError::IllegalTransition {
                action: "maintenance",
                state,
            }),
        }
    }

    fn close(self) -> Result<Status> {
        match self {
            Status::Available | Status::Maintenance => Ok(Status::Uninitialized),
            state => Err(CacheError::IllegalTransition {
                action: "close",
                state,
            }),
        }
    }
}

/// a component initialized and closed alongside its owner
pub trait LifeCycled: Send + Sync {
    fn init(&self) -> anyhow::Result<()>;
    fn close(&self) -> anyhow::Result<()>;
}

/// notified after each successful transition
pub trait StateChangeListener: Send + Sync {
    fn state_transition(&self, from: Status, to: Status);
}

pub struct StatusTransitioner {
    current: Mutex<Arc<Transition>>,
    maintenance_lease: Mutex<Option<ThreadId>>,
    hooks: RwLock<Vec<Arc<dyn LifeCycled>>>,
    listeners: RwLock<Vec<Arc<dyn StateChangeListener>>>,
}

impl Default for StatusTransitioner {
    fn default() -> Self {
        StatusTransitioner::new()
    }
}

impl fmt::Debug for StatusTransitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusTransitioner")
            .field("current", &self.current.lock())
            .field("hooks", &self.hooks.read().len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl StatusTransitioner {
    pub fn new() -> StatusTransitioner {
        StatusTransitioner {
            current: Mutex::new(Arc::new(Transition::settled(Status::Uninitialized))),
            maintenance_lease: Mutex::new(None),
            hooks: RwLock::new(vec![]),
            listeners: RwLock::new(vec![]),
        }
    }

    /// the most recently resolved state; blocks while another thread's transition is in flight
    pub fn current_status(&self) -> Status {
        let current = self.current.lock().clone();
        current.get()
    }

    pub fn is_transitioning(&self) -> bool {
        !self.current.lock().is_done()
    }

    pub fn check_available(&self) -> Result<()> {
        match self.current_status() {
            Status::Available => Ok(()),
            status => Err(CacheError::NotAvailable(status)),
        }
    }

    /// succeeds only in MAINTENANCE and only for the thread holding the maintenance lease
    pub fn check_maintenance(&self) -> Result<()> {
        let status = self.current_status();
        let lease = *self.maintenance_lease.lock();
        if status == Status::Maintenance && lease == Some(thread::current().id()) {
            Ok(())
        } else {
            Err(CacheError::NotInMaintenance(status))
        }
    }

    pub fn init(&self) -> Result<StateTransition<'_>> {
        trace!("initializing");
        self.begin(Status::init)
    }

    pub fn maintenance(&self) -> Result<StateTransition<'_>> {
        trace!("entering maintenance");
        let transition = self.begin(Status::maintenance)?;
        *self.maintenance_lease.lock() = Some(thread::current().id());
        Ok(transition)
    }

    pub fn exit_maintenance(&self) -> Result<StateTransition<'_>> {
        self.check_maintenance()?;
        trace!("exiting maintenance");
        self.begin(Status::close)
    }

    pub fn close(&self) -> Result<StateTransition<'_>> {
        trace!("closing");
        let status = self.current_status();
        if status == Status::Maintenance {
            // only the lease holder may close out of maintenance
            self.check_maintenance()?;
        }
        self.begin(Status::close)
    }

    pub fn add_hook(&self, hook: Arc<dyn LifeCycled>) -> Result<()> {
        let status = self.current_status();
        if status != Status::Uninitialized {
            return Err(CacheError::IllegalTransition {
                action: "add hook",
                state: status,
            });
        }
        self.hooks.write().push(hook);
        Ok(())
    }

    pub fn register_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.write().push(listener);
    }

    fn begin(&self, edge: fn(Status) -> Result<Status>) -> Result<StateTransition<'_>> {
        loop {
            let observed = self.current.lock().clone();
            // never wait on an in-flight transition while holding the lock
            let from = observed.get();

            let mut current = self.current.lock();
            if !Arc::ptr_eq(&*current, &observed) {
                trace!("lost the race for the next transition, retrying");
                continue;
            }

            let to = edge(from)?;
            let transition = Arc::new(Transition::new(from, to));
            *current = transition.clone();

            return Ok(StateTransition {
                transitioner: self,
                transition,
            });
        }
    }

    fn run_init_hooks(&self) -> anyhow::Result<()> {
        let hooks = self.hooks.read().clone();
        let mut initialized: Vec<&Arc<dyn LifeCycled>> = vec![];
        for hook in hooks.iter() {
            if let Err(e) = hook.init() {
                for done in initialized.iter().rev() {
                    if let Err(close_err) = done.close() {
                        error!("closing hook after failed init: {:?}", close_err);
                    }
                }
                return Err(e);
            }
            initialized.push(hook);
        }
        Ok(())
    }

    fn run_close_hooks(&self) -> anyhow::Result<()> {
        let hooks = self.hooks.read().clone();
        let mut first_failure = None;
        for hook in hooks.iter().rev() {
            if let Err(e) = hook.close() {
                if first_failure.is_none() {
                    first_failure = Some(e);
                } else {
                    error!("hook failed to close: {:?}", e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fire_transition(&self, from: Status, to: Status) {
        debug!("state transition {} -> {}", from, to);
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.state_transition(from, to);
        }
    }
}

/// an in-flight transition, resolved by the requesting thread
///
/// Dropping it unresolved resolves it as failed.
pub struct StateTransition<'a> {
    transitioner: &'a StatusTransitioner,
    transition: Arc<Transition>,
}

impl<'a> StateTransition<'a> {
    pub fn from(&self) -> Status {
        self.transition.from()
    }

    pub fn to(&self) -> Status {
        self.transition.to()
    }

    /// Runs the hooks for the edge, then resolves to the target state. Hooks init on the
    /// way into AVAILABLE and close on the way out of it; maintenance runs none.
    pub fn succeeded(self) -> Result<()> {
        let from = self.transition.from();
        let to = self.transition.to();
        let hooks = match to {
            Status::Available => self.transitioner.run_init_hooks(),
            Status::Maintenance => Ok(()),
            Status::Uninitialized => {
                *self.transitioner.maintenance_lease.lock() = None;
                if from == Status::Available {
                    self.transitioner.run_close_hooks()
                } else {
                    Ok(())
                }
            }
        };

        if let Err(e) = hooks {
            self.transition.failed()?;
            return Err(CacheError::StateTransition(e));
        }

        self.transition.succeeded()?;
        self.transitioner.fire_transition(from, to);
        Ok(())
    }

    /// resolves toward UNINITIALIZED and wraps the cause for the caller to return
    pub fn failed(self, cause: impl Into<anyhow::Error>) -> CacheError {
        if self.transition.to() != Status::Available {
            *self.transitioner.maintenance_lease.lock() = None;
        }
        match self.transition.failed() {
            Ok(_) => CacheError::StateTransition(cause.into()),
            Err(e) => e,
        }
    }
}

impl<'a> Drop for StateTransition<'a> {
    fn drop(&mut self) {
        if !self.transition.is_done() {
            warn!(
                "transition {} -> {} dropped unresolved, marking as failed",
                self.transition.from(),
                self.transition.to()
            );
            let _ = self.transition.failed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHook {
        inits: AtomicUsize,
        closes: AtomicUsize,
        fail_init: bool,
    }

    impl LifeCycled for CountingHook {
        fn init(&self) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("init refused");
            }
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        seen: Mutex<Vec<(Status, Status)>>,
    }

    impl StateChangeListener for RecordingListener {
        fn state_transition(&self, from: Status, to: Status) {
            self.seen.lock().push((from, to));
        }
    }

    #[test]
    fn init_and_close() {
        let status = StatusTransitioner::new();
        assert_eq!(status.current_status(), Status::Uninitialized);

        let transition = status.init().unwrap();
        assert!(status.is_transitioning());
        transition.succeeded().unwrap();
        assert!(!status.is_transitioning());
        assert_eq!(status.current_status(), Status::Available);
        assert!(status.check_available().is_ok());

        status.close().unwrap().succeeded().unwrap();
        assert_eq!(status.current_status(), Status::Uninitialized);
    }

    #[test]
    fn illegal_edges() {
        let status = StatusTransitioner::new();
        match status.close() {
            Err(CacheError::IllegalTransition { state, .. }) => {
                assert_eq!(state, Status::Uninitialized)
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }

        status.init().unwrap().succeeded().unwrap();
        assert!(status.init().is_err());
        assert!(status.maintenance().is_err());
    }

    #[test]
    fn check_available() {
        let status = StatusTransitioner::new();
        assert!(matches!(
            status.check_available(),
            Err(CacheError::NotAvailable(Status::Uninitialized))
        ));

        status.maintenance().unwrap().succeeded().unwrap();
        assert!(matches!(
            status.check_available(),
            Err(CacheError::NotAvailable(Status::Maintenance))
        ));
        assert!(status.check_maintenance().is_ok());

        status.exit_maintenance().unwrap().succeeded().unwrap();
        status.init().unwrap().succeeded().unwrap();
        assert!(status.check_available().is_ok());
    }

    #[test]
    fn maintenance_lease_is_per_thread() {
        let status = Arc::new(StatusTransitioner::new());
        status.maintenance().unwrap().succeeded().unwrap();

        let other = status.clone();
        let held = std::thread::spawn(move || other.check_maintenance().is_ok())
            .join()
            .unwrap();
        assert!(!held);
        assert!(status.check_maintenance().is_ok());
    }

    #[test]
    fn failed_init_rolls_back() {
        let status = StatusTransitioner::new();
        let transition = status.init().unwrap();
        let err = transition.failed(anyhow::anyhow!("boom"));
        assert!(matches!(err, CacheError::StateTransition(_)));
        assert_eq!(status.current_status(), Status::Uninitialized);

        // retry after a failure is allowed
        status.init().unwrap().succeeded().unwrap();
        assert_eq!(status.current_status(), Status::Available);
    }

    #[test]
    fn dropped_transition_fails() {
        let status = StatusTransitioner::new();
        {
            let _transition = status.init().unwrap();
        }
        assert!(!status.is_transitioning());
        assert_eq!(status.current_status(), Status::Uninitialized);
    }

    #[test]
    fn hooks_run_on_init_and_close() {
        let status = StatusTransitioner::new();
        let hook = Arc::new(CountingHook::default());
        status.add_hook(hook.clone()).unwrap();

        status.init().unwrap().succeeded().unwrap();
        assert_eq!(hook.inits.load(Ordering::SeqCst), 1);
        assert!(status.add_hook(hook.clone()).is_err());

        status.close().unwrap().succeeded().unwrap();
        assert_eq!(hook.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_hook_fails_transition() {
        let status = StatusTransitioner::new();
        let good = Arc::new(CountingHook::default());
        let bad = Arc::new(CountingHook {
            fail_init: true,
            ..Default::default()
        });
        status.add_hook(good.clone()).unwrap();
        status.add_hook(bad).unwrap();

        let result = status.init().unwrap().succeeded();
        assert!(matches!(result, Err(CacheError::StateTransition(_))));
        assert_eq!(status.current_status(), Status::Uninitialized);
        assert_eq!(good.inits.load(Ordering::SeqCst), 1);
        assert_eq!(good.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listeners_see_transitions() {
        let status = StatusTransitioner::new();
        let listener = Arc::new(RecordingListener::default());
        status.register_listener(listener.clone());

        status.init().unwrap().succeeded().unwrap();
        let _ = status.close().unwrap().failed(anyhow::anyhow!("ignored"));
        status.init().unwrap().succeeded().unwrap();

        let seen = listener.seen.lock().clone();
        assert_eq!(
            seen,
            vec![
                (Status::Uninitialized, Status::Available),
                (Status::Uninitialized, Status::Available)
            ]
        );
    }

    #[test]
    fn readers_wait_for_owner() {
        let status = Arc::new(StatusTransitioner::new());
        let transition = status.init().unwrap();

        let reader = {
            let status = status.clone();
            std::thread::spawn(move || status.current_status())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!reader.is_finished());

        // the owner sees the optimistic target
        assert_eq!(status.current_status(), Status::Available);
        transition.succeeded().unwrap();
        assert_eq!(reader.join().unwrap(), Status::Available);
    }

    #[test]
    fn maintenance_runs_no_hooks() {
        let status = StatusTransitioner::new();
        let hook = Arc::new(CountingHook::default());
        status.add_hook(hook.clone()).unwrap();

        status.maintenance().unwrap().succeeded().unwrap();
        status.exit_maintenance().unwrap().succeeded().unwrap();
        assert_eq!(hook.inits.load(Ordering::SeqCst), 0);
        assert_eq!(hook.closes.load(Ordering::SeqCst), 0);

        status.maintenance().unwrap().succeeded().unwrap();
        status.close().unwrap().succeeded().unwrap();
        assert_eq!(hook.inits.load(Ordering::SeqCst), 0);
        assert_eq!(hook.closes.load(Ordering::SeqCst), 0);

        // a normal init/close cycle still runs them
        status.init().unwrap().succeeded().unwrap();
        status.close().unwrap().succeeded().unwrap();
        assert_eq!(hook.inits.load(Ordering::SeqCst), 1);
        assert_eq!(hook.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiting_requester_does_not_block_status_reads() {
        use std::sync::mpsc;
        use std::time::Duration;

        let status = Arc::new(StatusTransitioner::new());
        let transition = status.init().unwrap();

        // a second requester waits on the in-flight init
        let requester = {
            let status = status.clone();
            std::thread::spawn(move || status.maintenance().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!requester.is_finished());

        let (tx, rx) = mpsc::channel();
        {
            let status = status.clone();
            std::thread::spawn(move || {
                let _ = tx.send(status.is_transitioning());
            });
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));

        // the owner keeps its optimistic read
        assert_eq!(status.current_status(), Status::Available);
        transition.succeeded().unwrap();

        match requester.join().unwrap() {
            Err(CacheError::IllegalTransition { action, state }) => {
                assert_eq!(action, "maintenance");
                assert_eq!(state, Status::Available);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(status.current_status(), Status::Available);
        assert!(!status.is_transitioning());
    }
}
