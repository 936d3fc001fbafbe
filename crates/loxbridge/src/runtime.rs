//! Boundary between the bridge and a hosted runtime.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{error::Result, marshal::GuestMemory};

/// Receives raw output from inside a blocking [`Runtime::execute`] call.
///
/// `memory` is the runtime's memory at the time of the call; `address` and
/// `length` locate the output bytes within it.
pub trait OutputCallback: Send + 'static {
    /// # Errors
    /// An error aborts the running execution.
    fn on_output(&mut self, memory: &[u8], address: u32, length: u32, is_error: bool)
    -> Result<()>;
}

/// An initialized-on-demand interpreter with its own addressable memory.
///
/// `execute` runs to completion on the calling thread and offers no
/// cooperative interruption. A runtime must however stop promptly, with
/// [`Error::Terminated`](crate::Error::Terminated) or any other error, once
/// the [`KillSwitch`] it was created with has been triggered.
pub trait Runtime: GuestMemory + Send {
    /// One-shot initialization signal.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot finish its setup.
    fn initialize(&mut self) -> Result<()>;

    /// Run the NUL-terminated source at `address`.
    ///
    /// # Errors
    /// Returns an error on a runtime fault or termination. Program-level
    /// errors are reported through `callback`, not through this result.
    fn execute(&mut self, address: u32, callback: Box<dyn OutputCallback>) -> Result<()>;
}

/// Creates runtimes inside worker threads.
pub trait RuntimeFactory: Send + Sync + 'static {
    type Runtime: Runtime;

    /// # Errors
    /// Returns an error if the runtime cannot be instantiated.
    fn create(&self, kill: KillSwitch) -> Result<Self::Runtime>;
}

impl<F: RuntimeFactory> RuntimeFactory for Arc<F> {
    type Runtime = F::Runtime;

    fn create(&self, kill: KillSwitch) -> Result<Self::Runtime> {
        (**self).create(kill)
    }
}

type TeardownHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct KillState {
    triggered: AtomicBool,
    hooks: Mutex<Vec<TeardownHook>>,
}

/// One-way teardown signal shared between a session handle and its worker.
///
/// Runtimes that cannot poll the flag from inside a blocking call register a
/// hook with [`KillSwitch::on_trigger`] to be interrupted instead.
#[derive(Clone, Default)]
pub struct KillSwitch(Arc<KillState>);

impl KillSwitch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the switch. Hooks run on the calling thread, once.
    pub fn trigger(&self) {
        if self.0.triggered.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.0.hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.triggered.load(Ordering::Acquire)
    }

    /// Run `hook` when the switch fires, or immediately if it already has.
    pub fn on_trigger(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self.0.hooks.lock();
        if self.is_triggered() {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(Box::new(hook));
    }
}

impl fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KillSwitch")
            .field("triggered", &self.is_triggered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn kill_switch_is_shared_between_clones() {
        let kill = KillSwitch::new();
        let worker_side = kill.clone();
        assert!(!worker_side.is_triggered());

        kill.trigger();
        assert!(worker_side.is_triggered());

        kill.trigger();
        assert!(worker_side.is_triggered());
    }

    #[test]
    fn hooks_run_once_on_first_trigger() {
        let kill = KillSwitch::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        kill.on_trigger(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        kill.clone().trigger();
        kill.trigger();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_hook_runs_immediately() {
        let kill = KillSwitch::new();
        kill.trigger();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        kill.on_trigger(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
