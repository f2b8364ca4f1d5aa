//! Thread hosting for streaming units.
//!
//! Every threaded unit owns one OS thread that loops on its wake signal.
//! Cooperative suspension happens only at the signal; publishing a packet or
//! a command causes at most one wake.

use crate::{StreamError, StreamResult};
use ecow::EcoString;
use parking_lot::{Condvar, Mutex};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

/// A binary wake signal. Setting an already set signal is a no-op, so a
/// burst of producers costs one wakeup.
pub struct ThreadSignal {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Default for ThreadSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        if !*state {
            *state = true;
            self.cond.notify_one();
        }
    }

    /// Block until the signal is set, then consume it.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.cond.wait(&mut state);
        }
        *state = false;
    }

    /// Like [`Self::wait`] but gives up after `timeout`. Returns whether the
    /// signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !*state {
            self.cond.wait_for(&mut state, timeout);
        }
        std::mem::replace(&mut *state, false)
    }
}

/// Per-unit thread configuration, taken from board construction parameters.
#[derive(Clone, Debug)]
pub struct ThreadOptions {
    pub name: EcoString,
    pub stack_size: usize,
    /// Requested priority. Recorded for platforms that support it; std
    /// thread spawning itself applies name and stack size only.
    pub priority: u32,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            name: EcoString::from("strom"),
            stack_size: 64 * 1024,
            priority: 0,
        }
    }
}

impl ThreadOptions {
    pub fn named(name: impl AsRef<str>) -> Self {
        Self {
            name: EcoString::from(name.as_ref()),
            ..Default::default()
        }
    }
}

/// Context handed to a unit thread body.
pub struct ThreadCtx {
    signal: Arc<ThreadSignal>,
    terminate: Arc<AtomicBool>,
}

impl ThreadCtx {
    pub fn wait(&self) {
        self.signal.wait();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.signal.wait_timeout(timeout)
    }

    pub fn terminated(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }
}

/// Owner handle of a unit thread. Dropping stops and joins the thread.
pub struct UnitThread {
    signal: Arc<ThreadSignal>,
    terminate: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl UnitThread {
    pub fn spawn(
        options: ThreadOptions,
        body: impl FnOnce(ThreadCtx) + Send + 'static,
    ) -> StreamResult<Self> {
        let signal = Arc::new(ThreadSignal::new());
        let terminate = Arc::new(AtomicBool::new(false));
        let ctx = ThreadCtx {
            signal: signal.clone(),
            terminate: terminate.clone(),
        };
        if options.priority != 0 {
            log::debug!(
                "thread {} requests priority {} (left to the platform)",
                options.name,
                options.priority
            );
        }
        let handle = std::thread::Builder::new()
            .name(options.name.to_string())
            .stack_size(options.stack_size)
            .spawn(move || body(ctx))
            .map_err(|_| StreamError::NotEnoughMemory)?;
        Ok(Self {
            signal,
            terminate,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Wake the thread out of its signal wait.
    pub fn wake(&self) {
        self.signal.set();
    }

    /// Set the terminate flag, wake the thread, and join it.
    pub fn stop(&self) {
        self.terminate.store(true, Ordering::Release);
        self.signal.set();
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                // The thread is tearing down its own owner; it is already
                // on the way out and must not join itself.
                return;
            }
            if handle.join().is_err() {
                log::error!("unit thread panicked");
            }
        }
    }
}

impl Drop for UnitThread {
    fn drop(&mut self) {
        self.stop();
    }
}
