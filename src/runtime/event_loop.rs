//! A minimal cooperative host.
//!
//! Runs queued callbacks one at a time on the thread that called
//! [`EventLoop::start`], and keeps waiting as long as any registration is
//! outstanding. This mirrors how a load-test engine runs one iteration.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Callback, Enqueue, Host, ScriptError};
use crate::core::metrics::TagSet;

#[derive(Default)]
struct LoopState {
    registered: usize,
    queue: VecDeque<Callback>,
}

struct Shared {
    state: Mutex<LoopState>,
    wakeup: Condvar,
    context: CancellationToken,
    tags: Mutex<TagSet>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.context.cancel();
    }
}

/// A registration handed out by [`Host::register_callback`]. Released on drop
/// if never used.
struct Registration {
    shared: Arc<Shared>,
    used: bool,
}

impl Registration {
    fn enqueue(mut self, callback: Callback) {
        self.used = true;
        let mut state = self.shared.state.lock();
        state.registered -= 1;
        state.queue.push_back(callback);
        self.shared.wakeup.notify_all();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.used {
            self.shared.state.lock().registered -= 1;
            self.shared.wakeup.notify_all();
        }
    }
}

/// Reference [`Host`] implementation. Cloning shares the same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState::default()),
                wakeup: Condvar::new(),
                context: CancellationToken::new(),
                tags: Mutex::new(TagSet::new()),
            }),
        }
    }

    /// Sets a tag reported by [`Host::current_tags`].
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.shared.tags.lock().insert(key.into(), value.into());
    }

    /// Runs `first`, then every queued callback, until the queue is empty and no
    /// registration is outstanding. Stops at the first callback error.
    pub fn start(
        &self,
        first: impl FnOnce() -> Result<(), ScriptError>,
    ) -> Result<(), ScriptError> {
        first()?;

        loop {
            let callback = {
                let mut state = self.shared.state.lock();
                loop {
                    if let Some(callback) = state.queue.pop_front() {
                        break Some(callback);
                    }
                    if state.registered == 0 {
                        break None;
                    }
                    self.shared.wakeup.wait(&mut state);
                }
            };

            match callback {
                Some(callback) => callback()?,
                None => return Ok(()),
            }
        }
    }

    /// Ends the execution context, as a finished iteration does.
    pub fn cancel(&self) {
        self.shared.context.cancel();
    }

    /// Number of registrations that have not been used or released yet.
    pub fn pending_registrations(&self) -> usize {
        self.shared.state.lock().registered
    }
}

impl Host for EventLoop {
    fn register_callback(&self) -> Enqueue {
        self.shared.state.lock().registered += 1;
        trace!("Registered event loop callback");

        let registration = Registration {
            shared: self.shared.clone(),
            used: false,
        };
        Box::new(move |callback| registration.enqueue(callback))
    }

    fn context(&self) -> CancellationToken {
        self.shared.context.clone()
    }

    fn current_tags(&self) -> TagSet {
        self.shared.tags.lock().clone()
    }
}
