//! Futures returned by the `*Async` operations.
//!
//! [`Promise::new`] reserves a host registration, so the engine keeps running
//! until the promise settles. The [`Resolver`] may be used from any thread;
//! settling always happens on an engine turn, which is also where `then`
//! reactions run.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::debug;

use super::{Enqueue, Host};
use crate::core::Error;

/// Settled state of a [`Promise`].
#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected(Arc<Error>),
}

impl PromiseState {
    pub fn is_pending(&self) -> bool {
        matches!(self, PromiseState::Pending)
    }
}

type Reaction = Box<dyn FnOnce(Result<(), Arc<Error>>) + Send>;

struct Inner {
    state: PromiseState,
    reactions: Vec<Reaction>,
}

/// Script-visible future that settles exactly once with no value or an [`Error`].
#[derive(Clone)]
pub struct Promise {
    inner: Arc<Mutex<Inner>>,
}

/// Settles the paired [`Promise`]. Dropping it unsettled leaves the promise pending.
pub struct Resolver {
    promise: Promise,
    enqueue: Enqueue,
}

impl Promise {
    pub fn new(host: &dyn Host) -> (Promise, Resolver) {
        let promise = Promise {
            inner: Arc::new(Mutex::new(Inner {
                state: PromiseState::Pending,
                reactions: Vec::new(),
            })),
        };
        let resolver = Resolver {
            promise: promise.clone(),
            enqueue: host.register_callback(),
        };
        (promise, resolver)
    }

    pub fn state(&self) -> PromiseState {
        self.inner.lock().state.clone()
    }

    /// Registers a reaction. Runs immediately if the promise already settled.
    pub fn then(&self, reaction: impl FnOnce(Result<(), Arc<Error>>) + Send + 'static) {
        let mut inner = self.inner.lock();
        let outcome = match &inner.state {
            PromiseState::Pending => {
                inner.reactions.push(Box::new(reaction));
                return;
            }
            PromiseState::Fulfilled => Ok(()),
            PromiseState::Rejected(err) => Err(err.clone()),
        };
        drop(inner);
        reaction(outcome);
    }

    fn settle(&self, outcome: Result<(), Error>) {
        let outcome = outcome.map_err(Arc::new);
        let reactions = {
            let mut inner = self.inner.lock();
            if !inner.state.is_pending() {
                return;
            }
            inner.state = match &outcome {
                Ok(()) => PromiseState::Fulfilled,
                Err(err) => PromiseState::Rejected(err.clone()),
            };
            std::mem::take(&mut inner.reactions)
        };

        for reaction in reactions {
            reaction(outcome.clone());
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl Resolver {
    pub fn resolve(self) {
        self.settle(Ok(()));
    }

    pub fn reject(self, err: Error) {
        debug!(error = %err, "Rejecting promise");
        self.settle(Err(err));
    }

    pub fn settle(self, outcome: Result<(), Error>) {
        let promise = self.promise;
        (self.enqueue)(Box::new(move || {
            promise.settle(outcome);
            Ok(())
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EventLoop;

    #[test]
    fn test_settles_on_event_loop_turn() {
        let event_loop = EventLoop::new();
        let (promise, resolver) = Promise::new(&event_loop);
        assert!(promise.state().is_pending());

        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        promise.then(move |outcome| *sink.lock() = Some(outcome.is_ok()));

        std::thread::spawn(move || resolver.resolve());
        event_loop.start(|| Ok(())).unwrap();

        assert!(matches!(promise.state(), PromiseState::Fulfilled));
        assert_eq!(*observed.lock(), Some(true));
    }

    #[test]
    fn test_reject_carries_error() {
        let event_loop = EventLoop::new();
        let (promise, resolver) = Promise::new(&event_loop);
        resolver.reject(Error::NotConnected);
        event_loop.start(|| Ok(())).unwrap();

        match promise.state() {
            PromiseState::Rejected(err) => assert!(matches!(*err, Error::NotConnected)),
            other => panic!("unexpected state: {other:?}"),
        }

        // late reactions run immediately
        let late = Arc::new(Mutex::new(false));
        let flag = late.clone();
        promise.then(move |outcome| *flag.lock() = outcome.is_err());
        assert!(*late.lock());
    }
}
