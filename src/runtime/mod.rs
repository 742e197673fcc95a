//! The scripting-engine boundary.
//!
//! The binding never runs script code on its own threads. Everything
//! script-visible goes through a [`Host`], which models a single-threaded,
//! cooperative engine:
//!
//! - [`Host::register_callback`] reserves a slot on the engine's task queue and
//!   returns an [`Enqueue`] function. The engine keeps running while any slot is
//!   outstanding; calling the function exactly once hands it a [`Callback`]
//!   that runs on a later engine turn.
//! - [`Host::context`] is cancelled when the enclosing script execution ends.
//! - [`Host::current_tags`] supplies the tags of the running iteration.
//!
//! [`EventLoop`] is a reference host used by tests and the demo. [`Value`]
//! and [`Function`] stand in for the engine's value marshalling, and
//! [`Promise`] for its future constructor.

use tokio_util::sync::CancellationToken;

use crate::core::metrics::TagSet;

mod event_loop;
mod promise;
mod value;

pub use self::{
    event_loop::EventLoop,
    promise::{Promise, PromiseState, Resolver},
    value::{Function, Value},
};

/// An error thrown by script code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<crate::core::Error> for ScriptError {
    fn from(err: crate::core::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A unit of work that runs on an engine turn.
pub type Callback = Box<dyn FnOnce() -> Result<(), ScriptError> + Send>;

/// One reserved slot on the engine's queue. Dropping it uncalled releases the slot.
pub type Enqueue = Box<dyn FnOnce(Callback) + Send>;

/// A cooperative, single-threaded script engine.
pub trait Host: Send + Sync {
    fn register_callback(&self) -> Enqueue;

    fn context(&self) -> CancellationToken;

    fn current_tags(&self) -> TagSet;
}
