//! Waitable results for requests issued on a connection handle.
//!
//! Every handle operation returns a [`Token`] immediately; the request itself
//! completes later on the connection driver. Awaiting the token yields the
//! outcome once the matching acknowledgement (or failure) has been observed.
//!
//! The driver keeps the [`Waiter`] half and completes it exactly once. A waiter
//! that is dropped without completing (driver stopped, handle dropped) makes the
//! token resolve with [`NetworkError::ConnectionClosed`].
//!
//! ```ignore
//! let token = handle.subscribe("sensors/#", QoS::AtLeastOnce).await;
//! token.wait().await?;
//! ```

use tokio::sync::oneshot;

use super::error::{NetworkError, Result};

/// Caller side of a pending request.
#[derive(Debug)]
#[must_use = "a token does nothing unless waited on"]
pub struct Token {
    rx: oneshot::Receiver<Result<()>>,
}

/// Completion side of a pending request, held by whoever observes the acknowledgement.
#[derive(Debug)]
pub struct Waiter {
    tx: oneshot::Sender<Result<()>>,
}

impl Token {
    /// Creates a linked waiter/token pair.
    pub fn channel() -> (Waiter, Token) {
        let (tx, rx) = oneshot::channel();
        (Waiter { tx }, Token { rx })
    }

    /// Creates a token that is already settled with `result`.
    pub fn ready(result: Result<()>) -> Token {
        let (waiter, token) = Self::channel();
        waiter.complete(result);
        token
    }

    /// Waits for the request to be acknowledged.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(NetworkError::ConnectionClosed))
    }
}

impl Waiter {
    /// Settles the paired token. A token that was dropped in the meantime is ignored.
    pub fn complete(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }

    /// Settles the paired token successfully.
    pub fn succeed(self) {
        self.complete(Ok(()))
    }

    /// Settles the paired token with `err`.
    pub fn fail(self, err: NetworkError) {
        self.complete(Err(err))
    }
}
