//! `connect`, `reconnect` and `end`.
//!
//! Connecting always replaces: the current handle, if any, is torn down
//! under the same write lock that installs the new one, so publish and
//! subscribe never observe a half-swapped client.
//!
//! ```text
//! connect ──► Prepare (parse target, resolve credentials) ──► Execute
//!                                                              │
//!    write lock ◄─────────────────────────────────────────────┘
//!      ├── teardown old: detach hooks, Detach, DISCONNECT
//!      ├── open handle, Attach
//!      ├── wait for CONNACK (bounded by connectTimeout)
//!      └── ok: install ─ err: close handle, Detach, error policy
//! ```

use std::sync::{atomic::Ordering, Arc};

use loadmq_mqtt::{Credentials, HandleOptions, NetworkError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    blocking::run_blocking,
    client::{Attached, Client, Identity, Inner},
    error::{Error, Result},
    events::EventKind,
    metrics::TagSet,
    options::{CallOptions, ConnectTarget},
};
use crate::runtime::{Promise, Value};

/// A validated connect, ready to execute.
pub(super) struct ConnectPlan {
    target: ConnectTarget,
    credentials: Option<Credentials>,
}

impl Client {
    /// Connects to `url_or_options`, replacing any current connection.
    ///
    /// Accepts either an address plus an optional options object, or an
    /// options object carrying `servers`. An address together with `servers`
    /// offers all of them as candidates, the address first.
    pub fn connect(
        &self,
        url_or_options: impl Into<Value>,
        options: impl Into<Value>,
    ) -> Result<()> {
        let plan = self
            .inner
            .prepare_connect(&url_or_options.into(), &options.into())?;
        run_blocking(self.inner.clone().execute_connect(plan))
    }

    /// Like [`connect`](Self::connect), settling a promise instead of blocking.
    /// Argument errors are still returned right away.
    pub fn connect_async(
        &self,
        url_or_options: impl Into<Value>,
        options: impl Into<Value>,
    ) -> Result<Promise> {
        let plan = self
            .inner
            .prepare_connect(&url_or_options.into(), &options.into())?;
        Ok(self
            .inner
            .spawn_promise(self.inner.clone().execute_connect(plan)))
    }

    /// Drops the current connection, if any, and connects again with the
    /// options of the last `connect`.
    pub fn reconnect(&self) -> Result<()> {
        let plan = self.inner.prepare_reconnect()?;
        run_blocking(self.inner.clone().execute_connect(plan))
    }

    pub fn reconnect_async(&self) -> Result<Promise> {
        let plan = self.inner.prepare_reconnect()?;
        Ok(self
            .inner
            .spawn_promise(self.inner.clone().execute_connect(plan)))
    }

    /// Fires `end`, records the call and disconnects. Requires a connection.
    pub fn end(&self, options: impl Into<Value>) -> Result<()> {
        let options = self.inner.prepare_end(&options.into())?;
        run_blocking(self.inner.clone().execute_end(options))
    }

    pub fn end_async(&self, options: impl Into<Value>) -> Result<Promise> {
        let options = self.inner.prepare_end(&options.into())?;
        Ok(self
            .inner
            .spawn_promise(self.inner.clone().execute_end(options)))
    }
}

impl Inner {
    fn prepare_connect(&self, url_or_options: &Value, options: &Value) -> Result<ConnectPlan> {
        self.ensure_open()?;
        let target = ConnectTarget::parse(url_or_options, options)?;
        let credentials = self.options.resolve_credentials()?;

        *self.last_connect.lock() = Some(target.clone());
        Ok(ConnectPlan {
            target,
            credentials,
        })
    }

    fn prepare_reconnect(&self) -> Result<ConnectPlan> {
        self.ensure_open()?;
        let target = self
            .last_connect
            .lock()
            .clone()
            .ok_or(Error::NoPreviousConnect)?;
        let credentials = self.options.resolve_credentials()?;

        Ok(ConnectPlan {
            target,
            credentials,
        })
    }

    fn prepare_end(self: &Arc<Self>, options: &Value) -> Result<CallOptions> {
        self.ensure_connected()?;
        CallOptions::parse(options)
    }

    fn handle_options(&self, plan: ConnectPlan) -> HandleOptions {
        let connect = plan.target.options;
        HandleOptions {
            client_id: self.options.client_id.clone(),
            servers: plan.target.servers,
            keep_alive: connect
                .keepalive
                .unwrap_or_else(|| self.config.client.keepalive()),
            clean_session: connect.clean_session,
            credentials: plan.credentials,
            will: self.options.will.clone(),
        }
    }

    async fn execute_connect(self: Arc<Self>, plan: ConnectPlan) -> Result<()> {
        let mut slot = self.slot.write().await;
        self.connecting.store(true, Ordering::Release);

        if let Some(old) = slot.take() {
            self.teardown(old).await;
        }

        debug!("Connecting to MQTT broker");
        let error_tags = plan.target.options.tags.clone();
        let url = plan.target.url_tag().to_string();
        let timeout = plan
            .target
            .options
            .connect_timeout
            .unwrap_or_else(|| self.config.client.connect_timeout());

        let detach = CancellationToken::new();
        let handle = match self
            .connector
            .open(self.handle_options(plan), self.hooks(&detach))
        {
            Ok(handle) => handle,
            Err(err) => {
                self.connecting.store(false, Ordering::Release);
                drop(slot);
                return self.handle_error(
                    err,
                    "connect",
                    &error_tags,
                    &[("url", url.as_str())],
                );
            }
        };

        *self.identity.lock() = Identity {
            client_id: handle.client_id().to_string(),
            url: handle.server_url().to_string(),
        };
        self.dispatcher.attach();

        let outcome = match tokio::time::timeout(timeout, async {
            handle.connect().await.wait().await
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(NetworkError::ConnectTimeout(timeout)),
        };

        match outcome {
            Ok(()) => {
                *slot = Some(Attached { handle, detach });
                self.connecting.store(false, Ordering::Release);
                drop(slot);
                self.push_call("connect", &TagSet::new(), &[]);
                Ok(())
            }
            Err(err) => {
                self.teardown(Attached { handle, detach }).await;
                self.connecting.store(false, Ordering::Release);
                drop(slot);
                self.handle_error(err, "connect", &error_tags, &[("url", url.as_str())])
            }
        }
    }

    async fn execute_end(self: Arc<Self>, options: CallOptions) -> Result<()> {
        let mut slot = self.slot.write().await;
        debug!("Disconnecting from MQTT broker");

        self.fire(EventKind::End, Vec::new());
        self.push_call("end", &options.tags, &[]);

        if let Some(old) = slot.take() {
            self.teardown(old).await;
        }
        Ok(())
    }
}
