//! The shared tokio runtime and the bridge for synchronous entry points.

use std::{future::Future, sync::mpsc};

use once_cell::sync::Lazy;

/// Hosts network drivers, dispatchers and Execute units for every client.
pub(crate) static RUNTIME: Lazy<tokio::runtime::Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("loadmq-worker")
        .build()
        .expect("Failed to create tokio runtime")
});

/// Runs `future` on [`RUNTIME`] and blocks the calling thread until it finishes.
///
/// Safe to call from plain threads and from inside a multi-threaded runtime;
/// the future never runs on the caller's stack, so no `block_on` is nested.
pub(crate) fn run_blocking<F>(future: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    RUNTIME.spawn(async move {
        let _ = tx.send(future.await);
    });

    let wait = move || rx.recv();
    let received = match tokio::runtime::Handle::try_current() {
        Ok(handle)
            if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread =>
        {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    };

    match received {
        Ok(output) => output,
        // the task only drops the sender without sending if it panicked
        Err(_) => panic!("blocking task panicked"),
    }
}

/// Spawns `future` on [`RUNTIME`] without waiting for it.
pub(crate) fn spawn<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    RUNTIME.spawn(future);
}
