#![allow(dead_code)]

use std::future::Future;

pub(crate) mod conn;
pub(crate) mod drivers;
pub(crate) mod tracing_common;

/// Run a test on a current-thread runtime, inside a `LocalSet` so the
/// server can `spawn_local` its handlers.
pub(crate) fn run(test: impl Future<Output = eyre::Result<()>>) {
    run_inner(test, false)
}

/// Like [run], with tokio's clock paused: timers fire as soon as every task
/// is idle.
pub(crate) fn run_paused(test: impl Future<Output = eyre::Result<()>>) {
    run_inner(test, true)
}

fn run_inner(test: impl Future<Output = eyre::Result<()>>, paused: bool) {
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_time();
    if paused {
        builder.start_paused(true);
    }
    let rt = builder.build().unwrap();

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        tracing_common::setup_tracing();

        if let Err(e) = test.await {
            panic!("Error: {e:?}");
        }
    });
}

/// Pseudo-headers for a request to `localhost`
pub(crate) fn request<'a>(method: &'a str, path: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        (":method", method),
        (":scheme", "https"),
        (":path", path),
        (":authority", "localhost"),
    ]
}
