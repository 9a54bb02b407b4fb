// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Optional `tracing-subscriber` init helper.
//!
//! The scheduler, fd lifecycle, and shutdown coordinator emit `tracing`
//! events unconditionally (cycle boundaries, readiness delivery, close
//! races, uncaught exceptions) -- but this crate never installs a global
//! subscriber itself. A library that called `tracing_subscriber::init()`
//! on its own would steal that decision from whatever binary embeds it.
//! [`init_tracing`] is provided purely as a convenience for tests and
//! small embedding binaries that want the same `RUST_LOG`-driven,
//! compact output this crate's own test suite uses; nothing else in
//! `evcore` calls it.

/// Install a `tracing-subscriber` `fmt` layer filtered by `RUST_LOG`
/// (defaulting to `info` when unset). Returns an error if a global
/// subscriber is already installed -- safe to call more than once from
/// test setup, where only the first call should win.
#[cfg(feature = "logging-init")]
pub fn init_tracing() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).compact().finish();
    tracing::subscriber::set_global_default(subscriber)
}
