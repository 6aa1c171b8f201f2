// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime errors and operation status codes.
//!
//! Only construction can fail with an error value. Contention is not an
//! error, a misused unlock is a status, and running out of stacks or
//! contexts ends the process through [`fatal`].

use thiserror::Error;

/// Why a runtime could not be built.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Zero shepherds were requested and the machine's parallelism is unknown.
    #[error("no shepherds: worker count is 0 and available parallelism could not be detected")]
    NoShepherds,

    /// Task stacks must hold ordinary Rust frames.
    #[error("task stack size {requested} is below the minimum of {minimum} bytes")]
    StackTooSmall { requested: usize, minimum: usize },

    /// The OS refused to start a shepherd thread.
    #[error("failed to spawn shepherd {index}: {source}")]
    SpawnShepherd {
        index: usize,
        source: std::io::Error,
    },

    /// An environment override was set but could not be parsed.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Outcome of [`Handle::lock`](crate::Handle::lock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// The calling task owns the lock.
    Acquired,
    /// Called from outside any task: a proxy task acquired the lock on the
    /// caller's behalf before this returned.
    Deferred,
}

/// Outcome of [`Handle::unlock`](crate::Handle::unlock).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockStatus {
    /// The lock was released or handed to the next waiter.
    Released,
    /// Nothing held a lock on that address.
    NotLocked,
}

/// Log and abort. A shepherd caught mid-switch cannot be unwound, so no
/// cleanup is attempted.
#[cold]
pub(crate) fn fatal(what: &str) -> ! {
    tracing::error!(reason = what, "qthreads: fatal runtime error");
    eprintln!("qthreads: fatal: {}", what);
    std::process::abort()
}
