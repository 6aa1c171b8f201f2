// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative user-level tasks with full/empty-bit synchronization.
//!
//! A [`Runtime`] runs a fixed set of shepherd threads. Tasks forked onto
//! it get their own small stack and run until they yield, block on a
//! word or an address lock, or return. Nothing is preempted.
//!
//! Components:
//! - task lifecycle and the shepherd loop: fork, prepare/schedule, yield
//! - full/empty bits: dataflow reads and writes on any [`Word`]
//! - address locks: mutual exclusion keyed by any address
//! - pluggable stack/context allocation
//!
//! ```no_run
//! use std::sync::Arc;
//! use qthreads::{Runtime, Word};
//!
//! let rt = Runtime::with_shepherds(4).unwrap();
//! let slot = Arc::new(Word::new(0));
//! rt.fork_with(|_| 6 * 7, Some(slot.clone()));
//! assert_eq!(rt.read_full_full(&slot), 42);
//! rt.finalize();
//! ```

pub mod alloc;
pub mod config;
pub mod context;
pub mod error;
pub mod feb;
pub mod future;
pub mod lock;
mod queue;
mod runtime;
mod shepherd;
pub mod task;

pub use alloc::{Pool, PooledAllocator, Stack, SystemAllocator, TaskAllocator};
pub use config::{AllocatorKind, RuntimeConfig};
pub use error::{LockStatus, RuntimeError, UnlockStatus};
pub use feb::{Aligned, FebStatus, Word};
pub use future::FutureBookkeeping;
pub use runtime::{Handle, Runtime};
pub use task::{PreparedTask, TaskHandle, TaskState};
