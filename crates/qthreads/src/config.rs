// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Values set through the builder methods win. [`RuntimeConfig::from_env`]
//! starts from the defaults and applies any of these that are set:
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `QTHREADS_NUM_SHEPHERDS` | `usize` | `shepherds` |
//! | `QTHREADS_STACK_SIZE` | `usize` | `stack_size` |
//! | `QTHREADS_ALLOCATOR` | `pooled` or `system` | `allocator` |
//! | `QTHREADS_POOL_CAPACITY` | `usize` | `pool_capacity` |

use std::fmt;
use std::sync::Arc;

use crate::alloc::{PooledAllocator, SystemAllocator, TaskAllocator, STACK_ALIGN};
use crate::error::RuntimeError;
use crate::future::FutureBookkeeping;

pub const ENV_NUM_SHEPHERDS: &str = "QTHREADS_NUM_SHEPHERDS";
pub const ENV_STACK_SIZE: &str = "QTHREADS_STACK_SIZE";
pub const ENV_ALLOCATOR: &str = "QTHREADS_ALLOCATOR";
pub const ENV_POOL_CAPACITY: &str = "QTHREADS_POOL_CAPACITY";

pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Task bodies are ordinary Rust functions and need room for their frames.
pub const MIN_STACK_SIZE: usize = 16 * 1024;
pub const DEFAULT_POOL_CAPACITY: usize = 100;

/// Where task stacks and contexts come from.
#[derive(Clone, Default)]
pub enum AllocatorKind {
    /// Per-shepherd free lists with a shared fallback.
    #[default]
    Pooled,
    /// Fresh allocation for every task.
    System,
    Custom(Arc<dyn TaskAllocator>),
}

impl fmt::Debug for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pooled => f.write_str("Pooled"),
            Self::System => f.write_str("System"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Clone)]
pub struct RuntimeConfig {
    /// Worker threads. Zero means one per available CPU.
    pub shepherds: usize,
    /// Bytes per task stack, rounded up to 16.
    pub stack_size: usize,
    pub allocator: AllocatorKind,
    /// Freed stacks and contexts each pool keeps for reuse.
    pub pool_capacity: usize,
    pub future_bookkeeping: Option<Arc<dyn FutureBookkeeping>>,
    /// Shepherd threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shepherds: 0,
            stack_size: DEFAULT_STACK_SIZE,
            allocator: AllocatorKind::Pooled,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            future_bookkeeping: None,
            thread_name_prefix: "qthreads-shepherd".to_string(),
        }
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("shepherds", &self.shepherds)
            .field("stack_size", &self.stack_size)
            .field("allocator", &self.allocator)
            .field("pool_capacity", &self.pool_capacity)
            .field("future_bookkeeping", &self.future_bookkeeping.is_some())
            .field("thread_name_prefix", &self.thread_name_prefix)
            .finish()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::default().apply_env(|var| std::env::var(var).ok())
    }

    pub fn shepherds(mut self, n: usize) -> Self {
        self.shepherds = n;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn allocator(mut self, kind: AllocatorKind) -> Self {
        self.allocator = kind;
        self
    }

    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn future_bookkeeping(mut self, bookkeeping: Arc<dyn FutureBookkeeping>) -> Self {
        self.future_bookkeeping = Some(bookkeeping);
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Apply overrides for every variable `lookup` reports as set.
    pub(crate) fn apply_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, RuntimeError> {
        if let Some(val) = lookup(ENV_NUM_SHEPHERDS) {
            self.shepherds = parse_usize(ENV_NUM_SHEPHERDS, &val)?;
        }
        if let Some(val) = lookup(ENV_STACK_SIZE) {
            self.stack_size = parse_usize(ENV_STACK_SIZE, &val)?;
        }
        if let Some(val) = lookup(ENV_ALLOCATOR) {
            self.allocator = match val.trim().to_ascii_lowercase().as_str() {
                "pooled" => AllocatorKind::Pooled,
                "system" => AllocatorKind::System,
                _ => {
                    return Err(RuntimeError::InvalidEnv {
                        var: ENV_ALLOCATOR,
                        value: val,
                    })
                }
            };
        }
        if let Some(val) = lookup(ENV_POOL_CAPACITY) {
            self.pool_capacity = parse_usize(ENV_POOL_CAPACITY, &val)?;
        }
        Ok(self)
    }

    /// Effective `(shepherds, stack_size)`.
    pub(crate) fn resolve(&self) -> Result<(usize, usize), RuntimeError> {
        let shepherds = match self.shepherds {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .map_err(|_| RuntimeError::NoShepherds)?,
            n => n,
        };
        let stack_size = self
            .stack_size
            .checked_add(STACK_ALIGN - 1)
            .map(|s| s & !(STACK_ALIGN - 1))
            .unwrap_or(usize::MAX & !(STACK_ALIGN - 1));
        if stack_size < MIN_STACK_SIZE {
            return Err(RuntimeError::StackTooSmall {
                requested: self.stack_size,
                minimum: MIN_STACK_SIZE,
            });
        }
        Ok((shepherds, stack_size))
    }

    pub(crate) fn build_allocator(&self, shepherds: usize) -> Arc<dyn TaskAllocator> {
        match &self.allocator {
            AllocatorKind::Pooled => Arc::new(PooledAllocator::new(shepherds, self.pool_capacity)),
            AllocatorKind::System => Arc::new(SystemAllocator),
            AllocatorKind::Custom(allocator) => allocator.clone(),
        }
    }
}

fn parse_usize(var: &'static str, value: &str) -> Result<usize, RuntimeError> {
    value.trim().parse().map_err(|_| RuntimeError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}
