// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stack and context allocation.
//!
//! The runtime draws a stack and an execution context for every task it
//! activates and hands them back when the task terminates. Where they
//! come from is pluggable: [`PooledAllocator`] keeps per-shepherd free
//! lists plus a shared fallback for callers outside any shepherd, and
//! [`SystemAllocator`] maps a fresh stack every time.
//!
//! Returning `None` from an allocation is fatal to the runtime.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::context::ExecContext;

/// Alignment of every task stack.
pub const STACK_ALIGN: usize = 16;

/// Which free list an allocation is drawn from or returned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// The private pool of the shepherd the caller runs on.
    Shepherd(usize),
    /// Fallback for calls made from threads that are not shepherds.
    Shared,
}

/// Size of the pages backing task stacks.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

/// An owned, 16-byte aligned stack region.
///
/// The region is mapped with one inaccessible guard page below it, so a
/// task that runs off the bottom of its stack faults instead of writing
/// into whatever memory lies beneath.
pub struct Stack {
    base: NonNull<u8>,
    size: usize,
    mapping: NonNull<libc::c_void>,
    mapped: usize,
}

// A stack is a plain memory region; ownership moves with the task.
unsafe impl Send for Stack {}

impl Stack {
    /// Map `size` usable bytes above a guard page. `None` if the size is
    /// zero or the mapping fails.
    pub fn new(size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }
        let page = page_size();
        let usable = size.checked_add(page - 1)? & !(page - 1);
        let mapped = usable.checked_add(page)?;
        // SAFETY: anonymous private mapping with no address hint.
        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return None;
        }
        let mapping = NonNull::new(mapping)?;
        // SAFETY: the lowest page lies inside the mapping just created.
        if unsafe { libc::mprotect(mapping.as_ptr(), page, libc::PROT_NONE) } != 0 {
            // SAFETY: unmapping what was mapped above.
            unsafe { libc::munmap(mapping.as_ptr(), mapped) };
            return None;
        }
        // SAFETY: `page` is inside the mapping.
        let base = unsafe { mapping.as_ptr().cast::<u8>().add(page) };
        Some(Self {
            base: NonNull::new(base)?,
            size,
            mapping,
            mapped,
        })
    }

    /// Lowest usable address. The guard page sits right below it.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// `[low, high)` address range covered by this stack.
    pub fn bounds(&self) -> (usize, usize) {
        let low = self.base.as_ptr() as usize;
        (low, low + self.size)
    }

    /// `[low, high)` of the guard page.
    pub fn guard(&self) -> (usize, usize) {
        let low = self.mapping.as_ptr() as usize;
        (low, self.base.as_ptr() as usize)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: the exact mapping `new` created, unmapped once.
        unsafe {
            libc::munmap(self.mapping.as_ptr(), self.mapped);
        }
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("size", &self.size)
            .finish()
    }
}

/// Source of task stacks and execution contexts.
pub trait TaskAllocator: Send + Sync {
    fn alloc_stack(&self, pool: Pool, size: usize) -> Option<Stack>;
    fn free_stack(&self, pool: Pool, stack: Stack);
    fn alloc_context(&self, pool: Pool) -> Option<ExecContext>;
    fn free_context(&self, pool: Pool, context: ExecContext);
}

/// Allocates fresh and frees immediately. No caching.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl TaskAllocator for SystemAllocator {
    fn alloc_stack(&self, _pool: Pool, size: usize) -> Option<Stack> {
        Stack::new(size)
    }

    fn free_stack(&self, _pool: Pool, stack: Stack) {
        drop(stack);
    }

    fn alloc_context(&self, _pool: Pool) -> Option<ExecContext> {
        Some(ExecContext::new())
    }

    fn free_context(&self, _pool: Pool, context: ExecContext) {
        drop(context);
    }
}

#[derive(Default)]
struct FreeList {
    stacks: Vec<Stack>,
    contexts: Vec<ExecContext>,
}

/// Free-list allocator with one pool per shepherd and a shared fallback.
///
/// A resource may come back to a different pool than it left. Each pool
/// keeps at most `capacity` entries of each kind; the rest are released.
pub struct PooledAllocator {
    shepherds: Vec<Mutex<FreeList>>,
    shared: Mutex<FreeList>,
    capacity: usize,
}

impl PooledAllocator {
    pub fn new(shepherds: usize, capacity: usize) -> Self {
        Self {
            shepherds: (0..shepherds).map(|_| Mutex::new(FreeList::default())).collect(),
            shared: Mutex::new(FreeList::default()),
            capacity,
        }
    }

    fn pool(&self, pool: Pool) -> &Mutex<FreeList> {
        match pool {
            Pool::Shepherd(index) => self.shepherds.get(index).unwrap_or(&self.shared),
            Pool::Shared => &self.shared,
        }
    }

    /// Number of cached `(stacks, contexts)` in `pool`.
    pub fn cached(&self, pool: Pool) -> (usize, usize) {
        let list = self.pool(pool).lock().unwrap();
        (list.stacks.len(), list.contexts.len())
    }
}

impl fmt::Debug for PooledAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledAllocator")
            .field("shepherds", &self.shepherds.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl TaskAllocator for PooledAllocator {
    fn alloc_stack(&self, pool: Pool, size: usize) -> Option<Stack> {
        // A cached stack of another size is dropped rather than handed out.
        let cached = self.pool(pool).lock().unwrap().stacks.pop();
        match cached {
            Some(stack) if stack.size() == size => Some(stack),
            _ => Stack::new(size),
        }
    }

    fn free_stack(&self, pool: Pool, stack: Stack) {
        let mut list = self.pool(pool).lock().unwrap();
        if list.stacks.len() < self.capacity {
            list.stacks.push(stack);
        }
    }

    fn alloc_context(&self, pool: Pool) -> Option<ExecContext> {
        let cached = self.pool(pool).lock().unwrap().contexts.pop();
        Some(cached.unwrap_or_default())
    }

    fn free_context(&self, pool: Pool, context: ExecContext) {
        let mut list = self.pool(pool).lock().unwrap();
        if list.contexts.len() < self.capacity {
            list.contexts.push(context);
        }
    }
}
