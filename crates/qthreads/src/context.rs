// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution contexts and the cooperative switch between them.
//!
//! A task's context is bound to its stack once, on first run, and then
//! resumed from the shepherd's home context by [`switch`]. Tasks return
//! control the same way, so the trampoline never relies on `uc_link`.

use std::fmt;
use std::mem;
use std::ptr;

use crate::alloc::Stack;
use crate::error::fatal;

/// Saved register set of a task or of a shepherd's scheduling loop.
///
/// Boxed so the address handed to the switch primitive stays put while
/// the owning descriptor moves between queues.
pub struct ExecContext {
    uc: Box<libc::ucontext_t>,
}

// The ucontext holds raw stack pointers; it is only ever used by the
// shepherd thread that runs the task it belongs to.
unsafe impl Send for ExecContext {}

impl ExecContext {
    /// A blank context. It becomes resumable once bound or saved into.
    pub fn new() -> Self {
        // SAFETY: ucontext_t is plain data; all-zero is a valid (unbound) value.
        Self {
            uc: Box::new(unsafe { mem::zeroed() }),
        }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::ucontext_t {
        &mut *self.uc
    }

    /// Bind this context to `stack` so that resuming it calls `entry`.
    ///
    /// # Safety
    /// `stack` must outlive every resumption of this context, and `entry`
    /// must never return.
    pub(crate) unsafe fn bind(&mut self, stack: &Stack, entry: extern "C" fn()) {
        let uc = self.as_mut_ptr();
        if libc::getcontext(uc) != 0 {
            fatal("getcontext failed");
        }
        (*uc).uc_stack.ss_sp = stack.base().cast();
        (*uc).uc_stack.ss_size = stack.size();
        (*uc).uc_stack.ss_flags = 0;
        (*uc).uc_link = ptr::null_mut();
        libc::makecontext(uc, entry, 0);
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecContext")
            .field("sp", &self.uc.uc_stack.ss_sp)
            .field("size", &self.uc.uc_stack.ss_size)
            .finish()
    }
}

/// Save the running context into `from` and resume `to`.
///
/// Returns when something switches back into `from`.
///
/// # Safety
/// Both pointers must refer to live contexts, and `to` must have been
/// bound or saved on this thread.
pub(crate) unsafe fn switch(from: *mut libc::ucontext_t, to: *const libc::ucontext_t) {
    if libc::swapcontext(from, to) != 0 {
        fatal("swapcontext failed");
    }
}
