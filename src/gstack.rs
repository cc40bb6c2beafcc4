//! The `GstackProvider` trait boundary and the default, thread-local-cached
//! implementation on top of [`crate::stack::Stack`].
//!
//! The prompt runtime (`runtime.rs`) never calls `Stack::new`/`Drop`
//! directly; it goes through a `GstackProvider` so that an alternative
//! allocation policy (a pool shared across a process, a lazy-commit
//! provider with its own SIGSEGV handler, …) can be substituted without
//! touching `prompt.rs`/`handler.rs`.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::config::Config;
use crate::stack::Stack;

/// A gstack plus the metadata the runtime needs to reuse it.
#[derive(Debug)]
pub struct Gstack {
    pub(crate) stack: Stack,
}

impl Gstack {
    pub fn end(&self) -> *mut usize {
        self.stack.end()
    }
}

/// External collaborator interface: allocate and free gstacks.
///
/// Implementations must guarantee that a `Gstack`'s base pointer is stable
/// for its lifetime (§4.4's ordering requirement) and that the returned
/// stack carries a noaccess guard gap per §6.1.
pub trait GstackProvider {
    /// The gstack size this provider hands out when the caller doesn't
    /// request one explicitly. Backed by the same `Config` the provider
    /// was constructed with, so `alloc`'s guard size and `mp_prompt`'s
    /// default size always agree.
    fn default_size(&self) -> usize;
    fn alloc(&self, size: usize) -> Gstack;
    fn free(&self, gstack: Gstack);
}

/// Default provider: an mmap/VirtualAlloc-backed [`Stack`] with a
/// thread-local free list, so that repeated `prompt()`/`resume_drop` cycles
/// (the common case for effect handlers that fire many times) don't pay for
/// a fresh `mmap` every time.
pub struct NativeGstackProvider {
    config: Config,
}

impl NativeGstackProvider {
    pub fn new(config: Config) -> Self {
        NativeGstackProvider { config }
    }
}

impl Default for NativeGstackProvider {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

thread_local! {
    static CACHE: RefCell<VecDeque<Stack>> = const { RefCell::new(VecDeque::new()) };
}

impl GstackProvider for NativeGstackProvider {
    fn default_size(&self) -> usize {
        self.config.default_gstack_size
    }

    fn alloc(&self, size: usize) -> Gstack {
        let reused = CACHE.with(|c| {
            let mut cache = c.borrow_mut();
            // pop from the back: most-recently-freed stack is most likely
            // to still be warm in the TLB/cache.
            if let Some(pos) = cache.iter().rposition(|s| s.len() >= size) {
                cache.remove(pos)
            } else {
                None
            }
        });
        let stack = reused.unwrap_or_else(|| Stack::new(size, self.config.guard_size));
        Gstack { stack }
    }

    fn free(&self, gstack: Gstack) {
        CACHE.with(|c| {
            let mut cache = c.borrow_mut();
            if cache.len() < self.config.cache_capacity {
                cache.push_back(gstack.stack);
            }
            // else: drop it, returning the reservation to the OS.
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freed_stack_is_reused() {
        let provider = NativeGstackProvider::default();
        let g1 = provider.alloc(64 * 1024);
        let base = g1.stack.base();
        provider.free(g1);
        let g2 = provider.alloc(64 * 1024);
        assert_eq!(g2.stack.base(), base, "expected the cached stack to be reused");
    }
}
