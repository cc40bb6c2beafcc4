//! Gstack allocation: a large, contiguously-reserved stack region with a
//! noaccess guard page at the low end.
//!
//! This module is the "gstack allocator" that the runtime treats as an
//! external collaborator: `Stack` only needs to hand back a stable base
//! pointer and a growable extent. The default implementation reserves and
//! commits the whole region up front with `mmap`/`VirtualAlloc` rather than
//! lazily committing on a guard-page fault; see `gstack::GstackProvider` for
//! the trait boundary that would let a lazy-commit implementation replace it.

use std::fmt;

/// A raw, type-erased pointer into a gstack. Arithmetic on this type moves
/// by `usize`-sized words, matching the unit the context-switch trampolines
/// push and pop in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackPointer(*mut usize);

impl StackPointer {
    /// # Safety
    /// `ptr` must point into a live `Stack`'s reserved region.
    #[inline]
    pub unsafe fn new(ptr: *mut usize) -> StackPointer {
        StackPointer(ptr)
    }

    #[inline]
    pub fn offset(self, count: isize) -> *mut usize {
        unsafe { self.0.offset(count) }
    }

    /// Push a word, moving the pointer down by one `usize` (stacks grow down
    /// on every target this crate supports).
    #[inline]
    pub fn push(&mut self, val: usize) {
        unsafe {
            self.0 = self.0.offset(-1);
            *self.0 = val;
        }
    }
}

/// A single gstack: a committed region of memory with a guard page just
/// below `base` (the low end) to turn overflow into a hard fault instead of
/// silent corruption of an adjacent allocation.
pub struct Stack {
    base: *mut u8,
    size: usize,
    guard_size: usize,
}

// A `Stack`'s raw pointers are never aliased outside of the owning thread's
// runtime; it is moved, not shared, across the prompt boundary.
unsafe impl Send for Stack {}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("guard_size", &self.guard_size)
            .finish()
    }
}

impl Stack {
    /// Reserve and commit a new gstack of `size` bytes (rounded up to the
    /// page size) plus a `guard_size`-byte noaccess guard page below it.
    ///
    /// Aborts the process on allocation failure: per the spec, gstack
    /// exhaustion is unrecoverable and is never surfaced as a `Result`.
    pub fn new(size: usize, guard_size: usize) -> Stack {
        let page = page_size();
        let size = round_up(size.max(page), page);
        let guard_size = round_up(guard_size.max(page), page);

        let base = unsafe { sys::map(size, guard_size) };
        log::trace!(
            "gstack: allocated {size} byte stack (+{guard_size} byte guard) at {base:p}"
        );
        Stack {
            base,
            size,
            guard_size,
        }
    }

    /// The highest address of the usable region; the initial stack pointer
    /// for a freshly allocated stack, since stacks grow down.
    #[inline]
    pub fn end(&self) -> *mut usize {
        unsafe { self.base.add(self.size) as *mut usize }
    }

    /// The lowest address of the usable region (just above the guard page).
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        log::trace!("gstack: freeing stack at {:p}", self.base);
        unsafe { sys::unmap(self.base, self.size, self.guard_size) };
    }
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

pub fn page_size() -> usize {
    sys::page_size()
}

#[cfg(unix)]
mod sys {
    use libc::{
        c_void, mmap, mprotect, munmap, sysconf, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE,
        PROT_READ, PROT_WRITE, _SC_PAGESIZE,
    };

    pub fn page_size() -> usize {
        unsafe { sysconf(_SC_PAGESIZE) as usize }
    }

    /// Map `guard_size` bytes of `PROT_NONE` immediately below `size` bytes
    /// of read/write memory and return the base of the read/write region.
    pub unsafe fn map(size: usize, guard_size: usize) -> *mut u8 {
        let total = size + guard_size;
        let region = mmap(
            std::ptr::null_mut(),
            total,
            PROT_NONE,
            MAP_PRIVATE | MAP_ANON,
            -1,
            0,
        );
        if region == MAP_FAILED {
            log::error!("gstack: mmap({total}) failed: {}", std::io::Error::last_os_error());
            std::process::abort();
        }
        let usable = (region as *mut u8).add(guard_size);
        if mprotect(usable as *mut c_void, size, PROT_READ | PROT_WRITE) != 0 {
            log::error!(
                "gstack: mprotect({size}) failed: {}",
                std::io::Error::last_os_error()
            );
            std::process::abort();
        }
        usable
    }

    pub unsafe fn unmap(base: *mut u8, size: usize, guard_size: usize) {
        let region = base.sub(guard_size);
        munmap(region as *mut c_void, size + guard_size);
    }
}

#[cfg(windows)]
mod sys {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
        PAGE_NOACCESS, PAGE_READWRITE,
    };

    pub fn page_size() -> usize {
        // 64KiB allocation granularity is conservative but always valid on
        // every supported Windows target.
        64 * 1024
    }

    pub unsafe fn map(size: usize, guard_size: usize) -> *mut u8 {
        let total = size + guard_size;
        let region = VirtualAlloc(std::ptr::null(), total, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
        if region.is_null() {
            log::error!("gstack: VirtualAlloc({total}) failed");
            std::process::abort();
        }
        let mut old = 0u32;
        if VirtualProtect(region, guard_size, PAGE_NOACCESS, &mut old) == 0 {
            log::error!("gstack: VirtualProtect(guard) failed");
            std::process::abort();
        }
        (region as *mut u8).add(guard_size)
    }

    pub unsafe fn unmap(base: *mut u8, _size: usize, guard_size: usize) {
        let region = base.sub(guard_size);
        VirtualFree(region as *mut _, 0, MEM_RELEASE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_ends_are_stable_and_aligned() {
        let stack = Stack::new(64 * 1024, page_size());
        let end = stack.end();
        assert_eq!(end, stack.end(), "base pointer must be stable");
        assert_eq!((end as usize) % std::mem::size_of::<usize>(), 0);
    }
}
