//! Per-ABI register-context switch trampolines.
//!
//! Each platform module exports `Registers`, `initialize_call_frame`, `swap`
//! and `swap_link` with the same shapes so `reg_context::RegContext` can stay
//! platform-agnostic.

#[cfg(all(unix, target_arch = "x86_64"))]
pub use self::x86_64_unix::*;

#[cfg(all(unix, target_arch = "aarch64"))]
pub use self::aarch64_unix::*;

#[cfg(windows)]
pub use self::windows::*;

#[cfg(all(unix, target_arch = "x86_64"))]
mod x86_64_unix;

#[cfg(all(unix, target_arch = "aarch64"))]
mod aarch64_unix;

#[cfg(windows)]
mod windows;

#[cfg(not(any(
    all(unix, target_arch = "x86_64"),
    all(unix, target_arch = "aarch64"),
    windows
)))]
compile_error!("mprompt: unsupported target (supported: x86_64/aarch64 unix, windows)");

/// Round a pointer down to a 16-byte boundary, as required by the SysV and
/// AAPCS64 stack-alignment rules at a call instruction.
#[inline]
pub fn align_down(ptr: *mut usize) -> *mut usize {
    let addr = ptr as usize;
    (addr & !0xf) as *mut usize
}

/// Offset a `*mut usize` by `count` words (may be negative).
#[inline]
pub fn mut_offset(ptr: *mut usize, count: isize) -> *mut usize {
    unsafe { ptr.offset(count) }
}
