// Windows has no portable inline-asm story across MSVC/GNU toolchains, so
// this backend rides the Win32 Fiber API instead of a hand-written
// trampoline: `ConvertThreadToFiber`/`CreateFiber`/`SwitchToFiber` already
// implement exactly the context switch this crate needs, including the
// parts of the calling convention (SEH chain, TIB stack bounds) that a
// hand-rolled trampoline would otherwise have to reproduce.
use std::cell::Cell;
use std::mem;

use windows_sys::Win32::System::Threading::{
    ConvertThreadToFiber, CreateFiberEx, DeleteFiber, SwitchToFiber,
};

use crate::reg_context::InitFn;
use crate::stack::{Stack, StackPointer};

thread_local! {
    static THREAD_FIBER: Cell<*mut std::ffi::c_void> = const { Cell::new(std::ptr::null_mut()) };
    static TRANSFER_ARG: Cell<usize> = const { Cell::new(0) };
}

fn ensure_thread_is_fiber() {
    THREAD_FIBER.with(|cell| {
        if cell.get().is_null() {
            let fiber = unsafe { ConvertThreadToFiber(std::ptr::null()) };
            cell.set(fiber);
        }
    });
}

unsafe extern "system" fn fiber_entry(param: *mut std::ffi::c_void) {
    let fptr: InitFn = unsafe { mem::transmute(param) };
    let sp = unsafe { StackPointer::new(std::ptr::null_mut()) };
    unsafe { fptr(0, sp) };
}

#[repr(C)]
#[derive(Debug)]
pub struct Registers {
    fiber: usize,
}

impl Registers {
    pub fn new() -> Registers {
        Registers { fiber: 0 }
    }

    pub fn root() -> Registers {
        ensure_thread_is_fiber();
        Registers {
            fiber: THREAD_FIBER.with(|c| c.get() as usize),
        }
    }

    #[inline]
    pub fn get_sp(&self) -> StackPointer {
        unsafe { StackPointer::new(self.fiber as *mut usize) }
    }

    #[inline]
    pub fn set_sp(&mut self, sp: StackPointer) {
        self.fiber = sp.offset(0) as usize;
    }

    #[inline(always)]
    pub fn prefetch(&self) {}

    #[inline]
    pub unsafe fn restore_context(&mut self) {}

    pub unsafe fn init_with(&mut self, fptr: InitFn, stack: &Stack) {
        ensure_thread_is_fiber();
        let fiber = unsafe {
            CreateFiberEx(
                stack.len(),
                stack.len(),
                0,
                Some(fiber_entry),
                fptr as *const std::ffi::c_void,
            )
        };
        self.fiber = fiber as usize;
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Registers {
    fn drop(&mut self) {
        if self.fiber != 0 && self.fiber != THREAD_FIBER.with(|c| c.get() as usize) {
            unsafe { DeleteFiber(self.fiber as *mut std::ffi::c_void) };
        }
    }
}

#[inline(always)]
pub unsafe fn swap(arg: usize, new_sp: StackPointer) -> (usize, StackPointer) {
    TRANSFER_ARG.with(|c| c.set(arg));
    let fiber = new_sp.offset(0) as *mut std::ffi::c_void;
    unsafe { SwitchToFiber(fiber) };
    let ret = TRANSFER_ARG.with(|c| c.get());
    (ret, new_sp)
}

#[inline(always)]
pub unsafe fn swap_link(
    arg: usize,
    new_sp: StackPointer,
    _new_stack_base: *mut usize,
) -> (usize, StackPointer) {
    unsafe { swap(arg, new_sp) }
}
