// This file is adapted from libfringe, a low-level green threading library.
// Copyright (c) edef <edef@edef.eu>,
//               whitequark <whitequark@whitequark.org>
//               Amanieu d'Antras <amanieu@gmail.com>
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

// To understand the code in this file, keep in mind these two facts:
// * x86_64 SysV C ABI has a "red zone": 128 bytes under the top of the stack
//   that is defined to be unmolested by signal handlers, interrupts, etc.
// * x86_64 SysV C ABI requires the stack to be aligned at function entry,
//   so that (%rsp+8) is a multiple of 16.
// * x86_64 SysV C ABI passes the first argument in %rdi. We also use %rdi
//   to pass a value while swapping context; this allows us to reuse the
//   swap function to perform the initial call. We do the same thing with
//   %rsi to pass the stack pointer to the new context.
use std::arch::{asm, naked_asm};
use std::mem;

use crate::detail::align_down;
use crate::reg_context::InitFn;
use crate::stack::{Stack, StackPointer};

/// prefetch data one cache line ahead
#[inline(always)]
unsafe fn prefetch(data: *const usize) {
    unsafe {
        asm!("prefetcht1 [{0}]", in(reg) data, options(nostack, preserves_flags));
    }
}

unsafe fn initialize_call_frame(regs: &mut Registers, fptr: InitFn, stack: &Stack) {
    // We set up the stack so that to an unwinder it looks like
    // `trampoline_1` has called `trampoline_2`, which has in turn called
    // `swap`'s trampoline. There are 2 call frames in this setup, each
    // containing the return address followed by the %rbp value for that
    // frame.
    #[unsafe(naked)]
    unsafe extern "C" fn trampoline_1() {
        naked_asm!(
            "
            .cfi_startproc
            .cfi_def_cfa rbp, 16
            .cfi_offset rbp, -16
            nop
            nop
            .cfi_endproc
            "
        )
    }

    #[unsafe(naked)]
    unsafe extern "C" fn trampoline_2() {
        naked_asm!(
            "
            .cfi_startproc
            .cfi_def_cfa rbp, 16
            .cfi_offset rbp, -16
            nop
            call qword ptr [rsp + 16]
            mov rsp, rsi
            pop rbp
            .cfi_adjust_cfa_offset -8
            .cfi_restore rbp
            xor rsi, rsi
            pop rax
            .cfi_adjust_cfa_offset -8
            .cfi_register rip, rax
            jmp rax
            .cfi_endproc
            "
        )
    }

    let sp = align_down(stack.end());
    let mut sp = unsafe { StackPointer::new(sp) };

    sp.push(0); // padding for 16-byte alignment
    sp.push(fptr as usize); // function trampoline_2 calls

    // call frame for trampoline_2; the CFA slot is rewritten by `swap` on
    // every context switch.
    let frame_return = trampoline_1 as usize + 2;
    sp.push(frame_return);
    sp.push(0xdead_dead_dead_0cfa);

    // call frame for the swap trampoline, with %rbp pointing at the parent
    // call frame above.
    let frame = sp.offset(0);
    sp.push(trampoline_2 as usize + 1);
    sp.push(frame as usize);

    regs.sp = sp.offset(0) as usize;
}

/// Switch to `new_sp`, linking the new stack's CFA slot to the current
/// stack bottom (`new_stack_base`) so an unwinder can cross the boundary.
#[inline(always)]
pub unsafe fn swap_link(
    arg: usize,
    new_sp: StackPointer,
    new_stack_base: *mut usize,
) -> (usize, StackPointer) {
    let ret: usize;
    let ret_sp: usize;
    unsafe {
        asm!(
            "
            mov [rsp - 8], rbx
            lea rax, [rip + 2f]
            push rax
            push rbp
            mov [rcx - 32], rsp
            mov rsi, rsp
            mov rsp, rdx
            pop rbp
            pop rax
            jmp rax
            2:
            mov rbx, [rsp - 8]
            ",
            inout("rdi") arg => ret,
            out("rsi") ret_sp,
            in("rdx") new_sp.offset(0),
            in("rcx") new_stack_base,
            out("rax") _, out("r8") _, out("r9") _, out("r10") _,
            out("r11") _, out("r12") _, out("r13") _, out("r14") _, out("r15") _,
            clobber_abi("C"),
        );
    }
    (ret, unsafe { StackPointer::new(ret_sp as *mut usize) })
}

/// Identical to `swap_link`, but without writing the CFA link slot; used for
/// every switch after the first into a given prompt stack.
#[inline(always)]
pub unsafe fn swap(arg: usize, new_sp: StackPointer) -> (usize, StackPointer) {
    let ret: usize;
    let ret_sp: usize;
    unsafe {
        asm!(
            "
            lea rax, [rip + 2f]
            push rax
            push rbp
            push rbx
            mov rsi, rsp
            mov rsp, rdx
            pop rbx
            pop rbp
            pop rax
            jmp rax
            2:
            ",
            inout("rdi") arg => ret,
            out("rsi") ret_sp,
            in("rdx") new_sp.offset(0),
            out("rax") _, out("rcx") _, out("r8") _, out("r9") _,
            out("r10") _, out("r11") _, out("r12") _, out("r13") _, out("r14") _,
            out("r15") _,
            clobber_abi("C"),
        );
    }
    (ret, unsafe { StackPointer::new(ret_sp as *mut usize) })
}

#[repr(C)]
#[derive(Debug)]
pub struct Registers {
    sp: usize,
}

impl Registers {
    pub fn new() -> Registers {
        Registers { sp: 0 }
    }

    pub fn root() -> Registers {
        Self::new()
    }

    #[inline]
    pub fn get_sp(&self) -> StackPointer {
        unsafe { StackPointer::new(self.sp as *mut usize) }
    }

    #[inline]
    pub fn set_sp(&mut self, sp: StackPointer) {
        self.sp = unsafe { mem::transmute::<StackPointer, usize>(sp) };
    }

    #[inline(always)]
    pub fn prefetch(&self) {
        if self.sp == 0 {
            return;
        }
        unsafe { prefetch(self.sp as *const usize) };
    }

    #[inline]
    pub unsafe fn restore_context(&mut self) {}

    pub unsafe fn init_with(&mut self, fptr: InitFn, stack: &Stack) {
        unsafe { initialize_call_frame(self, fptr, stack) };
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_on_zero_sp_is_a_noop() {
        let regs = Registers::new();
        regs.prefetch();
    }
}
