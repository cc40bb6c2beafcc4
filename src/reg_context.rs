use crate::detail::{self, Registers};
use crate::stack::{Stack, StackPointer};

/// Holds the registers of a suspended context. The only register that
/// matters across platforms is the stack pointer; everything else is
/// restored from the stack itself by the per-ABI trampoline.
#[derive(Debug)]
pub struct RegContext {
    regs: Registers,
}

/// The entry point of a freshly initialized stack: the first argument is
/// whatever was passed to the first `swap`/`swap_link` into it, the second
/// is the stack pointer the trampoline observed on entry.
pub type InitFn = unsafe fn(usize, StackPointer);

impl RegContext {
    /// Context representing the thread's own (non-gstack) stack.
    pub fn root() -> RegContext {
        RegContext {
            regs: Registers::root(),
        }
    }

    /// Uninitialized context for a gstack that hasn't been entered yet.
    pub fn empty() -> RegContext {
        RegContext {
            regs: Registers::new(),
        }
    }

    #[inline]
    pub fn set_sp(&mut self, sp: StackPointer) {
        self.regs.set_sp(sp)
    }

    #[inline]
    pub fn prefetch(&self) {
        self.regs.prefetch();
    }

    /// The raw stack-pointer word this context will resume from. Used only
    /// by multi-shot resumption to save/restore a suspension point.
    #[inline]
    pub(crate) fn raw_sp(&self) -> usize {
        self.regs.get_sp().offset(0) as usize
    }

    #[inline]
    pub(crate) fn set_raw_sp(&mut self, sp: usize) {
        self.regs.set_sp(unsafe { StackPointer::new(sp as *mut usize) });
    }

    /// Lay out the initial call frame on `stack` so that switching into it
    /// for the first time invokes `init(arg, sp)`.
    #[inline]
    pub fn init_with(&mut self, init: InitFn, stack: &Stack) {
        unsafe { self.regs.init_with(init, stack) };
    }

    #[inline]
    fn restore_context(&mut self) {
        unsafe { self.regs.restore_context() };
    }

    /// Switch execution to `dst`, passing `arg` across. Returns once `dst`
    /// switches back, with the value it passed.
    #[inline]
    pub fn swap(dst: &mut RegContext, arg: usize) -> usize {
        dst.restore_context();
        let sp = dst.regs.get_sp();
        let (ret, sp) = unsafe { detail::swap(arg, sp) };
        dst.regs.set_sp(sp);
        ret
    }

    /// Like `swap`, but links the new stack's unwind-CFA slot to `base` so a
    /// native unwinder can walk across the stack boundary.
    #[inline]
    pub fn swap_link(dst: &mut RegContext, base: *mut usize, arg: usize) -> usize {
        dst.restore_context();
        let sp = dst.regs.get_sp();
        eprintln!("DBG swap_link enter: sp={:p} base={:p} arg={}", sp.offset(0), base, arg);
        let (ret, sp) = unsafe { detail::swap_link(arg, sp, base) };
        eprintln!("DBG swap_link exit: ret={} new_sp={:p}", ret, sp.offset(0));
        dst.regs.set_sp(sp);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::transmute;

    const MIN_STACK: usize = 2 * 1024 * 1024;

    fn init_fn(env: usize, sp: StackPointer) {
        let func: fn(StackPointer) = unsafe { transmute(env) };
        func(sp);
    }

    #[test]
    fn test_swap_context() {
        fn callback(sp: StackPointer) {
            eprintln!("DBG callback entered");
            let mut dst = RegContext::root();
            let mut out = 42;
            loop {
                dst.regs.set_sp(sp);
                eprintln!("DBG calling swap out={}", out);
                let para = RegContext::swap(&mut dst, out);
                eprintln!("DBG swap returned para={}", para);
                if para == 0 {
                    eprintln!("DBG returning from callback");
                    return;
                }
                out += 1;
                assert_eq!(para, out);
            }
        }

        let stk = Stack::new(MIN_STACK, crate::stack::page_size());
        let mut ctx = RegContext::empty();
        ctx.init_with(init_fn, &stk);

        let ret = RegContext::swap_link(&mut ctx, stk.end(), callback as usize);
        assert_eq!(ret, 42);
        let ret = RegContext::swap_link(&mut ctx, stk.end(), ret + 1);
        assert_eq!(ret, 43);
        let ret = RegContext::swap_link(&mut ctx, stk.end(), ret + 1);
        assert_eq!(ret, 44);
        RegContext::swap_link(&mut ctx, stk.end(), 0);
        let sp = unsafe { ctx.regs.get_sp().offset(0) as usize };
        assert_eq!(sp, 0);
    }
}
