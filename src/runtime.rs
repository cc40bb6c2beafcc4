//! The prompt runtime: allocates a gstack per `prompt()` call, drives the
//! register-context switches that cross into and out of it, and turns
//! effect invocations (`mp_yield`) into calls on whichever handler
//! [`crate::handler::find`] turns up.
//!
//! This is the layer the teacher's own `Generator`/driver loop corresponds
//! to, generalized from "one resumable iterator" to "a handler-addressed,
//! possibly-multi-shot, possibly-unwinding continuation".

use std::any::Any;
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::config::Config;
use crate::gstack::{Gstack, GstackProvider, NativeGstackProvider};
use crate::handler::{self, HandlerId, HandlerRef, Kind};
use crate::reg_context::RegContext;
use crate::resume::Resume;
use crate::stack::StackPointer;
use crate::transfer::{self, Transfer, YieldEnvelope};
use crate::unwind;

std::thread_local! {
    static DEFAULT_PROVIDER: Rc<NativeGstackProvider> =
        Rc::new(NativeGstackProvider::new(Config::default()));
}

struct Prompt {
    ctx: RegContext,
    gstack: Gstack,
    provider: Rc<dyn GstackProvider>,
    handler_id: HandlerId,
    unwinding: Cell<bool>,
}

/// A lightweight, `Copy` reference to a live prompt. Valid for the dynamic
/// extent of the `prompt()` call that created it; every accessor dereferences
/// a heap allocation owned by that call, freed when it returns.
#[derive(Clone, Copy)]
pub struct PromptHandle(NonNull<Prompt>);

impl PromptHandle {
    fn prompt(&self) -> &Prompt {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn ctx_mut(&self) -> &mut RegContext {
        unsafe { &mut (*self.0.as_ptr()).ctx }
    }

    pub(crate) fn base(&self) -> *mut usize {
        self.prompt().gstack.end()
    }

    pub(crate) fn handler_id(&self) -> HandlerId {
        self.prompt().handler_id
    }

    pub(crate) fn is_unwinding(&self) -> bool {
        self.prompt().unwinding.get()
    }

    /// The live, committed extent of this prompt's gstack, for multi-shot
    /// snapshot/restore. Stable for the prompt's whole lifetime (§6.1).
    pub(crate) fn stack_region(&self) -> (*mut u8, usize) {
        let stack = &self.prompt().gstack.stack;
        (stack.base(), stack.len())
    }

    pub(crate) fn sp_word(&self) -> usize {
        self.prompt().ctx.raw_sp()
    }

    pub(crate) fn set_sp_word(&self, sp: usize) {
        unsafe { (*self.0.as_ptr()).ctx.set_raw_sp(sp) };
    }

    fn mark_unwinding(&self) {
        self.prompt().unwinding.set(true);
    }
}

/// Marks a `Cancel` round-trip (`Resume::resume_drop`) apart from a real
/// exception-carrying unwind to the same target, without requiring
/// `runtime.rs` to know anything about handler-specific exception types.
struct CancelMarker;

/// Install `kind`/`hdata` as a prompt handler and run `body(arg)` under it
/// on a freshly allocated gstack, per §4.3.
///
/// Returns the body's result on an ordinary return, the value an effect
/// handler chose not to resume past (delivered via `Resume::resume`'s
/// eventual non-resuming branch), or propagates an unwind that targets an
/// outer handler.
pub fn mp_prompt<A: 'static, R: 'static>(
    kind: Kind,
    hdata: *mut (),
    body: impl FnOnce(A) -> R + 'static,
    arg: A,
) -> R {
    let provider = DEFAULT_PROVIDER.with(Rc::clone);
    mp_prompt_with(provider, kind, hdata, body, arg)
}

/// Like `mp_prompt`, but allocating the gstack from a caller-supplied
/// provider instead of the default thread-local cache.
pub fn mp_prompt_with<A: 'static, R: 'static>(
    provider: Rc<dyn GstackProvider>,
    kind: Kind,
    hdata: *mut (),
    body: impl FnOnce(A) -> R + 'static,
    arg: A,
) -> R {
    let size = provider.default_size();
    let gstack = provider.alloc(size);
    let id = handler::alloc_id();

    let prompt = Box::new(Prompt {
        ctx: RegContext::empty(),
        gstack,
        provider,
        handler_id: id,
        unwinding: Cell::new(false),
    });
    let handle = PromptHandle(unsafe { NonNull::new_unchecked(Box::into_raw(prompt)) });

    // SAFETY: `ctx` and `gstack` are disjoint fields of the same
    // allocation; nothing else touches either before `install_prompt_handler`
    // below pushes the frame that makes `handle` reachable to other code.
    unsafe {
        let stack = &(*handle.0.as_ptr()).gstack.stack;
        (*handle.0.as_ptr()).ctx.init_with(prompt_trampoline, stack);
    }

    struct Finish(PromptHandle);
    impl Drop for Finish {
        fn drop(&mut self) {
            free_prompt(self.0);
        }
    }
    let _finish = Finish(handle);

    let boxed = handler::install_prompt_handler(id, kind, handle, hdata, move || {
        enter(handle, hdata, body, arg)
    });
    transfer::downcast_or_panic::<R>(boxed)
}

/// Runs on the parent side: perform the first switch into a freshly
/// initialized gstack and dispatch whatever comes back.
fn enter<A: 'static, R: 'static>(
    handle: PromptHandle,
    hdata: *mut (),
    body: impl FnOnce(A) -> R + 'static,
    arg: A,
) -> Box<dyn Any> {
    let target = handle.handler_id();
    let run_body: Box<dyn FnOnce()> = Box::new(move || {
        let outcome = unwind::catch_for_handler(target, hdata, move || -> Box<dyn Any> {
            Box::new(body(arg))
        });
        let transfer = match outcome {
            Ok(v) if v.is::<CancelMarker>() => Transfer::Cancelled,
            Ok(v) => Transfer::Return(v),
            Err(signal) => Transfer::UnwindPropagate(signal),
        };
        finish_gstack_turn(handle, transfer);
    });
    let word = transfer::encode(Transfer::Enter(run_body));
    let ret = RegContext::swap_link(handle.ctx_mut(), handle.base(), word);
    let transfer = unsafe { transfer::decode(ret) };
    dispatch_erased(handle, transfer)
}

/// The first code to run on a freshly allocated gstack (`RegContext`'s
/// `InitFn`); immediately unpacks and invokes the `Transfer::Enter` closure
/// handed to it by the initial `swap_link`.
unsafe fn prompt_trampoline(arg: usize, _sp: StackPointer) {
    let transfer: Transfer = unsafe { transfer::decode(arg) };
    match transfer {
        Transfer::Enter(f) => f(),
        _ => unreachable!("a gstack's first wakeup must be Transfer::Enter"),
    }
}

/// Runs on the gstack side: hand `transfer` back to whoever swapped us in.
/// Diverges — a gstack that has produced `Return`/`Cancelled`/
/// `UnwindPropagate` is finished and must never be resumed again.
fn finish_gstack_turn(handle: PromptHandle, transfer: Transfer) -> ! {
    let word = transfer::encode(transfer);
    RegContext::swap(handle.ctx_mut(), word);
    unreachable!("mprompt: a finished prompt gstack was resumed");
}

/// Dispatch a `Transfer` received from a gstack. Shared by the initial
/// entry and every subsequent `Resume::resume`.
pub(crate) fn dispatch_erased(handle: PromptHandle, transfer: Transfer) -> Box<dyn Any> {
    match transfer {
        Transfer::Return(v) => v,
        Transfer::Cancelled => Box::new(()),
        Transfer::Yield(env) => {
            let YieldEnvelope { ytor, arg, .. } = env;
            ytor(Resume::new(handle), arg)
        }
        Transfer::UnwindPropagate(signal) => {
            handle.mark_unwinding();
            std::panic::panic_any(signal)
        }
        Transfer::Enter(_) | Transfer::Resume { .. } | Transfer::Cancel => {
            unreachable!("not a valid reply to the parent side")
        }
    }
}

/// Raise an effect at handler `h`: switch out of the current gstack back
/// to whoever is driving it, handing over `arg` and the handler-supplied
/// continuation builder `ytor`, and block until `Resume::resume` (or
/// `resume_drop`) wakes this call back up.
///
/// Per §4.5: `h` and everything pushed above it are hidden from `find()`
/// while the handler for this effect runs (the handler runs with the
/// dynamic scope `h` itself was installed under, not the scope the body
/// had built on top of it), and restored verbatim when the body resumes.
pub(crate) fn mp_yield(
    h: HandlerRef,
    ytor: impl FnOnce(Resume, Box<dyn Any>) -> Box<dyn Any> + 'static,
    arg: Box<dyn Any>,
) -> Box<dyn Any> {
    let handle = h.prompt().expect("mprompt: yield_to targets a handler with no prompt");
    let saved_top = handler::current_top();
    handler::set_top(h.parent_ptr());

    let envelope = YieldEnvelope {
        hdata: handler::data(h),
        ytor: Box::new(ytor),
        arg,
    };
    let word = transfer::encode(Transfer::Yield(envelope));
    let ret = RegContext::swap(handle.ctx_mut(), word);
    let transfer: Transfer = unsafe { transfer::decode(ret) };

    match transfer {
        Transfer::Resume { value, tail, below } => {
            let new_top = handler::reattach_for_resume(h, saved_top, below, tail);
            handler::set_top(new_top);
            value
        }
        Transfer::Cancel => {
            handler::set_top(saved_top);
            let target = handle.handler_id();
            handle.mark_unwinding();
            unwind::unwind_to(
                target,
                Box::new(|_hdata: *mut ()| Box::new(CancelMarker) as Box<dyn Any>),
                Box::new(CancelMarker),
            )
        }
        _ => unreachable!("mp_yield may only be woken by Resume or Cancel"),
    }
}

fn free_prompt(handle: PromptHandle) {
    let prompt = unsafe { Box::from_raw(handle.0.as_ptr()) };
    prompt.provider.free(prompt.gstack);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler;

    #[test]
    fn prompt_without_any_effect_returns_body_value() {
        let kind = Kind::new();
        let result = mp_prompt(kind, std::ptr::null_mut(), |n: i32| n * 2, 21);
        assert_eq!(result, 42);
    }

    #[test]
    fn yield_and_resume_round_trip_a_value() {
        let kind = Kind::new();
        let result: i32 = mp_prompt(
            kind,
            std::ptr::null_mut(),
            move |_: ()| {
                let h = handler::find(kind).unwrap();
                let reply = mp_yield(
                    h,
                    |resume, arg: Box<dyn Any>| {
                        let n = *arg.downcast::<i32>().unwrap();
                        resume.resume(Box::new(n + 1))
                    },
                    Box::new(10i32),
                );
                *reply.downcast::<i32>().unwrap()
            },
            (),
        );
        assert_eq!(result, 11);
    }
}
