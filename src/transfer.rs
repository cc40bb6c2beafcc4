//! Type-erased payloads that cross a gstack boundary.
//!
//! The register-level context switch (`reg_context::RegContext::swap*`)
//! only ever moves a single `usize` in each direction, exactly like the
//! teacher crate's `swap`/`swap_link`. Everything richer is boxed on one
//! side and reconstituted on the other — the same `encode`/`decode` trick
//! the teacher's own comment describes ("usually we use NoDrop and
//! decode_usize/encode_usize to convert data between different stacks"),
//! generalized here to arbitrary `T` via `Box<T>` instead of a bespoke
//! `NoDrop` wrapper.

use std::any::Any;

use crate::handler::HandlerRef;

/// Box `val` and hand back a thin pointer suitable for passing through a
/// register-width argument slot.
pub(crate) fn encode<T>(val: T) -> usize {
    Box::into_raw(Box::new(val)) as usize
}

/// # Safety
/// `ptr` must have been produced by `encode::<T>` and not yet decoded.
pub(crate) unsafe fn decode<T>(ptr: usize) -> T {
    *unsafe { Box::from_raw(ptr as *mut T) }
}

/// What flows across a `swap`/`swap_link` between a prompt stack and
/// whichever stack switched into it.
pub(crate) enum Transfer {
    /// Parent -> fresh prompt stack: run the prompt's body for the first
    /// time. Carries its own `PromptHandle`/args via closure capture.
    Enter(Box<dyn FnOnce()>),
    /// Prompt -> parent: the body raised an effect (`yield_to`/`myield_to`).
    Yield(YieldEnvelope),
    /// Parent -> prompt: wake the suspended body with this value. `tail`
    /// marks a `resume_tail` call; `below` is the shadow-stack top live at
    /// the resumer, which the yielded-to handler reattaches under (and, if
    /// `tail`, is spliced in *in place of* the handler for this extent).
    Resume {
        value: Box<dyn Any>,
        tail: bool,
        below: Option<HandlerRef>,
    },
    /// Prompt -> parent: the body returned normally with this value.
    Return(Box<dyn Any>),
    /// Either direction: an unwind in flight crossed a gstack boundary and
    /// must resume unwinding on the receiving side's native call stack.
    UnwindPropagate(crate::unwind::UnwindSignal),
    /// Parent -> prompt: abandon the suspended continuation. The body's
    /// remaining scopes are torn down by unwinding in place so their
    /// destructors and `FINALLY` frames still run.
    Cancel,
    /// Prompt -> parent: the cancellation above ran to completion; the
    /// gstack is finished and must not be resumed again.
    Cancelled,
}

pub(crate) struct YieldEnvelope {
    pub(crate) hdata: *mut (),
    pub(crate) ytor: Box<dyn FnOnce(crate::resume::Resume, Box<dyn Any>) -> Box<dyn Any>>,
    pub(crate) arg: Box<dyn Any>,
}

pub(crate) fn downcast_or_panic<T: 'static>(boxed: Box<dyn Any>) -> T {
    match boxed.downcast::<T>() {
        Ok(v) => *v,
        Err(_) => panic!("mprompt: value crossed a prompt boundary with the wrong type"),
    }
}
