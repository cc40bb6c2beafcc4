//! The unwind protocol (§4.6): tearing down every scope between a yield
//! point and a target handler, crossing gstack boundaries if necessary,
//! and finally invoking the target's unwind function while its `hdata` is
//! still live.
//!
//! This crate picks the "exception-based" strategy the design doc
//! describes: Rust's own panic mechanism already gives destructor-safe
//! frame cleanup within a single native call stack. A manual gstack
//! boundary can't be walked by the native unwinder, so crossing one is
//! done explicitly: the receiving side's `drive` loop (`runtime.rs`) calls
//! [`std::panic::resume_unwind`] itself, which restarts native unwinding on
//! its own stack. `FINALLY` frames are additionally walked and fired
//! explicitly (see `fire_finally_frames`) since they are not tied to any
//! `Drop` impl.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use crate::handler::{self, HandlerId, HandlerRef};

/// The sentinel thrown by `panic_any` to drive an unwind to a specific
/// handler. Caught only at the `prompt_handler` matching `target`;
/// anywhere else it must be rethrown with `resume_unwind`.
pub struct UnwindSignal {
    pub(crate) target: HandlerId,
    pub(crate) fun: Box<dyn FnOnce(*mut ()) -> Box<dyn Any>>,
    pub(crate) arg: Box<dyn Any>,
}

// Single-threaded cooperative model: an `UnwindSignal` never actually
// crosses an OS thread boundary, only a gstack boundary on the same
// thread. `panic_any` requires `Send` regardless.
unsafe impl Send for UnwindSignal {}

/// Run every `FINALLY` frame between the current shadow-stack top and
/// `target` (exclusive), in LIFO order, then initiate the panic that
/// performs the rest of the unwind (popping ordinary linear/prompt frames
/// via their `Drop` impls as native unwinding proceeds).
///
/// Never returns: either the panic is caught at `target`'s `prompt_handler`
/// (same gstack) or propagates out of the current gstack's trampoline,
/// where `runtime::drive` relays it across the boundary.
pub(crate) fn unwind_to(target: HandlerId, fun: Box<dyn FnOnce(*mut ()) -> Box<dyn Any>>, arg: Box<dyn Any>) -> ! {
    fire_finally_frames(target);
    std::panic::panic_any(UnwindSignal { target, fun, arg });
}

fn fire_finally_frames(target: HandlerId) {
    let mut cur = handler::top();
    while let Some(h) = cur {
        if handler::id(h) == target {
            break;
        }
        if handler::kind(h) == *handler::FINALLY {
            run_finally(h);
        }
        cur = handler::parent(Some(h));
    }
}

fn run_finally(h: HandlerRef) {
    let slot = handler::data(h) as *mut Option<Box<dyn FnOnce()>>;
    // SAFETY: `finally()` always installs this exact layout for FINALLY hdata.
    let taken = unsafe { (*slot).take() };
    if let Some(f) = taken {
        f();
    }
}

/// Catch any `UnwindSignal`, run the target's unwind function if it names
/// `target`, and rethrow (for the caller to relay across a boundary)
/// otherwise.
///
/// Returns `Ok(value)` for a normal return from `body` (already boxed by
/// the caller, or produced by `signal.fun` when `target` matches), and
/// `Err(signal)` when an unwind that does not target this handler must be
/// relayed to the parent stack. Downcasting the `Ok` payload to a concrete
/// type is the caller's job; this layer never needs to name it.
pub(crate) fn catch_for_handler(
    target: HandlerId,
    hdata: *mut (),
    body: impl FnOnce() -> Box<dyn Any>,
) -> Result<Box<dyn Any>, UnwindSignal> {
    match std::panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(v) => Ok(v),
        Err(payload) => match payload.downcast::<UnwindSignal>() {
            Ok(signal) if signal.target == target => Ok((signal.fun)(hdata)),
            Ok(signal) => Err(*signal),
            Err(other) => std::panic::resume_unwind(other),
        },
    }
}
