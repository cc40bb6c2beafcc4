//! A typed convenience layer over `prompt`/`mp_yield`: an effect [`Kind`]
//! paired with a per-handler operation closure stored as the prompt's
//! `hdata`, so that `perform` can find and invoke it without either side
//! needing to agree on a bespoke dispatch convention.
//!
//! This is the layer most call sites are expected to use; `prompt.rs` and
//! `runtime::mp_yield` stay available underneath for callers that want
//! their own operation-dispatch convention instead (mirroring the split
//! between a primitives API and a convenience API in the teacher crate).

use std::any::Any;

use crate::handler::{self, Kind};
use crate::resume::Resume;
use crate::runtime;

type Op = dyn Fn(Resume, Box<dyn Any>) -> Box<dyn Any>;

/// Install a handler for `kind` and run `body(arg)` under it.
///
/// While `body` runs, a matching `perform(kind, arg)` anywhere underneath
/// it calls `op(resume, arg)` here — with `op` running in the dynamic
/// scope `handle` itself was called in, not whatever scope `body` had
/// built on top of it by the time it performed the effect (§4.5).
pub fn handle<A: 'static, R: 'static>(
    kind: Kind,
    op: impl Fn(Resume, Box<dyn Any>) -> Box<dyn Any> + 'static,
    body: impl FnOnce(A) -> R + 'static,
    arg: A,
) -> R {
    let op_box: Box<Op> = Box::new(op);
    let hdata = Box::into_raw(Box::new(op_box)) as *mut ();
    let result = crate::prompt::prompt(kind, hdata, body, arg);
    // SAFETY: `hdata` was produced by the `Box::into_raw` above; nothing
    // still holds a reference to it once `prompt` has returned, since the
    // handler frame it backed has already been popped.
    drop(unsafe { Box::from_raw(hdata as *mut Box<Op>) });
    result
}

/// Raise an effect of kind `kind`, blocking the calling gstack until the
/// installed handler resumes (or drops) the continuation.
///
/// # Panics
/// Panics if no handler for `kind` is in scope, or if the handler resumes
/// with a value of the wrong type.
pub fn perform<A: 'static, B: 'static>(kind: Kind, arg: A) -> B {
    let h = handler::find(kind)
        .unwrap_or_else(|| panic!("mprompt: perform() with no handler installed for this effect"));
    let hdata = handler::data(h);
    let reply = runtime::mp_yield(
        h,
        move |resume, boxed_arg| {
            // SAFETY: `hdata` is the `Box<Box<Op>>` that `handle` installed
            // for the lifetime of this handler frame, which outlives the
            // dynamic extent of this callback.
            let op: &Op = unsafe { &**(hdata as *const Box<Op>) };
            op(resume, boxed_arg)
        },
        Box::new(arg),
    );
    *reply
        .downcast::<B>()
        .unwrap_or_else(|_| panic!("mprompt: handler resumed perform() with the wrong type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn state_effect_get_and_put() {
        let kind = Kind::new();
        let result = handle(
            kind,
            move |resume, arg: Box<dyn Any>| {
                // A minimal "get/put" state effect keyed on a thread-local
                // cell captured by this closure.
                thread_local! { static STATE: RefCell<i32> = const { RefCell::new(0) }; }
                if let Ok(delta) = arg.downcast::<i32>() {
                    STATE.with(|s| *s.borrow_mut() += *delta);
                    let v = STATE.with(|s| *s.borrow());
                    resume.resume(Box::new(v))
                } else {
                    resume.resume(Box::new(0i32))
                }
            },
            move |_: ()| -> i32 {
                let a: i32 = perform(kind, 3);
                let b: i32 = perform(kind, 4);
                a + b
            },
            (),
        );
        assert_eq!(result, 10); // state goes 0 -> 3 -> 7; a=3, b=7
    }

    #[test]
    fn handler_can_end_the_prompt_without_resuming() {
        let kind = Kind::new();
        let result = handle(
            kind,
            move |_resume, _arg: Box<dyn Any>| Box::new(99i32) as Box<dyn Any>,
            move |_: ()| -> i32 {
                let _: i32 = perform(kind, 1);
                unreachable!("handler never resumes, so this never runs");
            },
            (),
        );
        assert_eq!(result, 99);
    }

    #[test]
    #[should_panic(expected = "no handler installed")]
    fn perform_without_a_handler_panics() {
        let kind = Kind::new();
        let _: i32 = perform(kind, 0);
    }
}
