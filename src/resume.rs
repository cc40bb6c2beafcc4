//! The continuation handed to an effect handler: a handle back into the
//! suspended prompt body, usable exactly once (`resume`/`resume_tail`),
//! explicitly discarded (`resume_drop`), or frozen for repeated use
//! (`into_multi`).
//!
//! Multi-shot resumption (§4.5's "handlers may resume zero, one, or many
//! times") is built on a whole-gstack byte snapshot rather than pointer
//! fixup: nothing here resumes two shots concurrently, so restoring the
//! exact suspended bytes into the same physical gstack before each shot is
//! always safe.
//!
//! A `Resume` that is simply dropped without being used behaves like an
//! explicit `resume_drop`: the handler declining to resume at all (an
//! exception effect that never calls `resume`, for instance) must still
//! unwind the abandoned continuation so its destructors and `FINALLY`
//! frames run, and RAII is how that happens without every caller having to
//! remember to ask for it.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use crate::handler;
use crate::reg_context::RegContext;
use crate::runtime::{self, PromptHandle};
use crate::transfer::{self, Transfer};

/// A suspended prompt body, reachable from the effect handler that caused
/// it to yield.
pub struct Resume {
    handle: PromptHandle,
    finalized: Cell<bool>,
}

impl Resume {
    pub(crate) fn new(handle: PromptHandle) -> Resume {
        Resume {
            handle,
            finalized: Cell::new(false),
        }
    }

    /// Wake the suspended body with `value`, running it until it next
    /// yields, returns, or unwinds. The returned box holds whatever the
    /// eventual outcome produced, still erased — `prompt::prompt` performs
    /// the final downcast to the prompt's result type.
    ///
    /// The handler this continuation yielded to is reattached below
    /// whatever is live at the call site right now, not frozen to however
    /// things looked at the original yield (§4.5 step 4) — a handler that
    /// installs more handlers before resuming makes them visible to the
    /// resumed body too.
    pub fn resume(self, value: Box<dyn Any>) -> Box<dyn Any> {
        self.do_resume(value, false)
    }

    /// Like `resume`, for the case where the handler performs no further
    /// work of its own afterward (a tail call back into the body).
    ///
    /// Splices the yielded-to handler out of the resumed body's shadow
    /// stack for this extent: a `perform` of the same kind reached before
    /// the body's next yield or return resolves to the next enclosing
    /// handler of that kind instead of re-entering this one. This is what
    /// lets an operation clause tail-call back into the body without
    /// looping on its own effect.
    pub fn resume_tail(self, value: Box<dyn Any>) -> Box<dyn Any> {
        self.do_resume(value, true)
    }

    fn do_resume(self, value: Box<dyn Any>, tail: bool) -> Box<dyn Any> {
        self.finalized.set(true);
        let handle = self.handle;
        let below = handler::top();
        let word = transfer::encode(Transfer::Resume { value, tail, below });
        let ret = RegContext::swap_link(handle.ctx_mut(), handle.base(), word);
        let transfer = unsafe { transfer::decode(ret) };
        runtime::dispatch_erased(handle, transfer)
    }

    /// Abandon the continuation without resuming it. The body's remaining
    /// scopes are unwound in place — `Drop` impls and `FINALLY` frames
    /// between the yield point and the prompt run exactly as if the body
    /// had panicked there.
    ///
    /// Equivalent to simply dropping the `Resume`; spelled out for callers
    /// that want the abandonment to read as deliberate.
    ///
    /// The handler that calls this still owes `prompt::prompt` a result of
    /// its own (there is none to recover from the abandoned body); compute
    /// and return it after this call returns.
    pub fn resume_drop(self) {
        self.cancel();
    }

    /// Whether this prompt is already being torn down by an in-flight
    /// unwind from an outer scope. A handler can check this to skip
    /// optional cleanup work that the unwind will perform anyway.
    pub fn resume_should_unwind(&self) -> bool {
        self.handle.is_unwinding()
    }

    /// Freeze this suspension point so it can be resumed more than once.
    ///
    /// Captures a byte-for-byte copy of the gstack's committed memory plus
    /// the saved stack pointer right now, before anything resumes it. Each
    /// [`MultiResume::resume`] call restores that copy into the (single,
    /// reused) physical gstack before switching in, so every shot sees the
    /// same pristine suspended state.
    pub fn into_multi(self) -> MultiResume {
        self.finalized.set(true);
        let snapshot = Rc::new(Snapshot::capture(self.handle));
        MultiResume {
            handle: self.handle,
            snapshot,
        }
    }

    fn cancel(&self) {
        self.finalized.set(true);
        let word = transfer::encode(Transfer::Cancel);
        let ret = RegContext::swap_link(self.handle.ctx_mut(), self.handle.base(), word);
        let transfer: Transfer = unsafe { transfer::decode(ret) };
        debug_assert!(
            matches!(transfer, Transfer::Cancelled),
            "mprompt: a dropped continuation must report Cancelled exactly once"
        );
    }
}

impl Drop for Resume {
    fn drop(&mut self) {
        if !self.finalized.get() {
            self.cancel();
        }
    }
}

struct Snapshot {
    bytes: Vec<u8>,
    sp: usize,
}

impl Snapshot {
    fn capture(handle: PromptHandle) -> Snapshot {
        let (base, len) = handle.stack_region();
        // SAFETY: `base..base+len` is this prompt's own committed gstack
        // region, live for the prompt's whole lifetime.
        let bytes = unsafe { std::slice::from_raw_parts(base, len) }.to_vec();
        Snapshot {
            bytes,
            sp: handle.sp_word(),
        }
    }

    fn restore(&self, handle: PromptHandle) {
        let (base, len) = handle.stack_region();
        debug_assert_eq!(len, self.bytes.len(), "mprompt: gstack size changed between snapshots");
        unsafe { std::ptr::copy_nonoverlapping(self.bytes.as_ptr(), base, self.bytes.len()) };
        handle.set_sp_word(self.sp);
    }
}

/// A resumable-more-than-once continuation produced by [`Resume::into_multi`].
///
/// Cloning shares the same captured snapshot; every clone resumes from the
/// same pristine suspension point.
#[derive(Clone)]
pub struct MultiResume {
    handle: PromptHandle,
    snapshot: Rc<Snapshot>,
}

impl MultiResume {
    pub fn resume(&self, value: Box<dyn Any>) -> Box<dyn Any> {
        self.snapshot.restore(self.handle);
        Resume::new(self.handle).resume(value)
    }

    pub fn resume_tail(&self, value: Box<dyn Any>) -> Box<dyn Any> {
        self.snapshot.restore(self.handle);
        Resume::new(self.handle).resume_tail(value)
    }
}
