//! The handler shadow stack (§3, §4.1, §4.2, §4.7): a thread-local,
//! singly-linked list of handler frames, the `find` walker, and the
//! `linear_handler`/`under`/`mask`/`finally` scope installers.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::runtime::PromptHandle;

/// A stable identity for a handler family. Equality is pointer identity,
/// not content: two `Kind`s are the same handler family iff they were
/// produced by the same `Kind::new()` call (or are the same `static`).
#[derive(Clone, Copy)]
pub struct Kind(&'static u8);

impl Kind {
    /// Mint a fresh, globally unique kind. The leaked byte is never read;
    /// only its address is used as identity.
    pub fn new() -> Kind {
        Kind(Box::leak(Box::new(0u8)))
    }
}

impl Default for Kind {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Kind {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}
impl Eq for Kind {}

impl std::fmt::Debug for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Kind({:p})", self.0)
    }
}

/// The three reserved built-in kinds. These are process-wide (not
/// per-thread) so that the walker's structural checks are consistent no
/// matter which thread installed a frame — each is lazily minted once and
/// cached.
pub struct BuiltinKind(std::sync::OnceLock<Kind>);
impl BuiltinKind {
    const fn new() -> Self {
        BuiltinKind(std::sync::OnceLock::new())
    }
}
impl std::ops::Deref for BuiltinKind {
    type Target = Kind;
    fn deref(&self) -> &Kind {
        self.0.get_or_init(Kind::new)
    }
}

pub static FINALLY: BuiltinKind = BuiltinKind::new();
pub static UNDER: BuiltinKind = BuiltinKind::new();
pub static MASK: BuiltinKind = BuiltinKind::new();

/// A unique, comparable id for a single handler-frame installation, used
/// by the unwind protocol to recognize "this is the frame we're unwinding
/// to" without holding onto the (possibly stack-local, possibly dangling
/// after pop) `HandlerRef` itself.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HandlerId(usize);

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
fn next_id() -> HandlerId {
    HandlerId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Mint a `HandlerId` before the frame that will carry it exists, so the
/// owning `Prompt` can know its own id before its handler frame is pushed.
pub(crate) fn alloc_id() -> HandlerId {
    next_id()
}

enum FrameExtra {
    None,
    Under(Kind),
    Mask { mask: Kind, from: usize },
}

pub(crate) struct HandlerNode {
    id: HandlerId,
    parent: Cell<Option<NonNull<HandlerNode>>>,
    prompt: Option<PromptHandle>,
    kind: Kind,
    hdata: *mut (),
    extra: FrameExtra,
}

std::thread_local! {
    static TOP: Cell<Option<NonNull<HandlerNode>>> = const { Cell::new(None) };
}

pub(crate) fn current_top() -> Option<NonNull<HandlerNode>> {
    TOP.with(|t| t.get())
}

pub(crate) fn set_top(top: Option<NonNull<HandlerNode>>) {
    TOP.with(|t| t.set(top));
}

/// A reference to a live handler frame. Only valid for the dynamic extent
/// in which the frame is installed (enforced by construction: the only
/// way to obtain one is `top()`/`find()`/`parent()`, which all read the
/// live shadow stack).
#[derive(Clone, Copy)]
pub struct HandlerRef(NonNull<HandlerNode>);

impl HandlerRef {
    fn node(&self) -> &HandlerNode {
        unsafe { self.0.as_ref() }
    }

    pub(crate) fn parent_ptr(&self) -> Option<NonNull<HandlerNode>> {
        self.node().parent.get()
    }

    pub(crate) fn set_parent_ptr(&self, parent: Option<NonNull<HandlerNode>>) {
        self.node().parent.set(parent);
    }

    pub(crate) fn prompt(&self) -> Option<PromptHandle> {
        self.node().prompt
    }

    pub(crate) fn id(&self) -> HandlerId {
        self.node().id
    }
}

pub fn top() -> Option<HandlerRef> {
    current_top().map(HandlerRef)
}

/// Reattach `h` below `below` (the live top at the moment its continuation
/// is resumed, per §4.5 step 4 — `h`'s own scope may have grown new
/// handlers while its operation clause ran) and, for a tail resumption,
/// splice `h` itself out of the chain reachable from `from_top` so the
/// resumed extent does not see it again through `find` until it is
/// reinstalled.
///
/// Returns the top the resumed body should run under. `from_top` is the
/// shadow-stack top captured at the yield site; it may equal `h` itself
/// (no frames were pushed between the handler's installation and the
/// effect that reached it) or some descendant of `h` (the body's own
/// nested installs, e.g. `FINALLY` frames, sitting above it) — either way
/// those frames are untouched except for the single link that used to
/// point at `h`.
pub(crate) fn reattach_for_resume(
    h: HandlerRef,
    from_top: Option<NonNull<HandlerNode>>,
    below: Option<HandlerRef>,
    tail: bool,
) -> Option<NonNull<HandlerNode>> {
    let below_ptr = below.map(|r| r.0);
    h.set_parent_ptr(below_ptr);
    if !tail {
        return from_top;
    }
    if from_top == Some(h.0) {
        return below_ptr;
    }
    let mut cur = from_top;
    while let Some(ptr) = cur {
        let node = unsafe { ptr.as_ref() };
        if node.parent.get() == Some(h.0) {
            node.parent.set(below_ptr);
            return from_top;
        }
        cur = node.parent.get();
    }
    from_top
}

pub fn parent(h: Option<HandlerRef>) -> Option<HandlerRef> {
    match h {
        None => top(),
        Some(h) => h.parent_ptr().map(HandlerRef),
    }
}

pub fn kind(h: HandlerRef) -> Kind {
    h.node().kind
}

pub fn data(h: HandlerRef) -> *mut () {
    h.node().hdata
}

pub fn id(h: HandlerRef) -> HandlerId {
    h.id()
}

/// RAII guard that pushes a frame on construction and pops it on every
/// exit path, including an in-flight panic (§4.2's exit-safety
/// requirement).
struct HandlerGuard {
    previous: Option<NonNull<HandlerNode>>,
}

impl HandlerGuard {
    fn push(node: NonNull<HandlerNode>) -> Self {
        let previous = TOP.with(|t| t.replace(Some(node)));
        HandlerGuard { previous }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        TOP.with(|t| t.set(self.previous));
    }
}

fn install<R>(
    kind: Kind,
    prompt: Option<PromptHandle>,
    hdata: *mut (),
    extra: FrameExtra,
    body: impl FnOnce() -> R,
) -> R {
    let mut node = HandlerNode {
        id: next_id(),
        parent: Cell::new(current_top()),
        prompt,
        kind,
        hdata,
        extra,
    };
    let ptr = unsafe { NonNull::new_unchecked(&mut node as *mut HandlerNode) };
    let _guard = HandlerGuard::push(ptr);
    body()
}

/// Push a linear handler frame (no prompt) for the dynamic extent of
/// `fun(hdata, arg)`.
pub fn linear_handler<R>(kind: Kind, hdata: *mut (), fun: impl FnOnce(*mut (), usize) -> R, arg: usize) -> R {
    install(kind, None, hdata, FrameExtra::None, || fun(hdata, arg))
}

/// Install a prompt-handler frame under a pre-allocated `id` (see
/// `alloc_id`). Used internally by `runtime::mp_prompt`; not exposed
/// directly since creating the `Prompt` itself is the runtime's job.
pub(crate) fn install_prompt_handler<R>(
    id: HandlerId,
    kind: Kind,
    prompt: PromptHandle,
    hdata: *mut (),
    body: impl FnOnce() -> R,
) -> R {
    let mut node = HandlerNode {
        id,
        parent: Cell::new(current_top()),
        prompt: Some(prompt),
        kind,
        hdata,
        extra: FrameExtra::None,
    };
    let ptr = unsafe { NonNull::new_unchecked(&mut node as *mut HandlerNode) };
    let _guard = HandlerGuard::push(ptr);
    body()
}

/// §4.7: hide the handler that `under_kind` targets so a tail-resumptive
/// call doesn't re-enter it.
pub fn under<R>(under_kind: Kind, fun: impl FnOnce(usize) -> R, arg: usize) -> R {
    install(*UNDER, None, std::ptr::null_mut(), FrameExtra::Under(under_kind), || fun(arg))
}

/// §4.7: hide the innermost `from + 1` handlers of `mask_kind`.
pub fn mask<R>(mask_kind: Kind, from: usize, fun: impl FnOnce(usize) -> R, arg: usize) -> R {
    install(
        *MASK,
        None,
        std::ptr::null_mut(),
        FrameExtra::Mask { mask: mask_kind, from },
        || fun(arg),
    )
}

/// Register `f` to run, at most once, if the current scope is torn down
/// by an unwind (not on ordinary return). See the design doc's resolution
/// of the `FINALLY` open question.
pub fn finally<R>(f: impl FnOnce() + 'static, body: impl FnOnce() -> R) -> R {
    let slot: Box<Option<Box<dyn FnOnce()>>> = Box::new(Some(Box::new(f)));
    let hdata = Box::into_raw(slot) as *mut ();
    let result = install(*FINALLY, None, hdata, FrameExtra::None, body);
    // Normal exit: the closure was never fired by the unwind walker;
    // reclaim it without running it.
    let slot = unsafe { Box::from_raw(hdata as *mut Option<Box<dyn FnOnce()>>) };
    drop(slot);
    result
}

/// §4.1: the innermost visible handler of `kind`, honoring `under`/`mask`.
///
/// Built-in kinds are structural only; searching for one is a programming
/// error.
pub fn find(kind: Kind) -> Option<HandlerRef> {
    assert!(
        kind != *FINALLY && kind != *UNDER && kind != *MASK,
        "mprompt: find() does not support built-in kinds"
    );
    let mut cur = current_top();
    let mut mask_level: usize = 0;
    loop {
        let ptr = cur?;
        let node = unsafe { ptr.as_ref() };
        if node.kind == kind {
            if mask_level == 0 {
                return Some(HandlerRef(ptr));
            }
            mask_level -= 1;
            cur = node.parent.get();
            continue;
        }
        match &node.extra {
            FrameExtra::Under(u) => {
                let mut walk = node.parent.get();
                let mut found = None;
                while let Some(wp) = walk {
                    let wn = unsafe { wp.as_ref() };
                    if wn.kind == *u {
                        found = Some(wn.parent.get());
                        break;
                    }
                    walk = wn.parent.get();
                }
                cur = found?;
                continue;
            }
            FrameExtra::Mask { mask, from } if *mask == kind && *from <= mask_level => {
                mask_level += 1;
                cur = node.parent.get();
                continue;
            }
            _ => {
                cur = node.parent.get();
                continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_sees_innermost_matching_kind() {
        let k = Kind::new();
        linear_handler(k, std::ptr::null_mut(), |_, _| {
            let h1 = find(k).unwrap();
            linear_handler(k, std::ptr::null_mut(), |_, _| {
                let h2 = find(k).unwrap();
                assert!(!std::ptr::eq(h1.0.as_ptr(), h2.0.as_ptr()));
                assert_eq!(parent(Some(h2)).map(|p| p.id()), Some(h1.id()));
            }, 0);
            // back to just h1 visible
            assert_eq!(find(k).unwrap().id(), h1.id());
        }, 0);
        assert!(find(k).is_none());
    }

    #[test]
    fn under_hides_the_targeted_handler() {
        let k = Kind::new();
        linear_handler(k, std::ptr::null_mut(), |_, _| {
            let outer = top();
            linear_handler(k, std::ptr::null_mut(), |_, _| {
                let seen = under(k, |_| find(k), 0);
                assert_eq!(seen.map(|h| h.id()), outer.map(|h| h.id()));
            }, 0);
        }, 0);
    }

    #[test]
    fn mask_hides_n_innermost_handlers() {
        let k = Kind::new();
        linear_handler(k, std::ptr::null_mut(), |_, _| {
            let outer = top();
            linear_handler(k, std::ptr::null_mut(), |_, _| {
                let seen = mask(k, 0, |_| find(k), 0);
                assert_eq!(seen.map(|h| h.id()), outer.map(|h| h.id()));
            }, 0);
        }, 0);
    }

    #[test]
    fn shadow_stack_is_restored_after_panic() {
        let k = Kind::new();
        let before = top().map(|h| h.id());
        let result = std::panic::catch_unwind(|| {
            linear_handler(k, std::ptr::null_mut(), |_, _| {
                panic!("boom");
            }, 0)
        });
        assert!(result.is_err());
        assert_eq!(top().map(|h| h.id()), before);
    }
}
