//! The `prompt` combinator (§4.3): install a fresh handler/delimiter frame
//! and run `body` under it on its own gstack.

use crate::handler::Kind;
use crate::runtime;

/// Delimit `body`'s effects of kind `kind`.
///
/// `hdata` is opaque to this layer — it is whatever the caller's handler
/// convention expects to find via [`crate::handler::data`] once `body`
/// performs an effect against `kind`. Most callers should prefer
/// [`crate::effect::handle`], which manages `hdata` for you; `prompt` is
/// the primitive underneath it, for callers that want their own operation
/// dispatch convention.
pub fn prompt<A: 'static, R: 'static>(
    kind: Kind,
    hdata: *mut (),
    body: impl FnOnce(A) -> R + 'static,
    arg: A,
) -> R {
    runtime::mp_prompt(kind, hdata, body, arg)
}
