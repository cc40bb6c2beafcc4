//! `mprompt`: multi-prompt delimited control with algebraic effect
//! handlers, built on in-place growable stacks ("gstacks").
//!
//! A gstack ([`gstack`], [`stack`]) is a large, guard-paged region of
//! reserved address space switched into via a per-ABI register-context
//! swap ([`reg_context`], [`detail`]). [`prompt`] delimits a computation
//! on its own gstack; [`handler`] is the thread-local shadow stack of
//! handler frames that [`handler::find`] walks to resolve which prompt an
//! effect targets; [`runtime`] drives the actual yield/resume switches;
//! [`resume`] is the continuation handed to whatever resolves an effect.
//! [`effect`] layers a typed `handle`/`perform` convenience API over all
//! of the above for the common case of one operation closure per handler.
//!
//! Two failure domains, by design (see `DESIGN.md`):
//! - [`ConfigError`] is the only place this crate returns a `Result` —
//!   misconfigured tunables, caught before any gstack is allocated.
//! - Everything else is either ordinary control flow (yield/resume),
//!   `panic!` for programming errors (performing an effect with no
//!   handler installed, a type mismatch across a resume boundary), or
//!   `abort()` for unrecoverable resource exhaustion (gstack allocation
//!   failure).

mod config;
mod detail;
pub mod effect;
mod error;
pub mod gstack;
pub mod handler;
mod prompt;
mod reg_context;
pub mod resume;
mod runtime;
mod stack;
mod transfer;
mod unwind;

pub use config::{Config, ConfigBuilder};
pub use error::ConfigError;
pub use gstack::{Gstack, GstackProvider, NativeGstackProvider};
pub use handler::Kind;
pub use prompt::prompt;
pub use resume::{MultiResume, Resume};
pub use runtime::{mp_prompt, mp_prompt_with};
