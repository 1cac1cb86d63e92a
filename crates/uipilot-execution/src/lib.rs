//! Turning oracle output into executed steps.
//!
//! [`extract_code`] pulls the executable snippet out of a free-form oracle
//! response, and [`Sandbox`] evaluates it with nothing but the backend's
//! capability bindings and the session's shared state in scope.

pub mod extract;
pub mod sandbox;

pub use extract::extract_code;
pub use sandbox::{Evaluation, Sandbox, SandboxError, SandboxLimits, SHARED_STATE_VAR};
