//! Native custom-call targets for the `diffcall_core` bridge.
//!
//! The embedding runtime loads this library, reads the registration table
//! (`diffcall_registrations`) and installs each entry as a native call target.
//! The host registers its solve, JVP and VJP callbacks through [`host`] before
//! the first call is issued.

pub mod entry;
pub mod host;
pub mod registration;

pub use host::{
    configure, register_callback_jaxsolve, register_callback_jvp, register_callback_vjp,
    register_callbacks, registry, settings,
};
pub use registration::{lookup, registrations, CustomCallTarget, RawRegistration, Target};
