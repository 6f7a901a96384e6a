pub mod buffer;
pub mod calls;
pub mod error;
pub mod expression;
pub mod registry;
pub mod schema;
pub mod settings;
pub mod solver;
/// The `diffcall_core` crate carries buffers across the boundary between an
/// external array-computation runtime and a host-resident solver, in three
/// calling modes: primal solve, forward-mode tangent (JVP) and reverse-mode
/// cotangent (VJP).
///
/// Key components:
/// - **Buffers**: `ArrayView` (borrowed, never released) and `OwnedArray` (released exactly once).
/// - **Registry**: `CallbackRegistry`, one slot per mode.
/// - **Schemas**: positional argument layouts, decoded into typed views.
/// - **Calls**: the three call paths with their size contracts.
/// - **Solver / Expression**: the surfaces of the external solver object and serialized functions.
pub mod traits;

pub use buffer::{ArrayView, OwnedArray, Shape};
pub use error::{BridgeError, BridgeResult, StatusCode};
pub use registry::{Callback, CallbackMode, CallbackRegistry};
pub use settings::BridgeSettings;
pub use traits::Real;
