use num_traits::{Float, FromPrimitive, Num};
use std::fmt::Debug;

/// Floating-point element type used by the solver (`realtype` on the native side).
pub type Real = f64;

/// A trait for types that can live inside bridge buffers.
/// Must be plain numeric data that can cross thread boundaries.
pub trait Element: Num + Copy + Debug + Send + Sync + 'static {}

impl<T: Num + Copy + Debug + Send + Sync + 'static> Element for T {}

/// A trait for types the expression VM can evaluate over.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}
