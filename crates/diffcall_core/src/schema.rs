//! Positional argument layouts of the three custom-call targets.
//!
//! The external runtime hands each target an array of untyped addresses. A
//! [`CallSchema`] records what every position means so the addresses can be
//! checked and turned into typed views in one explicit decode step.

use std::ffi::c_void;
use std::mem::size_of;

use crate::buffer::{ArrayView, Shape};
use crate::error::{BridgeError, BridgeResult};
use crate::registry::CallbackMode;
use crate::traits::Real;

/// Named extents that size arrays and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// `n_t`, the length of the time grid.
    TimePoints,
    /// `n_vars`, the number of output variables.
    Variables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Scalar `i64` defining an extent.
    Extent(Extent),
    /// Scalar `Real`.
    Scalar,
    /// Scalar `i64` selecting a parameter.
    Index,
    /// Contiguous `Real` array whose length is the given extent.
    Array(Extent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
}

const fn arg(name: &'static str, kind: ArgKind) -> ArgSpec {
    ArgSpec { name, kind }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSpec {
    Matrix(Extent, Extent),
    Vector(Extent),
}

/// Largest element count a `Real` slice can address.
pub const MAX_ELEMENTS: usize = isize::MAX as usize / size_of::<Real>();

impl OutputSpec {
    /// Element count of the output, or `None` past [`MAX_ELEMENTS`].
    pub fn len(&self, extents: &Extents) -> Option<usize> {
        let len = match *self {
            OutputSpec::Matrix(rows, cols) => extents.get(rows).checked_mul(extents.get(cols))?,
            OutputSpec::Vector(len) => extents.get(len),
        };
        (len <= MAX_ELEMENTS).then_some(len)
    }
}

/// Layout of one custom-call target.
#[derive(Debug)]
pub struct CallSchema {
    pub target: &'static str,
    pub mode: CallbackMode,
    pub args: &'static [ArgSpec],
    pub output: OutputSpec,
}

pub const PRIMAL: CallSchema = CallSchema {
    target: "cpu_idaklu_f64",
    mode: CallbackMode::Solve,
    args: &[
        arg("n_t", ArgKind::Extent(Extent::TimePoints)),
        arg("n_vars", ArgKind::Extent(Extent::Variables)),
        arg("t", ArgKind::Array(Extent::TimePoints)),
        arg("in1", ArgKind::Scalar),
        arg("in2", ArgKind::Scalar),
    ],
    output: OutputSpec::Matrix(Extent::TimePoints, Extent::Variables),
};

pub const TANGENT: CallSchema = CallSchema {
    target: "cpu_idaklu_jvp_f64",
    mode: CallbackMode::Jvp,
    args: &[
        arg("n_t", ArgKind::Extent(Extent::TimePoints)),
        arg("n_vars", ArgKind::Extent(Extent::Variables)),
        arg("primal_t", ArgKind::Array(Extent::TimePoints)),
        arg("primal_in1", ArgKind::Scalar),
        arg("primal_in2", ArgKind::Scalar),
        arg("tangent_t", ArgKind::Array(Extent::TimePoints)),
        arg("tangent_in1", ArgKind::Scalar),
        arg("tangent_in2", ArgKind::Scalar),
    ],
    output: OutputSpec::Matrix(Extent::TimePoints, Extent::Variables),
};

pub const COTANGENT: CallSchema = CallSchema {
    target: "cpu_idaklu_vjp_f64",
    mode: CallbackMode::Vjp,
    args: &[
        arg("n_t", ArgKind::Extent(Extent::TimePoints)),
        arg("n_vars", ArgKind::Extent(Extent::Variables)),
        arg("y_bar", ArgKind::Array(Extent::Variables)),
        arg("invar", ArgKind::Index),
        arg("t", ArgKind::Array(Extent::TimePoints)),
        arg("in1", ArgKind::Scalar),
        arg("in2", ArgKind::Scalar),
    ],
    output: OutputSpec::Vector(Extent::TimePoints),
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extents {
    pub n_t: usize,
    pub n_vars: usize,
}

impl Extents {
    pub fn get(&self, extent: Extent) -> usize {
        match extent {
            Extent::TimePoints => self.n_t,
            Extent::Variables => self.n_vars,
        }
    }

    fn set(&mut self, extent: Extent, value: usize) {
        match extent {
            Extent::TimePoints => self.n_t = value,
            Extent::Variables => self.n_vars = value,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ArgValue<'a> {
    Extent(usize),
    Scalar(Real),
    Index(i64),
    Array(ArrayView<'a, Real>),
}

/// Arguments of one call, in schema order.
#[derive(Debug)]
pub struct DecodedArgs<'a> {
    pub extents: Extents,
    pub values: Vec<ArgValue<'a>>,
}

impl CallSchema {
    /// Reads `self.args.len()` addresses from `ins` and wraps each one.
    ///
    /// Extents are decoded and bounded first, so arrays may be sized by an
    /// extent that appears later in the list.
    ///
    /// # Safety
    /// `ins` must point to at least `self.args.len()` addresses laid out as
    /// this schema describes, each valid for the whole lifetime `'a`.
    pub unsafe fn decode<'a>(&self, ins: *const *const c_void) -> BridgeResult<DecodedArgs<'a>> {
        if ins.is_null() {
            return Err(self.null_argument(0, "<argument buffer>"));
        }
        let addrs = std::slice::from_raw_parts(ins, self.args.len());

        let mut extents = Extents::default();
        for (position, (spec, &addr)) in self.args.iter().zip(addrs).enumerate() {
            if let ArgKind::Extent(extent) = spec.kind {
                let value = self.read::<i64>(position, spec, addr)?;
                if value < 0 {
                    return Err(BridgeError::NegativeExtent {
                        target: self.target,
                        name: spec.name,
                        value,
                    });
                }
                let value = usize::try_from(value)
                    .ok()
                    .filter(|&value| value <= MAX_ELEMENTS)
                    .ok_or_else(|| self.overflow())?;
                extents.set(extent, value);
            }
        }
        self.output_len(&extents)?;

        let mut values = Vec::with_capacity(self.args.len());
        for (position, (spec, &addr)) in self.args.iter().zip(addrs).enumerate() {
            let value = match spec.kind {
                ArgKind::Extent(extent) => ArgValue::Extent(extents.get(extent)),
                ArgKind::Scalar => ArgValue::Scalar(self.read::<Real>(position, spec, addr)?),
                ArgKind::Index => ArgValue::Index(self.read::<i64>(position, spec, addr)?),
                ArgKind::Array(extent) => {
                    let len = extents.get(extent);
                    if len > 0 && addr.is_null() {
                        return Err(self.null_argument(position, spec.name));
                    }
                    ArgValue::Array(ArrayView::from_raw(addr.cast::<Real>(), Shape::vector(len)))
                }
            };
            values.push(value);
        }

        Ok(DecodedArgs { extents, values })
    }

    pub fn output_len(&self, extents: &Extents) -> BridgeResult<usize> {
        self.output.len(extents).ok_or_else(|| self.overflow())
    }

    /// Wraps the caller-allocated output buffer.
    ///
    /// # Safety
    /// `out` must be valid for writes of `self.output_len(extents)` elements
    /// for `'o` and not aliased by any input.
    pub unsafe fn output<'o>(&self, out: *mut c_void, extents: &Extents) -> BridgeResult<&'o mut [Real]> {
        let len = self.output_len(extents)?;
        if len == 0 {
            return Ok(&mut []);
        }
        if out.is_null() {
            return Err(self.null_argument(self.args.len(), "out"));
        }
        Ok(std::slice::from_raw_parts_mut(out.cast::<Real>(), len))
    }

    unsafe fn read<T: Copy>(&self, position: usize, spec: &ArgSpec, addr: *const c_void) -> BridgeResult<T> {
        if addr.is_null() {
            return Err(self.null_argument(position, spec.name));
        }
        Ok(addr.cast::<T>().read_unaligned())
    }

    fn overflow(&self) -> BridgeError {
        BridgeError::ExtentOverflow {
            target: self.target,
            max: MAX_ELEMENTS,
        }
    }

    fn null_argument(&self, position: usize, name: &'static str) -> BridgeError {
        BridgeError::NullArgument {
            target: self.target,
            position,
            name,
        }
    }
}

/// Typed arguments of the primal target.
#[derive(Debug, Clone)]
pub struct PrimalArgs<'a> {
    pub n_t: usize,
    pub n_vars: usize,
    pub t: ArrayView<'a, Real>,
    pub in1: Real,
    pub in2: Real,
}

/// Typed arguments of the tangent target.
#[derive(Debug, Clone)]
pub struct TangentArgs<'a> {
    pub n_t: usize,
    pub n_vars: usize,
    pub primal_t: ArrayView<'a, Real>,
    pub primal_in1: Real,
    pub primal_in2: Real,
    pub tangent_t: ArrayView<'a, Real>,
    pub tangent_in1: Real,
    pub tangent_in2: Real,
}

/// Typed arguments of the cotangent target.
#[derive(Debug, Clone)]
pub struct CotangentArgs<'a> {
    pub n_t: usize,
    pub n_vars: usize,
    pub y_bar: ArrayView<'a, Real>,
    pub invar: i64,
    pub t: ArrayView<'a, Real>,
    pub in1: Real,
    pub in2: Real,
}

impl<'a> PrimalArgs<'a> {
    /// # Safety
    /// See [`CallSchema::decode`] with [`PRIMAL`].
    pub unsafe fn decode(ins: *const *const c_void) -> BridgeResult<Self> {
        let DecodedArgs { extents, values } = PRIMAL.decode(ins)?;
        match <[ArgValue<'a>; 5]>::try_from(values) {
            Ok([_, _, ArgValue::Array(t), ArgValue::Scalar(in1), ArgValue::Scalar(in2)]) => Ok(Self {
                n_t: extents.n_t,
                n_vars: extents.n_vars,
                t,
                in1,
                in2,
            }),
            _ => unreachable!("PRIMAL layout"),
        }
    }

    pub fn extents(&self) -> Extents {
        Extents {
            n_t: self.n_t,
            n_vars: self.n_vars,
        }
    }
}

impl<'a> TangentArgs<'a> {
    /// # Safety
    /// See [`CallSchema::decode`] with [`TANGENT`].
    pub unsafe fn decode(ins: *const *const c_void) -> BridgeResult<Self> {
        let DecodedArgs { extents, values } = TANGENT.decode(ins)?;
        match <[ArgValue<'a>; 8]>::try_from(values) {
            Ok([
                _,
                _,
                ArgValue::Array(primal_t),
                ArgValue::Scalar(primal_in1),
                ArgValue::Scalar(primal_in2),
                ArgValue::Array(tangent_t),
                ArgValue::Scalar(tangent_in1),
                ArgValue::Scalar(tangent_in2),
            ]) => Ok(Self {
                n_t: extents.n_t,
                n_vars: extents.n_vars,
                primal_t,
                primal_in1,
                primal_in2,
                tangent_t,
                tangent_in1,
                tangent_in2,
            }),
            _ => unreachable!("TANGENT layout"),
        }
    }

    pub fn extents(&self) -> Extents {
        Extents {
            n_t: self.n_t,
            n_vars: self.n_vars,
        }
    }
}

impl<'a> CotangentArgs<'a> {
    /// # Safety
    /// See [`CallSchema::decode`] with [`COTANGENT`].
    pub unsafe fn decode(ins: *const *const c_void) -> BridgeResult<Self> {
        let DecodedArgs { extents, values } = COTANGENT.decode(ins)?;
        match <[ArgValue<'a>; 7]>::try_from(values) {
            Ok([
                _,
                _,
                ArgValue::Array(y_bar),
                ArgValue::Index(invar),
                ArgValue::Array(t),
                ArgValue::Scalar(in1),
                ArgValue::Scalar(in2),
            ]) => Ok(Self {
                n_t: extents.n_t,
                n_vars: extents.n_vars,
                y_bar,
                invar,
                t,
                in1,
                in2,
            }),
            _ => unreachable!("COTANGENT layout"),
        }
    }

    pub fn extents(&self) -> Extents {
        Extents {
            n_t: self.n_t,
            n_vars: self.n_vars,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr<T>(value: &T) -> *const c_void {
        (value as *const T).cast()
    }

    #[test]
    fn primal_decodes_positional_arguments() {
        let n_t: i64 = 3;
        let n_vars: i64 = 2;
        let t = [0.0, 1.0, 2.0];
        let in1 = 1.0;
        let in2 = 2.0;
        let ins = [addr(&n_t), addr(&n_vars), t.as_ptr().cast(), addr(&in1), addr(&in2)];

        let args = unsafe { PrimalArgs::decode(ins.as_ptr()) }.expect("decode");
        assert_eq!(args.n_t, 3);
        assert_eq!(args.n_vars, 2);
        assert_eq!(args.t.to_vec(), vec![0.0, 1.0, 2.0]);
        assert_eq!(args.in1, 1.0);
        assert_eq!(args.in2, 2.0);
    }

    #[test]
    fn cotangent_sizes_y_bar_by_variables() {
        let n_t: i64 = 2;
        let n_vars: i64 = 3;
        let y_bar = [0.1, 0.2, 0.3];
        let invar: i64 = 1;
        let t = [0.0, 0.5];
        let in1 = 1.0;
        let in2 = 2.0;
        let ins = [
            addr(&n_t),
            addr(&n_vars),
            y_bar.as_ptr().cast(),
            addr(&invar),
            t.as_ptr().cast(),
            addr(&in1),
            addr(&in2),
        ];

        let args = unsafe { CotangentArgs::decode(ins.as_ptr()) }.expect("decode");
        assert_eq!(args.y_bar.len(), 3);
        assert_eq!(args.t.len(), 2);
        assert_eq!(args.invar, 1);
        assert_eq!(COTANGENT.output_len(&args.extents()).expect("len"), 2);
    }

    #[test]
    fn tangent_grids_share_time_extent() {
        let n_t: i64 = 2;
        let n_vars: i64 = 1;
        let primal_t = [0.0, 1.0];
        let tangent_t = [1.0, 1.0];
        let scalars = [1.0, 2.0, 0.5, 0.25];
        let ins = [
            addr(&n_t),
            addr(&n_vars),
            primal_t.as_ptr().cast(),
            addr(&scalars[0]),
            addr(&scalars[1]),
            tangent_t.as_ptr().cast(),
            addr(&scalars[2]),
            addr(&scalars[3]),
        ];

        let args = unsafe { TangentArgs::decode(ins.as_ptr()) }.expect("decode");
        assert_eq!(args.primal_t.len(), args.tangent_t.len());
        assert_eq!(args.tangent_in1, 0.5);
        assert_eq!(args.tangent_in2, 0.25);
    }

    #[test]
    fn negative_extent_is_rejected() {
        let n_t: i64 = -1;
        let n_vars: i64 = 2;
        let in1 = 1.0;
        let ins = [addr(&n_t), addr(&n_vars), std::ptr::null(), addr(&in1), addr(&in1)];

        let err = unsafe { PrimalArgs::decode(ins.as_ptr()) }.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NegativeExtent {
                name: "n_t",
                value: -1,
                ..
            }
        ));
    }

    #[test]
    fn output_extent_product_must_not_overflow() {
        let n_t: i64 = 4;
        let n_vars: i64 = 1 << 62;
        let t = [0.0; 4];
        let in1 = 1.0;
        let ins = [addr(&n_t), addr(&n_vars), t.as_ptr().cast(), addr(&in1), addr(&in1)];

        let err = unsafe { PrimalArgs::decode(ins.as_ptr()) }.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ExtentOverflow {
                target: "cpu_idaklu_f64",
                ..
            }
        ));

        let extents = Extents {
            n_t: 4,
            n_vars: 1 << 62,
        };
        assert_eq!(PRIMAL.output.len(&extents), None);
        assert!(unsafe { PRIMAL.output(std::ptr::null_mut(), &extents) }.is_err());
    }

    #[test]
    fn single_extent_is_bounded_before_building_views() {
        let n_t: i64 = i64::MAX;
        let n_vars: i64 = 0;
        let y_bar: [Real; 0] = [];
        let invar: i64 = 0;
        let in1 = 1.0;
        let ins = [
            addr(&n_t),
            addr(&n_vars),
            y_bar.as_ptr().cast(),
            addr(&invar),
            std::ptr::null(),
            addr(&in1),
            addr(&in1),
        ];

        let err = unsafe { CotangentArgs::decode(ins.as_ptr()) }.unwrap_err();
        assert!(matches!(err, BridgeError::ExtentOverflow { .. }));
        assert_eq!(err.status_code(), crate::error::StatusCode::InvalidArgument);
    }

    #[test]
    fn largest_addressable_vector_is_accepted() {
        let extents = Extents {
            n_t: MAX_ELEMENTS,
            n_vars: 1,
        };
        assert_eq!(COTANGENT.output_len(&extents).expect("len"), MAX_ELEMENTS);
        assert!(PRIMAL.output_len(&Extents { n_t: MAX_ELEMENTS, n_vars: 2 }).is_err());
    }

    #[test]
    fn null_scalar_is_rejected_with_position() {
        let n_t: i64 = 1;
        let n_vars: i64 = 1;
        let t = [0.0];
        let in1 = 1.0;
        let ins = [addr(&n_t), addr(&n_vars), t.as_ptr().cast(), addr(&in1), std::ptr::null()];

        let err = unsafe { PrimalArgs::decode(ins.as_ptr()) }.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NullArgument {
                position: 4,
                name: "in2",
                ..
            }
        ));
    }

    #[test]
    fn empty_grid_accepts_null_array() {
        let n_t: i64 = 0;
        let n_vars: i64 = 2;
        let in1 = 1.0;
        let ins = [addr(&n_t), addr(&n_vars), std::ptr::null(), addr(&in1), addr(&in1)];

        let args = unsafe { PrimalArgs::decode(ins.as_ptr()) }.expect("decode");
        assert!(args.t.is_empty());
        let out = unsafe { PRIMAL.output(std::ptr::null_mut(), &args.extents()) }.expect("output");
        assert!(out.is_empty());
    }

    #[test]
    fn null_argument_buffer_is_rejected() {
        let err = unsafe { PRIMAL.decode(std::ptr::null()) }.unwrap_err();
        assert!(matches!(err, BridgeError::NullArgument { position: 0, .. }));
    }

    #[test]
    fn null_output_is_rejected() {
        let extents = Extents { n_t: 2, n_vars: 2 };
        let err = unsafe { TANGENT.output(std::ptr::null_mut(), &extents) }.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::NullArgument {
                position: 8,
                name: "out",
                ..
            }
        ));
    }

    #[test]
    fn schemas_match_registered_target_names() {
        assert_eq!(PRIMAL.args.len(), 5);
        assert_eq!(TANGENT.args.len(), 8);
        assert_eq!(COTANGENT.args.len(), 7);
        assert_eq!(PRIMAL.target, "cpu_idaklu_f64");
        assert_eq!(TANGENT.target, "cpu_idaklu_jvp_f64");
        assert_eq!(COTANGENT.target, "cpu_idaklu_vjp_f64");
    }
}
