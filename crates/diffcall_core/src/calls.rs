//! The three call paths: primal solve, tangent (JVP) and cotangent (VJP).
//!
//! Each path checks the decoded arguments against the declared extents,
//! hands the views to the registered callback and copies the returned array
//! into the caller's output buffer. Nothing is written to the output unless
//! the result has exactly the declared length.

use std::ffi::c_void;

use crate::buffer::ArrayView;
use crate::error::{BridgeError, BridgeResult};
use crate::registry::{CallbackMode, CallbackRegistry};
use crate::schema::{CotangentArgs, PrimalArgs, TangentArgs, COTANGENT, PRIMAL, TANGENT};
use crate::settings::BridgeSettings;
use crate::traits::Real;

/// Number of scalar parameters a cotangent can be taken with respect to.
pub const PARAMETER_COUNT: usize = 2;

fn expect_len(context: &'static str, expected: usize, actual: usize) -> BridgeResult<()> {
    if expected != actual {
        return Err(BridgeError::ShapeMismatch {
            context,
            expected,
            actual,
        });
    }
    Ok(())
}

fn trace_array(settings: &BridgeSettings, name: &str, view: &ArrayView<'_, Real>) {
    if settings.trace_arguments {
        let shown: Vec<Real> = view.iter().take(settings.trace_limit).collect();
        tracing::trace!(arg = name, len = view.len(), values = ?shown, "array argument");
    }
}

pub fn evaluate_primal(
    registry: &CallbackRegistry,
    settings: &BridgeSettings,
    args: PrimalArgs<'_>,
    out: &mut [Real],
) -> BridgeResult<()> {
    tracing::debug!(
        call = PRIMAL.target,
        n_t = args.n_t,
        n_vars = args.n_vars,
        in1 = args.in1,
        in2 = args.in2,
        "primal call"
    );
    trace_array(settings, "t", &args.t);

    expect_len("time grid", args.n_t, args.t.len())?;
    expect_len("output buffer", PRIMAL.output_len(&args.extents())?, out.len())?;

    let y = registry.invoke_solve(args.t, args.in1, args.in2)?;
    y.copy_into(out)
}

pub fn evaluate_tangent(
    registry: &CallbackRegistry,
    settings: &BridgeSettings,
    args: TangentArgs<'_>,
    out: &mut [Real],
) -> BridgeResult<()> {
    tracing::debug!(
        call = TANGENT.target,
        n_t = args.n_t,
        n_vars = args.n_vars,
        primal_in1 = args.primal_in1,
        primal_in2 = args.primal_in2,
        tangent_in1 = args.tangent_in1,
        tangent_in2 = args.tangent_in2,
        "tangent call"
    );
    trace_array(settings, "primal_t", &args.primal_t);
    trace_array(settings, "tangent_t", &args.tangent_t);

    expect_len("primal time grid", args.n_t, args.primal_t.len())?;
    expect_len("tangent time grid", args.primal_t.len(), args.tangent_t.len())?;
    expect_len("output buffer", TANGENT.output_len(&args.extents())?, out.len())?;

    let y_dot = registry.invoke_jvp(
        args.primal_t,
        args.primal_in1,
        args.primal_in2,
        args.tangent_t,
        args.tangent_in1,
        args.tangent_in2,
    )?;
    y_dot.copy_into(out)
}

pub fn evaluate_cotangent(
    registry: &CallbackRegistry,
    settings: &BridgeSettings,
    args: CotangentArgs<'_>,
    out: &mut [Real],
) -> BridgeResult<()> {
    tracing::debug!(
        call = COTANGENT.target,
        n_t = args.n_t,
        n_vars = args.n_vars,
        invar = args.invar,
        in1 = args.in1,
        in2 = args.in2,
        "cotangent call"
    );
    trace_array(settings, "y_bar", &args.y_bar);
    trace_array(settings, "t", &args.t);

    if !(0..PARAMETER_COUNT as i64).contains(&args.invar) {
        return Err(BridgeError::InvalidParameterIndex {
            index: args.invar,
            count: PARAMETER_COUNT,
        });
    }
    expect_len("cotangent vector", args.n_vars, args.y_bar.len())?;
    expect_len("time grid", args.n_t, args.t.len())?;
    expect_len("output buffer", COTANGENT.output_len(&args.extents())?, out.len())?;

    let gradient = registry.invoke_vjp(args.y_bar, args.invar, args.t, args.in1, args.in2)?;
    gradient.copy_into(out)
}

/// Decodes a raw custom call for `mode` and runs its call path.
///
/// # Safety
/// `ins` must follow the layout of the schema for `mode`, and `out` must be
/// writable for the declared output extent. Both must stay valid and
/// unaliased for the duration of the call.
pub unsafe fn dispatch(
    mode: CallbackMode,
    registry: &CallbackRegistry,
    settings: &BridgeSettings,
    out: *mut c_void,
    ins: *const *const c_void,
) -> BridgeResult<()> {
    match mode {
        CallbackMode::Solve => {
            let args = PrimalArgs::decode(ins)?;
            let out = PRIMAL.output(out, &args.extents())?;
            evaluate_primal(registry, settings, args, out)
        }
        CallbackMode::Jvp => {
            let args = TangentArgs::decode(ins)?;
            let out = TANGENT.output(out, &args.extents())?;
            evaluate_tangent(registry, settings, args, out)
        }
        CallbackMode::Vjp => {
            let args = CotangentArgs::decode(ins)?;
            let out = COTANGENT.output(out, &args.extents())?;
            evaluate_cotangent(registry, settings, args, out)
        }
    }
}
