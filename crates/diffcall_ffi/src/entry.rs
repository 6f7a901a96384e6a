//! `extern "C"` custom-call targets.
//!
//! Plain targets follow the classic custom-call ABI (`void(void* out, const
//! void** in)`). That ABI has no error channel, so any failure is logged and
//! the process is aborted. The `_status` targets declare a two-element output
//! tuple instead: the data buffer followed by an `i64` status scalar, which
//! receives a `StatusCode` and lets the runtime surface the failure itself.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

use diffcall_core::calls::dispatch;
use diffcall_core::error::panic_payload_to_string;
use diffcall_core::{BridgeError, BridgeResult, CallbackMode, StatusCode};

use crate::host::{self, clear_last_error, set_last_error};

/// # Safety
/// `out` and `ins` must follow the layout registered for `mode`.
unsafe fn run(mode: CallbackMode, out: *mut c_void, ins: *const *const c_void) -> BridgeResult<()> {
    let settings = host::settings();
    catch_unwind(AssertUnwindSafe(|| {
        dispatch(mode, host::registry(), &settings, out, ins)
    }))
    .unwrap_or_else(|payload| {
        Err(BridgeError::Panicked {
            mode,
            message: panic_payload_to_string(payload),
        })
    })
}

fn fail_fast(mode: CallbackMode, err: &BridgeError) -> ! {
    tracing::error!(%mode, error = %err, "custom call failed, aborting");
    eprintln!("diffcall: {mode} custom call failed: {err}");
    std::process::abort()
}

unsafe fn run_or_abort(mode: CallbackMode, out: *mut c_void, ins: *const *const c_void) {
    if let Err(err) = run(mode, out, ins) {
        fail_fast(mode, &err);
    }
}

unsafe fn run_with_status(mode: CallbackMode, out_tuple: *mut *mut c_void, ins: *const *const c_void) {
    if out_tuple.is_null() {
        fail_fast(
            mode,
            &BridgeError::NullArgument {
                target: "status output tuple",
                position: 0,
                name: "out",
            },
        );
    }
    let data = *out_tuple;
    let status = (*out_tuple.add(1)).cast::<i64>();
    if status.is_null() {
        fail_fast(
            mode,
            &BridgeError::NullArgument {
                target: "status output tuple",
                position: 1,
                name: "status",
            },
        );
    }

    let code = match run(mode, data, ins) {
        Ok(()) => {
            clear_last_error();
            StatusCode::Ok
        }
        Err(err) => {
            tracing::error!(%mode, error = %err, "custom call failed");
            set_last_error(err.to_string());
            err.status_code()
        }
    };
    status.write_unaligned(code as i64);
}

/// Primal solve: `in = [n_t, n_vars, t, in1, in2]`, `out` holds `n_t * n_vars` values.
///
/// # Safety
/// Must only be called by a runtime honouring the registered layout.
#[no_mangle]
pub unsafe extern "C" fn cpu_idaklu(out: *mut c_void, ins: *const *const c_void) {
    run_or_abort(CallbackMode::Solve, out, ins);
}

/// Tangent: `in = [n_t, n_vars, t, in1, in2, t_dot, in1_dot, in2_dot]`,
/// `out` holds `n_t * n_vars` values.
///
/// # Safety
/// Must only be called by a runtime honouring the registered layout.
#[no_mangle]
pub unsafe extern "C" fn cpu_idaklu_jvp(out: *mut c_void, ins: *const *const c_void) {
    run_or_abort(CallbackMode::Jvp, out, ins);
}

/// Cotangent: `in = [n_t, n_vars, y_bar, invar, t, in1, in2]`, `out` holds `n_t` values.
///
/// # Safety
/// Must only be called by a runtime honouring the registered layout.
#[no_mangle]
pub unsafe extern "C" fn cpu_idaklu_vjp(out: *mut c_void, ins: *const *const c_void) {
    run_or_abort(CallbackMode::Vjp, out, ins);
}

/// # Safety
/// As [`cpu_idaklu`], with `out` a `[data, status]` tuple.
#[no_mangle]
pub unsafe extern "C" fn cpu_idaklu_status(out: *mut *mut c_void, ins: *const *const c_void) {
    run_with_status(CallbackMode::Solve, out, ins);
}

/// # Safety
/// As [`cpu_idaklu_jvp`], with `out` a `[data, status]` tuple.
#[no_mangle]
pub unsafe extern "C" fn cpu_idaklu_jvp_status(out: *mut *mut c_void, ins: *const *const c_void) {
    run_with_status(CallbackMode::Jvp, out, ins);
}

/// # Safety
/// As [`cpu_idaklu_vjp`], with `out` a `[data, status]` tuple.
#[no_mangle]
pub unsafe extern "C" fn cpu_idaklu_vjp_status(out: *mut *mut c_void, ins: *const *const c_void) {
    run_with_status(CallbackMode::Vjp, out, ins);
}
