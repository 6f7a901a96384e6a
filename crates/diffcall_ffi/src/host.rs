//! Process-wide state shared by every entry point, and the host-facing setters.

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::ptr;

use anyhow::Result;
use diffcall_core::buffer::diagnostic_array;
use diffcall_core::{ArrayView, BridgeSettings, Callback, CallbackRegistry, OwnedArray, Real, StatusCode};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing_subscriber::EnvFilter;

static REGISTRY: Lazy<CallbackRegistry> = Lazy::new(CallbackRegistry::new);

static SETTINGS: Lazy<RwLock<BridgeSettings>> = Lazy::new(|| RwLock::new(BridgeSettings::from_env()));

/// The registry the `extern "C"` entry points read from.
pub fn registry() -> &'static CallbackRegistry {
    &REGISTRY
}

pub fn settings() -> BridgeSettings {
    *SETTINGS.read()
}

pub fn configure(settings: BridgeSettings) {
    *SETTINGS.write() = settings;
    tracing::debug!(?settings, "bridge settings updated");
}

pub fn register_callback_jaxsolve<F>(f: F)
where
    F: for<'a> Fn(ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>> + Send + Sync + 'static,
{
    REGISTRY.register(Callback::solve(f));
}

pub fn register_callback_jvp<F>(f: F)
where
    F: for<'a> Fn(ArrayView<'a, Real>, Real, Real, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
        + Send
        + Sync
        + 'static,
{
    REGISTRY.register(Callback::jvp(f));
}

pub fn register_callback_vjp<F>(f: F)
where
    F: for<'a> Fn(ArrayView<'a, Real>, i64, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
        + Send
        + Sync
        + 'static,
{
    REGISTRY.register(Callback::vjp(f));
}

pub fn register_callbacks<S, J, V>(solve: S, jvp: J, vjp: V)
where
    S: for<'a> Fn(ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>> + Send + Sync + 'static,
    J: for<'a> Fn(ArrayView<'a, Real>, Real, Real, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
        + Send
        + Sync
        + 'static,
    V: for<'a> Fn(ArrayView<'a, Real>, i64, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
        + Send
        + Sync
        + 'static,
{
    REGISTRY.register_all(solve, jvp, vjp);
}

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

pub(crate) fn set_last_error(message: impl Into<String>) {
    let message = message.into().replace('\0', " ");
    let message = CString::new(message).unwrap_or_default();
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = Some(message);
    });
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Message of the last failure reported by a status-returning export on this
/// thread (the `_status` targets, `diffcall_configure`, `diffcall_test_capsule`),
/// or null. The pointer stays valid until the next such call on the same thread.
#[no_mangle]
pub extern "C" fn diffcall_last_error() -> *const c_char {
    LAST_ERROR.with(|cell| match &*cell.borrow() {
        Some(message) => message.as_ptr(),
        None => ptr::null(),
    })
}

/// Replaces the process-wide settings with a JSON document such as
/// `{"trace_arguments": true}`. Returns a `StatusCode`.
///
/// # Safety
/// `json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn diffcall_configure(json: *const c_char) -> i64 {
    if json.is_null() {
        set_last_error("settings document is a null pointer");
        return StatusCode::InvalidArgument as i64;
    }
    let parsed = CStr::from_ptr(json)
        .to_str()
        .map_err(anyhow::Error::from)
        .and_then(|text| serde_json::from_str::<BridgeSettings>(text).map_err(anyhow::Error::from));
    match parsed {
        Ok(settings) => {
            configure(settings);
            clear_last_error();
            StatusCode::Ok as i64
        }
        Err(err) => {
            tracing::warn!(error = %err, "rejected bridge settings");
            set_last_error(format!("invalid settings: {err}"));
            StatusCode::InvalidArgument as i64
        }
    }
}

/// Installs a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`.
/// Does nothing if a subscriber is already installed.
#[no_mangle]
pub extern "C" fn diffcall_init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Writes the sanity-check array `[0, 1, ..., count - 1]` into `out`.
///
/// # Safety
/// `out` must be writable for `count` elements.
#[no_mangle]
pub unsafe extern "C" fn diffcall_test_capsule(out: *mut Real, count: usize) -> i64 {
    if count > 0 && out.is_null() {
        set_last_error("diagnostic output is a null pointer");
        return StatusCode::InvalidArgument as i64;
    }
    let out: &mut [Real] = if count == 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(out, count)
    };
    match diagnostic_array(count).copy_into(out) {
        Ok(()) => StatusCode::Ok as i64,
        Err(err) => {
            set_last_error(err.to_string());
            err.status_code() as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_round_trips_through_c_string() {
        set_last_error("shape mismatch");
        let message = unsafe { CStr::from_ptr(diffcall_last_error()) };
        assert_eq!(message.to_str().expect("utf8"), "shape mismatch");
        clear_last_error();
        assert!(diffcall_last_error().is_null());
    }

    #[test]
    fn interior_nul_does_not_lose_message() {
        set_last_error("bad\0input");
        let message = unsafe { CStr::from_ptr(diffcall_last_error()) };
        assert_eq!(message.to_str().expect("utf8"), "bad input");
    }

    #[test]
    fn configure_rejects_malformed_json() {
        let status = unsafe { diffcall_configure(c"{ not json".as_ptr()) };
        assert_eq!(status, StatusCode::InvalidArgument as i64);
        assert!(!diffcall_last_error().is_null());

        let status = unsafe { diffcall_configure(ptr::null()) };
        assert_eq!(status, StatusCode::InvalidArgument as i64);
    }

    #[test]
    fn test_capsule_fills_counting_sequence() {
        let mut out = [0.0; 4];
        let status = unsafe { diffcall_test_capsule(out.as_mut_ptr(), out.len()) };
        assert_eq!(status, StatusCode::Ok as i64);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn init_logging_is_idempotent() {
        diffcall_init_logging();
        diffcall_init_logging();
    }
}
