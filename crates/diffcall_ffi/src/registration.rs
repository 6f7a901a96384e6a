//! Name -> native target table handed to the embedding runtime.

use std::ffi::{c_char, c_void, CStr};

use diffcall_core::CallbackMode;
use once_cell::sync::Lazy;

use crate::entry::{
    cpu_idaklu, cpu_idaklu_jvp, cpu_idaklu_jvp_status, cpu_idaklu_status, cpu_idaklu_vjp,
    cpu_idaklu_vjp_status,
};

/// `void(void* out, const void** in)`
pub type CustomCallFn = unsafe extern "C" fn(*mut c_void, *const *const c_void);

/// `void(void** out_tuple, const void** in)`, with `out_tuple = [data, status]`.
pub type StatusCallFn = unsafe extern "C" fn(*mut *mut c_void, *const *const c_void);

#[derive(Debug, Clone, Copy)]
pub enum Target {
    Plain(CustomCallFn),
    WithStatus(StatusCallFn),
}

impl Target {
    pub fn address(&self) -> *const c_void {
        match *self {
            Target::Plain(f) => f as *const c_void,
            Target::WithStatus(f) => f as *const c_void,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CustomCallTarget {
    pub name: &'static CStr,
    pub mode: CallbackMode,
    pub target: Target,
}

impl CustomCallTarget {
    pub fn name(&self) -> &'static str {
        self.name.to_str().unwrap_or_default()
    }
}

static TARGETS: [CustomCallTarget; 6] = [
    CustomCallTarget {
        name: c"cpu_idaklu_f64",
        mode: CallbackMode::Solve,
        target: Target::Plain(cpu_idaklu),
    },
    CustomCallTarget {
        name: c"cpu_idaklu_jvp_f64",
        mode: CallbackMode::Jvp,
        target: Target::Plain(cpu_idaklu_jvp),
    },
    CustomCallTarget {
        name: c"cpu_idaklu_vjp_f64",
        mode: CallbackMode::Vjp,
        target: Target::Plain(cpu_idaklu_vjp),
    },
    CustomCallTarget {
        name: c"cpu_idaklu_status_f64",
        mode: CallbackMode::Solve,
        target: Target::WithStatus(cpu_idaklu_status),
    },
    CustomCallTarget {
        name: c"cpu_idaklu_jvp_status_f64",
        mode: CallbackMode::Jvp,
        target: Target::WithStatus(cpu_idaklu_jvp_status),
    },
    CustomCallTarget {
        name: c"cpu_idaklu_vjp_status_f64",
        mode: CallbackMode::Vjp,
        target: Target::WithStatus(cpu_idaklu_vjp_status),
    },
];

pub fn registrations() -> &'static [CustomCallTarget] {
    &TARGETS
}

pub fn lookup(name: &str) -> Option<&'static CustomCallTarget> {
    TARGETS.iter().find(|target| target.name() == name)
}

/// C view of one registration entry.
#[repr(C)]
#[derive(Debug)]
pub struct RawRegistration {
    pub name: *const c_char,
    pub target: *const c_void,
}

// Both pointers refer to static data.
unsafe impl Send for RawRegistration {}
unsafe impl Sync for RawRegistration {}

static RAW_TARGETS: Lazy<Vec<RawRegistration>> = Lazy::new(|| {
    TARGETS
        .iter()
        .map(|entry| RawRegistration {
            name: entry.name.as_ptr(),
            target: entry.target.address(),
        })
        .collect()
});

/// Returns the registration table and writes its length to `count`.
///
/// # Safety
/// `count` must be null or valid for a `usize` write.
#[no_mangle]
pub unsafe extern "C" fn diffcall_registrations(count: *mut usize) -> *const RawRegistration {
    if !count.is_null() {
        count.write(RAW_TARGETS.len());
    }
    tracing::debug!(targets = RAW_TARGETS.len(), "exported custom-call registrations");
    RAW_TARGETS.as_ptr()
}
