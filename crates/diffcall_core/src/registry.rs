//! Callback registry: one slot per calling mode.
//!
//! Registration is expected to finish before the external runtime starts
//! issuing calls, but the slots sit behind a single `RwLock` so that
//! re-registration while calls are in flight is still sound: a call observes
//! either the old callback set or the new one, never a mix.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

use crate::buffer::{ArrayView, OwnedArray};
use crate::error::{BridgeError, BridgeResult};
use crate::traits::Real;

/// The three ways the external runtime can call into the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackMode {
    Solve,
    Jvp,
    Vjp,
}

impl fmt::Display for CallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallbackMode::Solve => "solve",
            CallbackMode::Jvp => "jvp",
            CallbackMode::Vjp => "vjp",
        };
        f.write_str(name)
    }
}

/// `(t, in1, in2) -> y` with `y` shaped `(n_t, n_vars)`.
pub type SolveFn =
    dyn for<'a> Fn(ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>> + Send + Sync;

/// `(t, in1, in2, t_dot, in1_dot, in2_dot) -> y_dot` with `y_dot` shaped `(n_t, n_vars)`.
pub type JvpFn = dyn for<'a> Fn(ArrayView<'a, Real>, Real, Real, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
    + Send
    + Sync;

/// `(y_bar, invar, t, in1, in2) -> gradient` with `n_t` elements.
pub type VjpFn = dyn for<'a> Fn(ArrayView<'a, Real>, i64, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
    + Send
    + Sync;

/// A callable tagged with the mode it serves.
#[derive(Clone)]
pub enum Callback {
    Solve(Arc<SolveFn>),
    Jvp(Arc<JvpFn>),
    Vjp(Arc<VjpFn>),
}

impl Callback {
    pub fn solve<F>(f: F) -> Self
    where
        F: for<'a> Fn(ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
            + Send
            + Sync
            + 'static,
    {
        Callback::Solve(Arc::new(f))
    }

    pub fn jvp<F>(f: F) -> Self
    where
        F: for<'a> Fn(ArrayView<'a, Real>, Real, Real, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
            + Send
            + Sync
            + 'static,
    {
        Callback::Jvp(Arc::new(f))
    }

    pub fn vjp<F>(f: F) -> Self
    where
        F: for<'a> Fn(ArrayView<'a, Real>, i64, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
            + Send
            + Sync
            + 'static,
    {
        Callback::Vjp(Arc::new(f))
    }

    pub fn mode(&self) -> CallbackMode {
        match self {
            Callback::Solve(_) => CallbackMode::Solve,
            Callback::Jvp(_) => CallbackMode::Jvp,
            Callback::Vjp(_) => CallbackMode::Vjp,
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback::{}", self.mode())
    }
}

#[derive(Default)]
struct Slots {
    solve: Option<Arc<SolveFn>>,
    jvp: Option<Arc<JvpFn>>,
    vjp: Option<Arc<VjpFn>>,
}

/// Holds at most one callback per mode.
#[derive(Default)]
pub struct CallbackRegistry {
    slots: RwLock<Slots>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `callback` in its mode's slot, replacing any previous one.
    pub fn register(&self, callback: Callback) {
        let mode = callback.mode();
        let mut slots = self.slots.write();
        match callback {
            Callback::Solve(f) => slots.solve = Some(f),
            Callback::Jvp(f) => slots.jvp = Some(f),
            Callback::Vjp(f) => slots.vjp = Some(f),
        }
        tracing::debug!(%mode, "registered callback");
    }

    /// Installs all three callbacks under one write lock.
    pub fn register_all<S, J, V>(&self, solve: S, jvp: J, vjp: V)
    where
        S: for<'a> Fn(ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
            + Send
            + Sync
            + 'static,
        J: for<'a> Fn(ArrayView<'a, Real>, Real, Real, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
            + Send
            + Sync
            + 'static,
        V: for<'a> Fn(ArrayView<'a, Real>, i64, ArrayView<'a, Real>, Real, Real) -> Result<OwnedArray<Real>>
            + Send
            + Sync
            + 'static,
    {
        let slots = Slots {
            solve: Some(Arc::new(solve)),
            jvp: Some(Arc::new(jvp)),
            vjp: Some(Arc::new(vjp)),
        };
        *self.slots.write() = slots;
        tracing::debug!("registered solve, jvp and vjp callbacks");
    }

    pub fn is_registered(&self, mode: CallbackMode) -> bool {
        let slots = self.slots.read();
        match mode {
            CallbackMode::Solve => slots.solve.is_some(),
            CallbackMode::Jvp => slots.jvp.is_some(),
            CallbackMode::Vjp => slots.vjp.is_some(),
        }
    }

    pub fn clear(&self) {
        *self.slots.write() = Slots::default();
    }

    // The lock is released before the callback runs, so callbacks may
    // themselves register.
    fn solve_fn(&self) -> BridgeResult<Arc<SolveFn>> {
        self.slots
            .read()
            .solve
            .clone()
            .ok_or(BridgeError::UnregisteredCallback {
                mode: CallbackMode::Solve,
            })
    }

    fn jvp_fn(&self) -> BridgeResult<Arc<JvpFn>> {
        self.slots
            .read()
            .jvp
            .clone()
            .ok_or(BridgeError::UnregisteredCallback {
                mode: CallbackMode::Jvp,
            })
    }

    fn vjp_fn(&self) -> BridgeResult<Arc<VjpFn>> {
        self.slots
            .read()
            .vjp
            .clone()
            .ok_or(BridgeError::UnregisteredCallback {
                mode: CallbackMode::Vjp,
            })
    }

    pub fn invoke_solve(&self, t: ArrayView<'_, Real>, in1: Real, in2: Real) -> BridgeResult<OwnedArray<Real>> {
        let f = self.solve_fn()?;
        f(t, in1, in2).map_err(|source| BridgeError::Callback {
            mode: CallbackMode::Solve,
            source,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn invoke_jvp(
        &self,
        primal_t: ArrayView<'_, Real>,
        primal_in1: Real,
        primal_in2: Real,
        tangent_t: ArrayView<'_, Real>,
        tangent_in1: Real,
        tangent_in2: Real,
    ) -> BridgeResult<OwnedArray<Real>> {
        let f = self.jvp_fn()?;
        f(primal_t, primal_in1, primal_in2, tangent_t, tangent_in1, tangent_in2).map_err(|source| {
            BridgeError::Callback {
                mode: CallbackMode::Jvp,
                source,
            }
        })
    }

    pub fn invoke_vjp(
        &self,
        y_bar: ArrayView<'_, Real>,
        invar: i64,
        t: ArrayView<'_, Real>,
        in1: Real,
        in2: Real,
    ) -> BridgeResult<OwnedArray<Real>> {
        let f = self.vjp_fn()?;
        f(y_bar, invar, t, in1, in2).map_err(|source| BridgeError::Callback {
            mode: CallbackMode::Vjp,
            source,
        })
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("solve", &self.is_registered(CallbackMode::Solve))
            .field("jvp", &self.is_registered(CallbackMode::Jvp))
            .field("vjp", &self.is_registered(CallbackMode::Vjp))
            .finish()
    }
}
