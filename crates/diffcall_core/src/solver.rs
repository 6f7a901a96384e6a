//! The solver object the host binds into a solve callback.
//!
//! The DAE solver itself lives outside this crate; the bridge only needs the
//! shape of its `solve` operation and of the solution record it returns.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::buffer::{ArrayView, OwnedArray};
use crate::registry::Callback;
use crate::traits::Real;

/// Output of one solver run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    /// Time points actually reached.
    pub t: Vec<Real>,
    /// State trajectory, one row per time point.
    pub y: Vec<Real>,
    /// Sensitivity trajectory with respect to the inputs.
    #[serde(rename = "yS", default)]
    pub y_s: Vec<Real>,
    /// Solver return flag; negative values are failures.
    pub flag: i32,
}

impl Solution {
    pub fn is_success(&self) -> bool {
        self.flag >= 0
    }

    /// State trajectory shaped `(t.len(), n_vars)`.
    pub fn state_rows(&self, n_vars: usize) -> Result<OwnedArray<Real>> {
        let expected = self.t.len() * n_vars;
        if self.y.len() != expected {
            bail!(
                "Solution has {} state values, expected {} time points x {} variables",
                self.y.len(),
                self.t.len(),
                n_vars
            );
        }
        Ok(OwnedArray::from_vec(self.y.clone(), &[self.t.len(), n_vars])?)
    }
}

/// A bound solver object exposing a single `solve` operation.
pub trait SolverObject: Send + Sync {
    fn solve(
        &self,
        t: ArrayView<'_, Real>,
        y0: ArrayView<'_, Real>,
        yp0: ArrayView<'_, Real>,
        inputs: ArrayView<'_, Real>,
    ) -> Result<Solution>;
}

/// A solver object together with its initial conditions, usable as the
/// primal callback. The two call scalars become the solver's input vector.
pub struct BoundSolver<S> {
    solver: Arc<S>,
    y0: Vec<Real>,
    yp0: Vec<Real>,
    n_vars: usize,
}

impl<S: SolverObject + 'static> BoundSolver<S> {
    pub fn new(solver: Arc<S>, y0: Vec<Real>, yp0: Vec<Real>, n_vars: usize) -> Result<Self> {
        if y0.len() != yp0.len() {
            bail!(
                "Initial state has {} entries but initial derivative has {}",
                y0.len(),
                yp0.len()
            );
        }
        Ok(Self {
            solver,
            y0,
            yp0,
            n_vars,
        })
    }

    pub fn solve(&self, t: ArrayView<'_, Real>, in1: Real, in2: Real) -> Result<OwnedArray<Real>> {
        let n_t = t.len();
        let inputs = [in1, in2];
        let solution = self.solver.solve(
            t,
            ArrayView::from_slice(&self.y0),
            ArrayView::from_slice(&self.yp0),
            ArrayView::from_slice(&inputs),
        )?;
        if !solution.is_success() {
            bail!("Solver failed with flag {}", solution.flag);
        }
        if solution.t.len() != n_t {
            bail!(
                "Solver stopped after {} of {} time points",
                solution.t.len(),
                n_t
            );
        }
        solution.state_rows(self.n_vars)
    }

    pub fn into_callback(self) -> Callback {
        Callback::solve(move |t, in1, in2| self.solve(t, in1, in2))
    }
}
