//! Discrete-time simulation of plants in open and closed loop.

use log::warn;
use ndarray::{Array1, Array2, ShapeBuilder};

use crate::dynamics::Dynamics;
use crate::error::{MpcError, Result};

/// Define the interface for stepping discrete-time dynamics.
pub trait Stepper: Dynamics {
    /// Advance one sampling period from `x` with input `u`.
    fn step(&self, x: &Array1<f64>, u: &Array1<f64>) -> Result<Array1<f64>> {
        self.dynamics(x, u)
    }

    /// Apply `inputs` one after the other from `x0`.
    ///
    /// The states are collected as the columns of the returned array, the
    /// first column being `x0`.
    fn simulate(&self, x0: &Array1<f64>, inputs: &[Array1<f64>]) -> Result<Array2<f64>> {
        let mut history = Array2::zeros((x0.len(), inputs.len() + 1).f());
        history.column_mut(0).assign(x0);
        let mut x_curr = x0.clone();
        for (k, u) in inputs.iter().enumerate() {
            let x_next = self.step(&x_curr, u)?;
            history.column_mut(k + 1).assign(&x_next);
            x_curr = x_next;
        }
        Ok(history)
    }
}

impl<D: Dynamics> Stepper for D {}

/// Trajectories of a closed-loop simulation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedLoop {
    /// `n_x` by `steps + 1` states, one per column.
    pub states: Array2<f64>,
    /// `n_u` by `steps` inputs, one per column.
    pub inputs: Array2<f64>,
}

impl ClosedLoop {
    /// Number of inputs actually applied.
    pub fn steps(&self) -> usize {
        self.inputs.ncols()
    }
}

/// Simulate `system` under the receding-horizon law `feedback` for `steps` periods.
///
/// The loop stops early, returning the trajectories so far, when `feedback`
/// yields a non-finite input (e.g. the NaN sentinel of an infeasible state).
pub fn closed_loop<S, F>(system: &S, x0: &Array1<f64>, steps: usize, mut feedback: F) -> Result<ClosedLoop>
where
    S: Stepper + ?Sized,
    F: FnMut(&Array1<f64>) -> Result<Array1<f64>>,
{
    let (n_x, n_u) = (system.n_state(), system.n_input());
    if x0.len() != n_x {
        return Err(MpcError::dimension("initial state", n_x, x0.len()));
    }
    let mut states = vec![x0.clone()];
    let mut inputs = Vec::with_capacity(steps);
    for k in 0..steps {
        let x_curr = &states[k];
        let u = feedback(x_curr)?;
        if u.iter().any(|v| !v.is_finite()) {
            warn!("No admissible input at step {k} from {x_curr}, stopping");
            break;
        }
        let x_next = system.step(x_curr, &u)?;
        inputs.push(u);
        states.push(x_next);
    }
    Ok(ClosedLoop {
        states: stack_columns(&states, n_x),
        inputs: stack_columns(&inputs, n_u),
    })
}

fn stack_columns(columns: &[Array1<f64>], n: usize) -> Array2<f64> {
    let mut mat = Array2::zeros((n, columns.len()).f());
    for (k, col) in columns.iter().enumerate() {
        mat.column_mut(k).assign(col);
    }
    mat
}
