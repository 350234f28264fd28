//! Linear MPC for a single LTI mode $x' = A x + B u$ with
//! $x \in \mathcal{X}$, $u \in \mathcal{U}$ and a terminal set $\mathcal{X}_N$.
//!
//! The optimal control problem is condensed once into a parametric program in
//! $x_0$. It can be solved online at each query ([`MpcController::feedforward`])
//! or, for quadratic objectives, converted offline into a partition of critical
//! regions ([`MpcController::compute_explicit_solution`]).

use log::{debug, info};
use ndarray::{Array1, Array2};

use crate::condensing::{condense_ocp, ObjectiveWeights};
use crate::config::{ControllerConfig, ExplicitConfig};
use crate::dynamics::{AffineSystem, PwaSystem, SwitchingSequence};
use crate::error::{MpcError, Result};
use crate::explicit::{CriticalRegionPartition, MpqpSolver};
use crate::optimization::Clarabel;
use crate::parametric::{destack, CondensedProgram};
use crate::polytope::Polytope;

/// Model predictive controller of a linear system.
///
/// # Examples
/// ```no_run
/// use ndarray::array;
/// use hybrid_mpc::{ControllerConfig, MpcController, ObjectiveNorm, ObjectiveWeights, Polytope};
///
/// let x_set = Polytope::from_bounds(&array![-10.], &array![10.]).unwrap();
/// let u_set = Polytope::from_bounds(&array![-1.], &array![1.]).unwrap();
/// let weights = ObjectiveWeights::new(array![[1.]], array![[1.]], array![[1.]]).unwrap();
/// let controller = MpcController::new(
///     array![[1.]],
///     array![[1.]],
///     ControllerConfig::new(2, ObjectiveNorm::Two),
///     weights,
///     x_set,
///     u_set,
///     None,
/// )
/// .unwrap();
/// let (u, cost) = controller.feedforward(&array![5.]).unwrap();
/// assert!((u[0][0] + 1.).abs() < 1e-6);
/// assert!((cost - 52.).abs() < 1e-5);
/// ```
#[derive(Debug, Clone)]
pub struct MpcController {
    system: PwaSystem,
    config: ControllerConfig,
    weights: ObjectiveWeights,
    terminal_set: Polytope,
    program: CondensedProgram,
    explicit: Option<CriticalRegionPartition>,
}

impl MpcController {
    /// Build and condense the controller.
    ///
    /// The terminal set defaults to the state set. The condensed program
    /// keeps no row that only constrains $x_0$: the rows of $\mathcal{X}$ at
    /// stage 0 are removed, and finding more such rows than $\mathcal{X}$ has
    /// facets is an [`MpcError::InvariantViolation`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: Array2<f64>,
        b: Array2<f64>,
        config: ControllerConfig,
        weights: ObjectiveWeights,
        state_set: Polytope,
        input_set: Polytope,
        terminal_set: Option<Polytope>,
    ) -> Result<Self> {
        if config.horizon == 0 {
            return Err(MpcError::dimension("horizon", 1, 0));
        }
        let max_initial_rows = state_set.n_facets();
        let terminal_set = terminal_set.unwrap_or_else(|| state_set.clone());
        let system = PwaSystem::from_orthogonal_domains(
            vec![AffineSystem::linear(a, b)?],
            &[state_set],
            &[input_set],
        )?;
        let switching_sequence = SwitchingSequence::constant(0, config.horizon);
        let program = condense_ocp(
            &system,
            config.objective_norm,
            &weights,
            &terminal_set,
            &switching_sequence,
        )?;
        let mut program = program.with_solver(Clarabel::new(config.solver.clone()));
        let removed = program.remove_initial_state_constraints(max_initial_rows, config.zero_row_tol)?;
        debug!(
            "Linear MPC with horizon {}: {} constraints after removing {removed} initial-state rows",
            config.horizon,
            program.c().len()
        );
        Ok(Self {
            system,
            config,
            weights,
            terminal_set,
            program,
            explicit: None,
        })
    }

    pub fn system(&self) -> &PwaSystem {
        &self.system
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn weights(&self) -> &ObjectiveWeights {
        &self.weights
    }

    pub fn terminal_set(&self) -> &Polytope {
        &self.terminal_set
    }

    /// The condensed program in $x_0$.
    pub fn program(&self) -> &CondensedProgram {
        &self.program
    }

    /// The critical regions, if [`MpcController::compute_explicit_solution`] was called.
    pub fn explicit_solution(&self) -> Option<&CriticalRegionPartition> {
        self.explicit.as_ref()
    }

    /// Optimal inputs $u_0, \dots, u_{N-1}$ and cost from `x0`.
    ///
    /// Initial states for which the program is infeasible yield NaN inputs and cost.
    pub fn feedforward(&self, x0: &Array1<f64>) -> Result<(Vec<Array1<f64>>, f64)> {
        self.program.solve_staged(x0, self.system.n_u())
    }

    /// First input of the optimal plan.
    pub fn feedback(&self, x0: &Array1<f64>) -> Result<Array1<f64>> {
        let (mut u, _) = self.feedforward(x0)?;
        Ok(u.swap_remove(0))
    }

    /// Explore the critical regions of the condensed QP.
    ///
    /// 1-norm objectives have no such partition here and give
    /// [`MpcError::Unsupported`].
    pub fn compute_explicit_solution(&mut self, config: ExplicitConfig) -> Result<&CriticalRegionPartition> {
        let qp = self.program.as_quadratic().ok_or(MpcError::Unsupported(
            "explicit solutions require a quadratic objective",
        ))?;
        let partition = MpqpSolver::new(config)
            .with_active_set_tol(self.config.active_set_tol)
            .solve(qp)?;
        info!("Explicit solution with {} critical regions", partition.n_regions());
        Ok(self.explicit.insert(partition))
    }

    /// Like [`MpcController::feedforward`], evaluating the affine law of the
    /// critical region containing `x0`.
    ///
    /// Outside the partition the inputs and cost are NaN.
    pub fn feedforward_explicit(&self, x0: &Array1<f64>) -> Result<(Vec<Array1<f64>>, f64)> {
        let partition = self.explicit.as_ref().ok_or(MpcError::ExplicitSolutionUnavailable)?;
        if x0.len() != self.system.n_x() {
            return Err(MpcError::dimension("initial state", self.system.n_x(), x0.len()));
        }
        let n_u = self.system.n_u();
        match partition.evaluate(x0) {
            Some((u, cost)) => Ok((destack(&u, n_u)?, cost)),
            None => Ok((
                vec![Array1::from_elem(n_u, f64::NAN); self.config.horizon],
                f64::NAN,
            )),
        }
    }

    /// Optimal cost $V^*(x_0)$, from the explicit solution when it exists.
    pub fn optimal_value_function(&self, x0: &Array1<f64>) -> Result<f64> {
        match &self.explicit {
            Some(_) => Ok(self.feedforward_explicit(x0)?.1),
            None => Ok(self.program.solve(x0)?.cost),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::config::ObjectiveNorm;

    fn scalar_controller(norm: ObjectiveNorm) -> MpcController {
        MpcController::new(
            array![[1.]],
            array![[1.]],
            ControllerConfig::new(2, norm),
            ObjectiveWeights::new(array![[1.]], array![[1.]], array![[1.]]).unwrap(),
            Polytope::from_bounds(&array![-10.], &array![10.]).unwrap(),
            Polytope::from_bounds(&array![-1.], &array![1.]).unwrap(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_initial_state_rows_are_removed() {
        let controller = scalar_controller(ObjectiveNorm::Two);
        // 4 rows per stage and 2 terminal rows, minus the 2 rows of x_0.
        assert_eq!(controller.program().c().len(), 8);
        assert_eq!(controller.terminal_set(), &Polytope::from_bounds(&array![-10.], &array![10.]).unwrap());
    }

    #[test]
    fn test_too_many_initial_state_rows() {
        // 0 u <= 1 does not involve the inputs either.
        let u_set = Polytope::new(array![[1.], [-1.], [0.]], array![1., 1., 1.]).unwrap();
        let result = MpcController::new(
            array![[1.]],
            array![[1.]],
            ControllerConfig::new(2, ObjectiveNorm::Two),
            ObjectiveWeights::new(array![[1.]], array![[1.]], array![[1.]]).unwrap(),
            Polytope::from_bounds(&array![-10.], &array![10.]).unwrap(),
            u_set,
            None,
        );
        assert!(matches!(result, Err(MpcError::InvariantViolation(_))));
    }

    #[test]
    fn test_feedforward_quadratic() {
        let controller = scalar_controller(ObjectiveNorm::Two);
        let (u, cost) = controller.feedforward(&array![5.]).unwrap();
        assert_eq!(u.len(), 2);
        assert!((u[0][0] + 1.).abs() < 1e-6);
        assert!((u[1][0] + 1.).abs() < 1e-6);
        assert!((cost - 52.).abs() < 1e-5);
        assert!((controller.feedback(&array![5.]).unwrap()[0] + 1.).abs() < 1e-6);
    }

    #[test]
    fn test_feedforward_linear() {
        let controller = scalar_controller(ObjectiveNorm::One);
        let (_, cost) = controller.feedforward(&array![5.]).unwrap();
        assert!((cost - 14.).abs() < 1e-5);
    }

    #[test]
    fn test_feedforward_infeasible_is_nan() {
        let controller = scalar_controller(ObjectiveNorm::Two);
        let (u, cost) = controller.feedforward(&array![20.]).unwrap();
        assert!(cost.is_nan());
        assert!(u.iter().all(|u_k| u_k.iter().all(|v| v.is_nan())));
    }

    #[test]
    fn test_explicit_solution_must_be_computed() {
        let controller = scalar_controller(ObjectiveNorm::Two);
        assert!(controller.explicit_solution().is_none());
        assert!(matches!(
            controller.feedforward_explicit(&array![1.]),
            Err(MpcError::ExplicitSolutionUnavailable)
        ));
    }

    #[test]
    fn test_explicit_solution_matches_online() {
        let mut controller = scalar_controller(ObjectiveNorm::Two);
        let n_regions = controller
            .compute_explicit_solution(ExplicitConfig::default())
            .unwrap()
            .n_regions();
        assert_eq!(n_regions, 5);
        for x in [-10.5, -4., -1., 0.5, 2., 7.] {
            let x0 = array![x];
            let (u_online, cost_online) = controller.feedforward(&x0).unwrap();
            let (u_explicit, cost_explicit) = controller.feedforward_explicit(&x0).unwrap();
            assert!((u_online[0][0] - u_explicit[0][0]).abs() < 1e-4, "x0 = {x}");
            assert!((cost_online - cost_explicit).abs() < 1e-4, "x0 = {x}");
            assert!((controller.optimal_value_function(&x0).unwrap() - cost_online).abs() < 1e-4);
        }
        assert!((controller.feedforward_explicit(&array![1.]).unwrap().0[0][0] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_explicit_solution_outside_is_nan() {
        let mut controller = scalar_controller(ObjectiveNorm::Two);
        controller.compute_explicit_solution(ExplicitConfig::default()).unwrap();
        let (u, cost) = controller.feedforward_explicit(&array![20.]).unwrap();
        assert!(cost.is_nan());
        assert!(u[0][0].is_nan());
        assert!(controller.optimal_value_function(&array![20.]).unwrap().is_nan());
    }

    #[test]
    fn test_explicit_solution_of_linear_objective() {
        let mut controller = scalar_controller(ObjectiveNorm::One);
        assert!(matches!(
            controller.compute_explicit_solution(ExplicitConfig::default()),
            Err(MpcError::Unsupported(_))
        ));
    }
}
