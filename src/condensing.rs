//! Condensing of a finite-horizon optimal control problem for a fixed
//! switching sequence.
//!
//! The stacked input $U = [u_0; \dots; u_{N-1}]$ is the only decision
//! variable left: states are eliminated through the lifted dynamics
//! $X = \bar{A} x_0 + \bar{B} U + \bar{c}$ returned by
//! [`PwaSystem::condense`].

use log::debug;
use ndarray::{concatenate, s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::config::ObjectiveNorm;
use crate::control_theory::{block_diag, dare_iterative};
use crate::dynamics::{AffineSystem, CondensedMatrices, PwaSystem, SwitchingSequence};
use crate::error::{MpcError, Result};
use crate::parametric::{CondensedProgram, ParametricLp, ParametricQp};
use crate::polytope::Polytope;

/// Stage weights $Q$, $R$ and terminal weight $P$.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveWeights {
    pub q: Array2<f64>,
    pub r: Array2<f64>,
    pub p: Array2<f64>,
}

impl ObjectiveWeights {
    pub fn new(q: Array2<f64>, r: Array2<f64>, p: Array2<f64>) -> Result<Self> {
        if q.nrows() != q.ncols() {
            return Err(MpcError::dimension("Q columns", q.nrows(), q.ncols()));
        }
        if r.nrows() != r.ncols() {
            return Err(MpcError::dimension("R columns", r.nrows(), r.ncols()));
        }
        if p.dim() != q.dim() {
            return Err(MpcError::dimension("P rows", q.nrows(), p.nrows()));
        }
        Ok(Self { q, r, p })
    }

    /// Weights whose terminal weight $P$ solves the discrete algebraic Riccati
    /// equation of `system`, the infinite-horizon cost-to-go of the LQR.
    pub fn with_riccati_terminal(system: &AffineSystem, q: Array2<f64>, r: Array2<f64>) -> Result<Self> {
        let p = dare_iterative(&system.a, &system.b, &q, &r, None, None)?;
        Self::new(q, r, p)
    }

    /// $\bar{Q} = \text{blkdiag}(Q, \dots, Q, P)$ and $\bar{R} = \text{blkdiag}(R, \dots, R)$.
    pub fn stacked(&self, horizon: usize) -> (Array2<f64>, Array2<f64>) {
        let mut q_blocks: Vec<&Array2<f64>> = vec![&self.q; horizon];
        q_blocks.push(&self.p);
        let r_blocks: Vec<&Array2<f64>> = vec![&self.r; horizon];
        (block_diag(&q_blocks), block_diag(&r_blocks))
    }

    fn check(&self, system: &PwaSystem) -> Result<()> {
        if self.q.nrows() != system.n_x() {
            return Err(MpcError::dimension("Q rows", system.n_x(), self.q.nrows()));
        }
        if self.r.nrows() != system.n_u() {
            return Err(MpcError::dimension("R rows", system.n_u(), self.r.nrows()));
        }
        Ok(())
    }
}

/// Stacked constraints $G U \le W + E x_0$.
#[derive(Debug, Clone, PartialEq)]
pub struct CondensedConstraints {
    pub g: Array2<f64>,
    pub w: Array1<f64>,
    pub e: Array2<f64>,
}

/// Residuals of the 1-norm objective $\sum_i |(F_u U + F_x x_0 + F)_i|$.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearObjective {
    pub f_u: Array2<f64>,
    pub f_x: Array2<f64>,
    pub f: Array1<f64>,
}

/// $\tfrac{1}{2} U^\text{T} F_{uu} U + x_0^\text{T} F_{xu} U + F_u^\text{T} U
///  + \tfrac{1}{2} x_0^\text{T} F_{xx} x_0 + F_x^\text{T} x_0 + F$.
#[derive(Debug, Clone, PartialEq)]
pub struct QuadraticObjective {
    pub f_uu: Array2<f64>,
    pub f_xu: Array2<f64>,
    pub f_xx: Array2<f64>,
    pub f_u: Array1<f64>,
    pub f_x: Array1<f64>,
    pub f: f64,
}

/// Stack the domain of every stage and the terminal set into $G U \le W + E x_0$.
///
/// With the domain of stage $k$ split as $D_k x + E_k u \le f_k$, the state
/// rows $L_x = \text{blkdiag}(D_0, \dots, D_{N-1}, X_N)$ and input rows
/// $L_u = \text{blkdiag}(E_0, \dots, E_{N-1})$ (padded with zero rows for
/// the terminal set) give
/// $G = L_x \bar{B} + L_u$, $W = \text{rhs} - L_x \bar{c}$, $E = -L_x \bar{A}$.
pub fn constraint_condenser(
    system: &PwaSystem,
    terminal_set: &Polytope,
    switching_sequence: &SwitchingSequence,
) -> Result<CondensedConstraints> {
    let n_x = system.n_x();
    if terminal_set.dim() != n_x {
        return Err(MpcError::dimension("terminal set", n_x, terminal_set.dim()));
    }
    let lifted = system.condense(switching_sequence)?;
    let domains: Vec<&Polytope> = switching_sequence
        .iter()
        .map(|&mode| &system.domains()[mode])
        .collect();

    let lhs_x_blocks: Vec<Array2<f64>> = domains
        .iter()
        .map(|d| d.lhs().slice(s![.., ..n_x]).to_owned())
        .chain(std::iter::once(terminal_set.lhs().clone()))
        .collect();
    let lhs_u_blocks: Vec<Array2<f64>> = domains
        .iter()
        .map(|d| d.lhs().slice(s![.., n_x..]).to_owned())
        .collect();
    let lhs_x = block_diag(&lhs_x_blocks.iter().collect::<Vec<_>>());
    let lhs_u = block_diag(&lhs_u_blocks.iter().collect::<Vec<_>>());
    let lhs_u = concatenate![
        Axis(0),
        lhs_u,
        Array2::<f64>::zeros((terminal_set.n_facets(), lhs_u.ncols()))
    ];
    let rhs_blocks: Vec<_> = domains
        .iter()
        .map(|d| d.rhs().view())
        .chain(std::iter::once(terminal_set.rhs().view()))
        .collect();
    let rhs = ndarray::concatenate(Axis(0), &rhs_blocks)
        .map_err(|e| MpcError::InvariantViolation(e.to_string()))?;

    Ok(CondensedConstraints {
        g: lhs_x.dot(&lifted.b_bar) + lhs_u,
        w: rhs - lhs_x.dot(&lifted.c_bar),
        e: -lhs_x.dot(&lifted.a_bar),
    })
}

fn check_stacked_weights(lifted: &CondensedMatrices, q_bar: &Array2<f64>, r_bar: &Array2<f64>) -> Result<()> {
    let n_states = lifted.a_bar.nrows();
    let n_inputs = lifted.b_bar.ncols();
    if q_bar.dim() != (n_states, n_states) {
        return Err(MpcError::dimension("stacked state weight", n_states, q_bar.nrows()));
    }
    if r_bar.dim() != (n_inputs, n_inputs) {
        return Err(MpcError::dimension("stacked input weight", n_inputs, r_bar.nrows()));
    }
    Ok(())
}

/// $F_u = [\bar{Q}\bar{B}; \bar{R}]$, $F_x = [\bar{Q}\bar{A}; 0]$, $F = [\bar{Q}\bar{c}; 0]$.
pub fn linear_objective_condenser(
    lifted: &CondensedMatrices,
    q_bar: &Array2<f64>,
    r_bar: &Array2<f64>,
) -> Result<LinearObjective> {
    check_stacked_weights(lifted, q_bar, r_bar)?;
    let n_x = lifted.a_bar.ncols();
    Ok(LinearObjective {
        f_u: concatenate![Axis(0), q_bar.dot(&lifted.b_bar), *r_bar],
        f_x: concatenate![
            Axis(0),
            q_bar.dot(&lifted.a_bar),
            Array2::<f64>::zeros((r_bar.nrows(), n_x))
        ],
        f: concatenate![
            Axis(0),
            q_bar.dot(&lifted.c_bar),
            Array1::<f64>::zeros(r_bar.nrows())
        ],
    })
}

/// The quadratic cost $X^\text{T}\bar{Q}X + U^\text{T}\bar{R}U$ in condensed form.
///
/// $F_{uu} = 2(\bar{R} + \bar{B}^\text{T}\bar{Q}\bar{B})$,
/// $F_{xu} = 2\bar{A}^\text{T}\bar{Q}\bar{B}$,
/// $F_{xx} = 2\bar{A}^\text{T}\bar{Q}\bar{A}$,
/// $F_u = 2\bar{B}^\text{T}\bar{Q}\bar{c}$,
/// $F_x = 2\bar{A}^\text{T}\bar{Q}\bar{c}$,
/// $F = \bar{c}^\text{T}\bar{Q}\bar{c}$.
pub fn quadratic_objective_condenser(
    lifted: &CondensedMatrices,
    q_bar: &Array2<f64>,
    r_bar: &Array2<f64>,
) -> Result<QuadraticObjective> {
    check_stacked_weights(lifted, q_bar, r_bar)?;
    let CondensedMatrices { a_bar, b_bar, c_bar } = lifted;
    let q_b = q_bar.dot(b_bar);
    let q_a = q_bar.dot(a_bar);
    let q_c = q_bar.dot(c_bar);
    Ok(QuadraticObjective {
        f_uu: (r_bar + &b_bar.t().dot(&q_b)) * 2.,
        f_xu: a_bar.t().dot(&q_b) * 2.,
        f_xx: a_bar.t().dot(&q_a) * 2.,
        f_u: b_bar.t().dot(&q_c) * 2.,
        f_x: a_bar.t().dot(&q_c) * 2.,
        f: c_bar.dot(&q_c),
    })
}

/// Condense the optimal control problem of `switching_sequence` into a
/// parametric LP (1-norm) or QP (2-norm) in the initial state.
pub fn condense_ocp(
    system: &PwaSystem,
    objective_norm: ObjectiveNorm,
    weights: &ObjectiveWeights,
    terminal_set: &Polytope,
    switching_sequence: &SwitchingSequence,
) -> Result<CondensedProgram> {
    weights.check(system)?;
    let (q_bar, r_bar) = weights.stacked(switching_sequence.len());
    let constraints = constraint_condenser(system, terminal_set, switching_sequence)?;
    let lifted = system.condense(switching_sequence)?;
    let CondensedConstraints { g, w, e } = constraints;
    let program = match objective_norm {
        ObjectiveNorm::One => {
            let LinearObjective { f_u, f_x, f } = linear_objective_condenser(&lifted, &q_bar, &r_bar)?;
            CondensedProgram::Linear(ParametricLp::new(f_u, f_x, f, g, e, w)?)
        }
        ObjectiveNorm::Two => {
            let QuadraticObjective {
                f_uu,
                f_xu,
                f_xx,
                f_u,
                f_x,
                f,
            } = quadratic_objective_condenser(&lifted, &q_bar, &r_bar)?;
            CondensedProgram::Quadratic(ParametricQp::new(f_uu, f_xu, f_xx, f_u, f_x, f, g, e, w)?)
        }
    };
    debug!(
        "Condensed {objective_norm:?}-norm program for switching sequence {switching_sequence} with {} constraints",
        program.c().len()
    );
    Ok(program)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::control_theory::dlqr;
    use crate::dynamics::tests::two_mode_system;

    fn scalar_system() -> PwaSystem {
        PwaSystem::from_orthogonal_domains(
            vec![AffineSystem::linear(array![[1.]], array![[1.]]).unwrap()],
            &[Polytope::from_bounds(&array![-10.], &array![10.]).unwrap()],
            &[Polytope::from_bounds(&array![-1.], &array![1.]).unwrap()],
        )
        .unwrap()
    }

    fn unit_weights() -> ObjectiveWeights {
        ObjectiveWeights::new(array![[1.]], array![[1.]], array![[1.]]).unwrap()
    }

    #[test]
    fn test_stacked_weights() {
        let weights = ObjectiveWeights::new(array![[1.]], array![[2.]], array![[3.]]).unwrap();
        let (q_bar, r_bar) = weights.stacked(2);
        assert_eq!(q_bar, array![[1., 0., 0.], [0., 1., 0.], [0., 0., 3.]]);
        assert_eq!(r_bar, array![[2., 0.], [0., 2.]]);
    }

    #[test]
    fn test_constraint_condenser_dimensions() {
        let system = scalar_system();
        let terminal = Polytope::from_bounds(&array![-10.], &array![10.]).unwrap();
        let constraints =
            constraint_condenser(&system, &terminal, &SwitchingSequence::constant(0, 2)).unwrap();
        // 4 rows per stage plus 2 terminal rows.
        assert_eq!(constraints.g.dim(), (10, 2));
        assert_eq!(constraints.e.dim(), (10, 1));
        assert_eq!(constraints.w.len(), 10);
        // Terminal row x_2 <= 10 reads u_0 + u_1 <= 10 - x_0.
        assert_eq!(constraints.g.row(8).to_vec(), vec![1., 1.]);
        assert_eq!(constraints.e[(8, 0)], -1.);
        assert_eq!(constraints.w[8], 10.);
        // The state rows of stage 0 do not involve the inputs.
        assert_eq!(constraints.g.row(0).to_vec(), vec![0., 0.]);
    }

    #[test]
    fn test_constraint_condenser_is_satisfied_by_feasible_trajectory() {
        let system = two_mode_system();
        let terminal = Polytope::from_bounds(&array![-10.], &array![10.]).unwrap();
        let ss = SwitchingSequence::constant(1, 2);
        let constraints = constraint_condenser(&system, &terminal, &ss).unwrap();
        let x0 = array![5.];
        let u = array![-1., -1.];
        let lhs = constraints.g.dot(&u);
        let rhs = &constraints.w + &constraints.e.dot(&x0);
        assert!(lhs.iter().zip(rhs.iter()).all(|(l, r)| *l <= r + 1e-12));
        // x_0 = 0 is outside the domain of mode 1.
        let rhs = &constraints.w + &constraints.e.dot(&array![0.]);
        assert!(lhs.iter().zip(rhs.iter()).any(|(l, r)| *l > r + 1e-12));
    }

    #[test]
    fn test_quadratic_objective_matches_trajectory_cost() {
        let system = scalar_system();
        let ss = SwitchingSequence::constant(0, 2);
        let lifted = system.condense(&ss).unwrap();
        let (q_bar, r_bar) = unit_weights().stacked(2);
        let obj = quadratic_objective_condenser(&lifted, &q_bar, &r_bar).unwrap();
        let x0 = array![5.];
        let u = array![-1., -1.];
        let cost = 0.5 * u.dot(&obj.f_uu.dot(&u))
            + x0.dot(&obj.f_xu.dot(&u))
            + obj.f_u.dot(&u)
            + 0.5 * x0.dot(&obj.f_xx.dot(&x0))
            + obj.f_x.dot(&x0)
            + obj.f;
        // 25 + 16 + 9 + 1 + 1
        assert!((cost - 52.).abs() < 1e-12);
        assert_eq!(obj.f_uu, array![[6., 2.], [2., 4.]]);
    }

    #[test]
    fn test_linear_objective_matches_trajectory_cost() {
        let system = scalar_system();
        let ss = SwitchingSequence::constant(0, 2);
        let lifted = system.condense(&ss).unwrap();
        let (q_bar, r_bar) = unit_weights().stacked(2);
        let obj = linear_objective_condenser(&lifted, &q_bar, &r_bar).unwrap();
        let x0 = array![5.];
        let u = array![-1., -1.];
        let residual = obj.f_u.dot(&u) + obj.f_x.dot(&x0) + &obj.f;
        let cost: f64 = residual.iter().map(|r| r.abs()).sum();
        // 5 + 4 + 3 + 1 + 1
        assert!((cost - 14.).abs() < 1e-12);
    }

    #[test]
    fn test_affine_offset_enters_objective() {
        let system = PwaSystem::from_orthogonal_domains(
            vec![AffineSystem::new(array![[1.]], array![[1.]], array![1.]).unwrap()],
            &[Polytope::from_bounds(&array![-10.], &array![10.]).unwrap()],
            &[Polytope::from_bounds(&array![-1.], &array![1.]).unwrap()],
        )
        .unwrap();
        let lifted = system.condense(&SwitchingSequence::constant(0, 1)).unwrap();
        let (q_bar, r_bar) = unit_weights().stacked(1);
        let obj = quadratic_objective_condenser(&lifted, &q_bar, &r_bar).unwrap();
        // x_1 = x_0 + u_0 + 1, cost at x_0 = u_0 = 0 is 1.
        assert!((obj.f - 1.).abs() < 1e-12);
        assert_eq!(obj.f_u, array![2.]);
    }

    #[test]
    fn test_condense_ocp_norms() {
        let system = scalar_system();
        let terminal = Polytope::from_bounds(&array![-10.], &array![10.]).unwrap();
        let ss = SwitchingSequence::constant(0, 2);
        let qp = condense_ocp(&system, ObjectiveNorm::Two, &unit_weights(), &terminal, &ss).unwrap();
        assert!(matches!(qp, CondensedProgram::Quadratic(_)));
        let sol = qp.solve(&array![5.]).unwrap();
        assert!((sol.cost - 52.).abs() < 1e-5);
        assert!(sol.u[0].abs() <= 1. + 1e-6);

        let lp = condense_ocp(&system, ObjectiveNorm::One, &unit_weights(), &terminal, &ss).unwrap();
        assert!(matches!(lp, CondensedProgram::Linear(_)));
        let sol = lp.solve(&array![5.]).unwrap();
        assert!((sol.cost - 14.).abs() < 1e-5);
    }

    #[test]
    fn test_condense_ocp_checks_weights() {
        let system = scalar_system();
        let terminal = Polytope::from_bounds(&array![-10.], &array![10.]).unwrap();
        let weights = ObjectiveWeights::new(Array2::eye(2), array![[1.]], Array2::eye(2)).unwrap();
        let err = condense_ocp(
            &system,
            ObjectiveNorm::Two,
            &weights,
            &terminal,
            &SwitchingSequence::constant(0, 2),
        );
        assert!(matches!(err, Err(MpcError::Dimension { .. })));
    }

    #[test]
    fn test_riccati_terminal_weight_recovers_lqr() {
        let mode = AffineSystem::linear(array![[1.]], array![[1.]]).unwrap();
        let weights = ObjectiveWeights::with_riccati_terminal(&mode, array![[1.]], array![[1.]]).unwrap();
        let (k_mat, p_mat) = dlqr(&mode.a, &mode.b, &weights.q, &weights.r, None, None).unwrap();
        assert_eq!(weights.p, p_mat);

        // Far from the bounds, the first MPC input is the LQR input for any horizon.
        let system = PwaSystem::from_orthogonal_domains(
            vec![mode],
            &[Polytope::from_bounds(&array![-100.], &array![100.]).unwrap()],
            &[Polytope::from_bounds(&array![-100.], &array![100.]).unwrap()],
        )
        .unwrap();
        let terminal = Polytope::from_bounds(&array![-100.], &array![100.]).unwrap();
        let program = condense_ocp(
            &system,
            ObjectiveNorm::Two,
            &weights,
            &terminal,
            &SwitchingSequence::constant(0, 3),
        )
        .unwrap();
        let sol = program.solve(&array![1.]).unwrap();
        assert!((sol.u[0] + k_mat[(0, 0)]).abs() < 1e-6);
    }
}
