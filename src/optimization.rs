//! Continuous LP/QP solves on top of Clarabel.
//!
//! Programs are written in the dense form
//! $$ \min_x \tfrac{1}{2} x^\text{T} H x + f^\text{T} x \quad \text{s.t.} \quad A x \le b,\ A_\text{eq} x = b_\text{eq} $$
//! and converted to Clarabel's conic form ($A x + s = b$, $s$ in the
//! zero cone for equalities and the nonnegative cone for inequalities).
//!
//! Infeasibility is an expected outcome and is reported through
//! [`SolveStatus`] with a NaN-filled [`ProgramSolution`], never as an error.

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus,
    SupportedConeT::{NonnegativeConeT, ZeroConeT},
};
use log::debug;
use ndarray::{concatenate, Array1, Array2, Axis};

use crate::config::SolverSettings;
use crate::error::{MpcError, Result};

/// Outcome of a continuous solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    Unbounded,
    TimeLimit,
    /// The backend stopped without a certificate (iteration limit, numerical issues).
    Failed,
}

/// Primal solution, optimal value and inequality multipliers of a program.
#[derive(Debug, Clone)]
pub struct ProgramSolution {
    pub status: SolveStatus,
    pub argmin: Array1<f64>,
    pub min: f64,
    pub inequality_duals: Array1<f64>,
}

impl ProgramSolution {
    /// The NaN sentinel returned for every non-optimal outcome.
    pub fn sentinel(status: SolveStatus, n_var: usize, n_ineq: usize) -> Self {
        Self {
            status,
            argmin: Array1::from_elem(n_var, f64::NAN),
            min: f64::NAN,
            inequality_duals: Array1::from_elem(n_ineq, f64::NAN),
        }
    }

    pub fn is_optimal(&self) -> bool {
        self.status == SolveStatus::Optimal
    }
}

/// A dense convex program.
#[derive(Debug, Clone, Copy)]
pub struct ConvexProgram<'a> {
    /// Hessian $H$; `None` for a linear program.
    pub hessian: Option<&'a Array2<f64>>,
    pub cost: &'a Array1<f64>,
    pub a_ineq: &'a Array2<f64>,
    pub b_ineq: &'a Array1<f64>,
    pub a_eq: Option<&'a Array2<f64>>,
    pub b_eq: Option<&'a Array1<f64>>,
}

/// LP/QP solver backed by Clarabel's interior-point method.
#[derive(Debug, Clone, Default)]
pub struct Clarabel {
    settings: SolverSettings,
}

impl Clarabel {
    pub fn new(settings: SolverSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    /// $\min f^\text{T} x$ s.t. $A x \le b$.
    pub fn linear_program(
        &self,
        cost: &Array1<f64>,
        a_mat: &Array2<f64>,
        b_vec: &Array1<f64>,
    ) -> Result<ProgramSolution> {
        self.solve(&ConvexProgram {
            hessian: None,
            cost,
            a_ineq: a_mat,
            b_ineq: b_vec,
            a_eq: None,
            b_eq: None,
        })
    }

    /// $\min \tfrac{1}{2} x^\text{T} H x + f^\text{T} x$ s.t. $A x \le b$.
    pub fn quadratic_program(
        &self,
        h_mat: &Array2<f64>,
        f_vec: &Array1<f64>,
        a_mat: &Array2<f64>,
        b_vec: &Array1<f64>,
    ) -> Result<ProgramSolution> {
        self.solve(&ConvexProgram {
            hessian: Some(h_mat),
            cost: f_vec,
            a_ineq: a_mat,
            b_ineq: b_vec,
            a_eq: None,
            b_eq: None,
        })
    }

    /// Solve a general dense program.
    pub fn solve(&self, program: &ConvexProgram) -> Result<ProgramSolution> {
        let n_var = program.cost.len();
        check_rows("inequality", program.a_ineq, program.b_ineq, n_var)?;
        let n_ineq = program.a_ineq.nrows();

        let (a_eq, b_eq) = match (program.a_eq, program.b_eq) {
            (Some(a_eq), Some(b_eq)) => {
                check_rows("equality", a_eq, b_eq, n_var)?;
                (a_eq.clone(), b_eq.clone())
            }
            _ => (Array2::zeros((0, n_var)), Array1::zeros(0)),
        };
        let n_eq = a_eq.nrows();

        // Clarabel needs at least one constraint row.
        let (a_ineq, b_ineq) = if n_eq + n_ineq == 0 {
            (Array2::zeros((1, n_var)), Array1::ones(1))
        } else {
            (program.a_ineq.clone(), program.b_ineq.clone())
        };

        let a_all = concatenate![Axis(0), a_eq, a_ineq];
        let b_all = concatenate![Axis(0), b_eq, b_ineq];
        let p_csc = match program.hessian {
            Some(h_mat) => {
                if h_mat.dim() != (n_var, n_var) {
                    return Err(MpcError::dimension("hessian rows", n_var, h_mat.nrows()));
                }
                dense_to_csc_upper_tri(&((h_mat + &h_mat.t()) * 0.5))
            }
            None => CscMatrix::zeros((n_var, n_var)),
        };
        let a_csc = dense_to_csc(&a_all);
        let mut cones = Vec::with_capacity(2);
        if n_eq > 0 {
            cones.push(ZeroConeT(n_eq));
        }
        if a_all.nrows() > n_eq {
            cones.push(NonnegativeConeT(a_all.nrows() - n_eq));
        }

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.settings.max_iter)
            .time_limit(self.settings.time_limit.unwrap_or(f64::INFINITY))
            .verbose(false)
            .tol_gap_abs(self.settings.tol_gap_abs)
            .tol_gap_rel(self.settings.tol_gap_rel)
            .tol_feas(self.settings.tol_feas)
            .build()
            .map_err(|e| MpcError::Solver(e.to_string()))?;

        let q_slice: Vec<f64> = program.cost.iter().copied().collect();
        let b_slice: Vec<f64> = b_all.iter().copied().collect();
        let mut solver = DefaultSolver::new(&p_csc, &q_slice, &a_csc, &b_slice, &cones, settings)
            .map_err(|e| MpcError::Solver(format!("{e:?}")))?;
        solver.solve();
        let sol = &solver.solution;

        let status = solve_status(sol.status);
        if status != SolveStatus::Optimal {
            return Ok(ProgramSolution::sentinel(status, n_var, n_ineq));
        }

        Ok(ProgramSolution {
            status,
            argmin: Array1::from_vec(sol.x.clone()),
            min: sol.obj_val,
            inequality_duals: Array1::from_iter(sol.z.iter().skip(n_eq).take(n_ineq).copied()),
        })
    }
}

fn solve_status(status: SolverStatus) -> SolveStatus {
    match status {
        SolverStatus::Solved => SolveStatus::Optimal,
        SolverStatus::AlmostSolved => {
            debug!("Clarabel reached reduced accuracy only, accepting as optimal");
            SolveStatus::Optimal
        }
        SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => SolveStatus::Infeasible,
        SolverStatus::DualInfeasible | SolverStatus::AlmostDualInfeasible => SolveStatus::Unbounded,
        SolverStatus::MaxTime => SolveStatus::TimeLimit,
        _ => SolveStatus::Failed,
    }
}

/// Solve an LP with the default (tight) settings.
pub fn linear_program(
    cost: &Array1<f64>,
    a_mat: &Array2<f64>,
    b_vec: &Array1<f64>,
) -> Result<ProgramSolution> {
    Clarabel::default().linear_program(cost, a_mat, b_vec)
}

/// Solve a QP with the default (tight) settings.
pub fn quadratic_program(
    h_mat: &Array2<f64>,
    f_vec: &Array1<f64>,
    a_mat: &Array2<f64>,
    b_vec: &Array1<f64>,
) -> Result<ProgramSolution> {
    Clarabel::default().quadratic_program(h_mat, f_vec, a_mat, b_vec)
}

fn check_rows(context: &str, a_mat: &Array2<f64>, b_vec: &Array1<f64>, n_var: usize) -> Result<()> {
    if a_mat.ncols() != n_var {
        return Err(MpcError::dimension(
            format!("{context} constraint columns"),
            n_var,
            a_mat.ncols(),
        ));
    }
    if a_mat.nrows() != b_vec.len() {
        return Err(MpcError::dimension(
            format!("{context} right-hand side"),
            a_mat.nrows(),
            b_vec.len(),
        ));
    }
    Ok(())
}

/// Convert a dense matrix to a Clarabel `CscMatrix` (full matrix).
fn dense_to_csc(m: &Array2<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.dim();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..nrows {
            let v = m[(i, j)];
            if v != 0. {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}

/// Convert a symmetric dense matrix to an upper-triangular `CscMatrix`.
fn dense_to_csc_upper_tri(m: &Array2<f64>) -> CscMatrix<f64> {
    let (nrows, ncols) = m.dim();
    let mut colptr = vec![0usize; ncols + 1];
    let mut rowval = Vec::new();
    let mut nzval = Vec::new();

    for j in 0..ncols {
        for i in 0..=j.min(nrows.saturating_sub(1)) {
            let v = m[(i, j)];
            if v != 0. {
                rowval.push(i);
                nzval.push(v);
            }
        }
        colptr[j + 1] = rowval.len();
    }

    CscMatrix::new(nrows, ncols, colptr, rowval, nzval)
}
