//! Parametric linear and quadratic programs in the initial state $x_0$.
//!
//! Both programs have the constraints $C_u U \le C_x x_0 + C$, where $U$
//! stacks the inputs of the horizon. [`ParametricQp`] also exposes the
//! closed-form active-set sensitivities used to build explicit solutions.

use std::cell::OnceCell;

use log::{debug, warn};
use ndarray::{concatenate, s, Array1, Array2, Axis};
use ndarray_linalg::{Cholesky, Inverse, UPLO};
use serde::{Deserialize, Serialize};

use crate::control_theory::{linearly_independent_rows, rank};
use crate::error::{MpcError, Result};
use crate::optimization::{Clarabel, SolveStatus};
use crate::polytope::Polytope;

/// Rows of an active set whose $R$ diagonal is below this value are deflated.
const DEFLATION_TOL: f64 = 1e-6;

/// Optimal stacked input and cost of a parametric program at one $x_0$.
///
/// Infeasible (or otherwise unsolved) programs yield NaN-filled inputs and a
/// NaN cost, with the reason kept in `status`.
#[derive(Debug, Clone)]
pub struct ParametricSolution {
    pub u: Array1<f64>,
    pub cost: f64,
    pub status: SolveStatus,
}

impl ParametricSolution {
    pub fn infeasible(n_u: usize, status: SolveStatus) -> Self {
        Self {
            u: Array1::from_elem(n_u, f64::NAN),
            cost: f64::NAN,
            status,
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.status == SolveStatus::Optimal && !self.cost.is_nan()
    }

    /// De-stack the input into per-stage vectors of length `n_u`.
    pub fn staged(&self, n_u: usize) -> Result<Vec<Array1<f64>>> {
        destack(&self.u, n_u)
    }
}

/// Split a stacked vector into consecutive chunks of length `n`.
pub fn destack(stacked: &Array1<f64>, n: usize) -> Result<Vec<Array1<f64>>> {
    if n == 0 || stacked.len() % n != 0 {
        return Err(MpcError::dimension(
            "stage length dividing the stacked input",
            n,
            stacked.len(),
        ));
    }
    Ok(stacked
        .exact_chunks(n)
        .into_iter()
        .map(|chunk| chunk.to_owned())
        .collect())
}

fn check_constraints(c_u: &Array2<f64>, c_x: &Array2<f64>, c: &Array1<f64>) -> Result<()> {
    if c_x.nrows() != c_u.nrows() {
        return Err(MpcError::dimension("C_x rows", c_u.nrows(), c_x.nrows()));
    }
    if c.len() != c_u.nrows() {
        return Err(MpcError::dimension("C length", c_u.nrows(), c.len()));
    }
    Ok(())
}

/// Indices of the rows of `c_u` with a norm below `tol`.
fn zero_rows(c_u: &Array2<f64>, tol: f64) -> Vec<usize> {
    c_u.rows()
        .into_iter()
        .enumerate()
        .filter(|(_, row)| row.dot(row).sqrt() < tol)
        .map(|(i, _)| i)
        .collect()
}

fn delete_rows(mat: &Array2<f64>, rows: &[usize]) -> Array2<f64> {
    let keep: Vec<usize> = (0..mat.nrows()).filter(|i| !rows.contains(i)).collect();
    mat.select(Axis(0), &keep)
}

fn delete_entries(vec: &Array1<f64>, rows: &[usize]) -> Array1<f64> {
    let keep: Vec<usize> = (0..vec.len()).filter(|i| !rows.contains(i)).collect();
    vec.select(Axis(0), &keep)
}

/// The lifted polytope $\{(x_0, U) : -C_x x_0 + C_u U \le C\}$.
fn lifted_polytope(c_u: &Array2<f64>, c_x: &Array2<f64>, c: &Array1<f64>) -> Result<Polytope> {
    Polytope::new(concatenate![Axis(1), -c_x, *c_u], c.clone())
}

/// Projection of the lifted polytope onto $x_0$, `None` if it is empty.
fn project_feasible_set(c_u: &Array2<f64>, c_x: &Array2<f64>, c: &Array1<f64>) -> Result<Option<Polytope>> {
    let lifted = lifted_polytope(c_u, c_x, c)?;
    let dims: Vec<usize> = (0..c_x.ncols()).collect();
    lifted.orthogonal_projection(&dims)
}

fn cached_feasible_set<'a>(
    cache: &'a OnceCell<Option<Polytope>>,
    compute: impl FnOnce() -> Result<Option<Polytope>>,
) -> Result<Option<&'a Polytope>> {
    if cache.get().is_none() {
        let feasible_set = compute()?;
        // The cell is empty, so this cannot fail.
        let _ = cache.set(feasible_set);
    }
    Ok(cache.get().and_then(|f| f.as_ref()))
}

/// Slack reformulation $\min f^\text{T} z$ s.t. $A z \le B x_0 + c$ of a [`ParametricLp`].
#[derive(Debug, Clone, PartialEq)]
pub struct StandardLp {
    pub f: Array1<f64>,
    pub a: Array2<f64>,
    pub b: Array2<f64>,
    pub c: Array1<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LpMatrices {
    f_u: Array2<f64>,
    f_x: Array2<f64>,
    f: Array1<f64>,
    c_u: Array2<f64>,
    c_x: Array2<f64>,
    c: Array1<f64>,
}

/// $\min \sum_i |(F_u U + F_x x_0 + F)_i|$ s.t. $C_u U \le C_x x_0 + C$.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "LpMatrices", into = "LpMatrices")]
pub struct ParametricLp {
    raw: LpMatrices,
    standard: StandardLp,
    feasible_set: OnceCell<Option<Polytope>>,
    solver: Clarabel,
}

impl TryFrom<LpMatrices> for ParametricLp {
    type Error = MpcError;

    fn try_from(raw: LpMatrices) -> Result<Self> {
        Self::new(raw.f_u, raw.f_x, raw.f, raw.c_u, raw.c_x, raw.c)
    }
}

impl From<ParametricLp> for LpMatrices {
    fn from(lp: ParametricLp) -> Self {
        lp.raw
    }
}

impl ParametricLp {
    pub fn new(
        f_u: Array2<f64>,
        f_x: Array2<f64>,
        f: Array1<f64>,
        c_u: Array2<f64>,
        c_x: Array2<f64>,
        c: Array1<f64>,
    ) -> Result<Self> {
        if f_x.nrows() != f_u.nrows() {
            return Err(MpcError::dimension("F_x rows", f_u.nrows(), f_x.nrows()));
        }
        if f.len() != f_u.nrows() {
            return Err(MpcError::dimension("F length", f_u.nrows(), f.len()));
        }
        if c_u.ncols() != f_u.ncols() {
            return Err(MpcError::dimension("C_u columns", f_u.ncols(), c_u.ncols()));
        }
        if c_x.ncols() != f_x.ncols() {
            return Err(MpcError::dimension("C_x columns", f_x.ncols(), c_x.ncols()));
        }
        check_constraints(&c_u, &c_x, &c)?;
        let raw = LpMatrices {
            f_u,
            f_x,
            f,
            c_u,
            c_x,
            c,
        };
        let standard = Self::add_slack_variables(&raw);
        Ok(Self {
            raw,
            standard,
            feasible_set: OnceCell::new(),
            solver: Clarabel::default(),
        })
    }

    /// Use the given backend for every solve of this program.
    pub fn with_solver(mut self, solver: Clarabel) -> Self {
        self.solver = solver;
        self
    }

    // z = [U; t], f = [0; 1], A = [[C_u, 0], [F_u, -I], [-F_u, -I]]
    fn add_slack_variables(raw: &LpMatrices) -> StandardLp {
        let n_slack = raw.f.len();
        let n_u = raw.f_u.ncols();
        let eye = Array2::<f64>::eye(n_slack);
        let f = concatenate![Axis(0), Array1::<f64>::zeros(n_u), Array1::<f64>::ones(n_slack)];
        let a = concatenate![
            Axis(0),
            concatenate![Axis(1), raw.c_u, Array2::<f64>::zeros((raw.c_u.nrows(), n_slack))],
            concatenate![Axis(1), raw.f_u, -&eye],
            concatenate![Axis(1), -&raw.f_u, -&eye]
        ];
        let b = concatenate![Axis(0), raw.c_x, -&raw.f_x, raw.f_x];
        let c = concatenate![Axis(0), raw.c, -&raw.f, raw.f];
        StandardLp { f, a, b, c }
    }

    pub fn f_u(&self) -> &Array2<f64> {
        &self.raw.f_u
    }

    pub fn f_x(&self) -> &Array2<f64> {
        &self.raw.f_x
    }

    pub fn f(&self) -> &Array1<f64> {
        &self.raw.f
    }

    pub fn c_u(&self) -> &Array2<f64> {
        &self.raw.c_u
    }

    pub fn c_x(&self) -> &Array2<f64> {
        &self.raw.c_x
    }

    pub fn c(&self) -> &Array1<f64> {
        &self.raw.c
    }

    pub fn standard_form(&self) -> &StandardLp {
        &self.standard
    }

    /// Length of the stacked input $U$.
    pub fn n_u(&self) -> usize {
        self.raw.f_u.ncols()
    }

    /// Dimension of the parameter $x_0$.
    pub fn n_x(&self) -> usize {
        self.raw.f_x.ncols()
    }

    pub fn solve(&self, x0: &Array1<f64>) -> Result<ParametricSolution> {
        if x0.len() != self.n_x() {
            return Err(MpcError::dimension("initial state", self.n_x(), x0.len()));
        }
        let rhs = self.standard.b.dot(x0) + &self.standard.c;
        let sol = self.solver.linear_program(&self.standard.f, &self.standard.a, &rhs)?;
        if !sol.is_optimal() {
            return Ok(ParametricSolution::infeasible(self.n_u(), sol.status));
        }
        Ok(ParametricSolution {
            u: sol.argmin.slice(s![..self.n_u()]).to_owned(),
            cost: sol.min,
            status: sol.status,
        })
    }

    pub fn solve_staged(&self, x0: &Array1<f64>, n_u: usize) -> Result<(Vec<Array1<f64>>, f64)> {
        let sol = self.solve(x0)?;
        Ok((sol.staged(n_u)?, sol.cost))
    }

    pub fn lifted_polytope(&self) -> Result<Polytope> {
        lifted_polytope(&self.raw.c_u, &self.raw.c_x, &self.raw.c)
    }

    /// Set of initial states for which the program is feasible (memoized).
    pub fn feasible_set(&self) -> Result<Option<&Polytope>> {
        cached_feasible_set(&self.feasible_set, || {
            project_feasible_set(&self.raw.c_u, &self.raw.c_x, &self.raw.c)
        })
    }

    /// Remove the rows with $\|(C_u)_i\| < $ `tol`, which only constrain $x_0$.
    ///
    /// Fails with [`MpcError::InvariantViolation`] if more than
    /// `max_expected` such rows are found. Returns the number of removed rows.
    pub fn remove_initial_state_constraints(&mut self, max_expected: usize, tol: f64) -> Result<usize> {
        let rows = zero_rows(&self.raw.c_u, tol);
        if rows.len() > max_expected {
            return Err(MpcError::InvariantViolation(format!(
                "found {} initial-state constraints, at most {max_expected} expected",
                rows.len()
            )));
        }
        if rows.is_empty() {
            return Ok(0);
        }
        self.raw.c_u = delete_rows(&self.raw.c_u, &rows);
        self.raw.c_x = delete_rows(&self.raw.c_x, &rows);
        self.raw.c = delete_entries(&self.raw.c, &rows);
        self.standard = Self::add_slack_variables(&self.raw);
        let was_computed = self.feasible_set.take().is_some();
        if was_computed {
            self.feasible_set()?;
        }
        debug!("Removed {} initial-state constraints", rows.len());
        Ok(rows.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QpMatrices {
    f_uu: Array2<f64>,
    f_xu: Array2<f64>,
    f_xx: Array2<f64>,
    f_u: Array1<f64>,
    f_x: Array1<f64>,
    f: f64,
    c_u: Array2<f64>,
    c_x: Array2<f64>,
    c: Array1<f64>,
}

/// The program after the change of variables $z = U + F_{uu}^{-1}(F_{xu}^\text{T} x_0 + F_u)$:
/// $$ \min_z \tfrac{1}{2} z^\text{T} H z + \tfrac{1}{2} x_0^\text{T} F_{xx}^q x_0 + (F_x^q)^\text{T} x_0 + F^q
///    \quad \text{s.t.} \quad G z \le W + S x_0. $$
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedQp {
    pub h: Array2<f64>,
    pub h_inv: Array2<f64>,
    pub g: Array2<f64>,
    pub w: Array1<f64>,
    pub s: Array2<f64>,
    pub f_xx_q: Array2<f64>,
    pub f_x_q: Array1<f64>,
    pub f_q: f64,
}

/// Closed-form primal and dual solution for a fixed active set.
#[derive(Debug, Clone, PartialEq)]
pub struct ZSensitivity {
    /// The active set after deflation of linearly dependent rows.
    pub active_set: Vec<usize>,
    pub z_offset: Array1<f64>,
    pub z_linear: Array2<f64>,
    pub lambda_offset: Array1<f64>,
    pub lambda_linear: Array2<f64>,
}

/// $V(x_0) = \tfrac{1}{2} x_0^\text{T} V_q x_0 + V_l^\text{T} x_0 + V_o$.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueFunction {
    pub quadratic: Array2<f64>,
    pub linear: Array1<f64>,
    pub offset: f64,
}

impl ValueFunction {
    pub fn evaluate(&self, x: &Array1<f64>) -> f64 {
        0.5 * x.dot(&self.quadratic.dot(x)) + self.linear.dot(x) + self.offset
    }

    /// The plane tangent to $V$ at `x`.
    pub fn tangent_plane(&self, x: &Array1<f64>) -> ValuePlane {
        let vx = self.quadratic.dot(x);
        ValuePlane {
            a: &vx + &self.linear,
            b: -0.5 * x.dot(&vx) + self.offset,
        }
    }
}

/// The affine function $x \mapsto a^\text{T} x + b$.
#[derive(Debug, Clone, PartialEq)]
pub struct ValuePlane {
    pub a: Array1<f64>,
    pub b: f64,
}

impl ValuePlane {
    pub fn evaluate(&self, x: &Array1<f64>) -> f64 {
        self.a.dot(x) + self.b
    }
}

/// Joint minimizer of a [`ParametricQp`] over the inputs and the initial state.
#[derive(Debug, Clone)]
pub struct FreeStateSolution {
    pub u: Array1<f64>,
    pub x0: Array1<f64>,
    pub cost: f64,
    pub status: SolveStatus,
}

/// $\min \tfrac{1}{2} U^\text{T} F_{uu} U + x_0^\text{T} F_{xu} U + F_u^\text{T} U
///  + \tfrac{1}{2} x_0^\text{T} F_{xx} x_0 + F_x^\text{T} x_0 + F$ s.t. $C_u U \le C_x x_0 + C$.
///
/// $F_{uu}$ must be positive definite. The reduced form is computed at
/// construction and must be refreshed with [`ParametricQp::remove_linear_terms`]
/// whenever the matrices change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "QpMatrices", into = "QpMatrices")]
pub struct ParametricQp {
    raw: QpMatrices,
    reduced: ReducedQp,
    feasible_set: OnceCell<Option<Polytope>>,
    solver: Clarabel,
}

impl TryFrom<QpMatrices> for ParametricQp {
    type Error = MpcError;

    fn try_from(raw: QpMatrices) -> Result<Self> {
        Self::new(
            raw.f_uu, raw.f_xu, raw.f_xx, raw.f_u, raw.f_x, raw.f, raw.c_u, raw.c_x, raw.c,
        )
    }
}

impl From<ParametricQp> for QpMatrices {
    fn from(qp: ParametricQp) -> Self {
        qp.raw
    }
}

impl ParametricQp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        f_uu: Array2<f64>,
        f_xu: Array2<f64>,
        f_xx: Array2<f64>,
        f_u: Array1<f64>,
        f_x: Array1<f64>,
        f: f64,
        c_u: Array2<f64>,
        c_x: Array2<f64>,
        c: Array1<f64>,
    ) -> Result<Self> {
        let (n_u, n_x) = (f_uu.nrows(), f_xx.nrows());
        if f_uu.ncols() != n_u {
            return Err(MpcError::dimension("F_uu columns", n_u, f_uu.ncols()));
        }
        if f_xx.ncols() != n_x {
            return Err(MpcError::dimension("F_xx columns", n_x, f_xx.ncols()));
        }
        if f_xu.dim() != (n_x, n_u) {
            return Err(MpcError::dimension("F_xu rows", n_x, f_xu.nrows()));
        }
        if f_u.len() != n_u {
            return Err(MpcError::dimension("F_u length", n_u, f_u.len()));
        }
        if f_x.len() != n_x {
            return Err(MpcError::dimension("F_x length", n_x, f_x.len()));
        }
        if c_u.ncols() != n_u {
            return Err(MpcError::dimension("C_u columns", n_u, c_u.ncols()));
        }
        if c_x.ncols() != n_x {
            return Err(MpcError::dimension("C_x columns", n_x, c_x.ncols()));
        }
        check_constraints(&c_u, &c_x, &c)?;
        let raw = QpMatrices {
            f_uu,
            f_xu,
            f_xx,
            f_u,
            f_x,
            f,
            c_u,
            c_x,
            c,
        };
        let reduced = Self::reduce(&raw)?;
        Ok(Self {
            raw,
            reduced,
            feasible_set: OnceCell::new(),
            solver: Clarabel::default(),
        })
    }

    /// Use the given backend for every solve of this program.
    pub fn with_solver(mut self, solver: Clarabel) -> Self {
        self.solver = solver;
        self
    }

    fn reduce(raw: &QpMatrices) -> Result<ReducedQp> {
        let h = raw.f_uu.clone();
        if h.cholesky(UPLO::Lower).is_err() {
            return Err(MpcError::InvariantViolation(
                "the Hessian F_uu of the condensed QP is not positive definite".into(),
            ));
        }
        let h_inv = h.inv()?;
        let h_inv_f_xu_t = h_inv.dot(&raw.f_xu.t());
        let h_inv_f_u = h_inv.dot(&raw.f_u);
        Ok(ReducedQp {
            f_xx_q: &raw.f_xx - &raw.f_xu.dot(&h_inv_f_xu_t),
            f_x_q: &raw.f_x - &raw.f_xu.dot(&h_inv_f_u),
            f_q: raw.f - 0.5 * raw.f_u.dot(&h_inv_f_u),
            g: raw.c_u.clone(),
            s: &raw.c_x + &raw.c_u.dot(&h_inv_f_xu_t),
            w: &raw.c + &raw.c_u.dot(&h_inv_f_u),
            h,
            h_inv,
        })
    }

    /// Recompute the reduced form $(H, G, S, W)$ from the current matrices.
    pub fn remove_linear_terms(&mut self) -> Result<()> {
        self.reduced = Self::reduce(&self.raw)?;
        Ok(())
    }

    pub fn reduced(&self) -> &ReducedQp {
        &self.reduced
    }

    pub fn f_uu(&self) -> &Array2<f64> {
        &self.raw.f_uu
    }

    pub fn f_xu(&self) -> &Array2<f64> {
        &self.raw.f_xu
    }

    pub fn f_xx(&self) -> &Array2<f64> {
        &self.raw.f_xx
    }

    pub fn f_u(&self) -> &Array1<f64> {
        &self.raw.f_u
    }

    pub fn f_x(&self) -> &Array1<f64> {
        &self.raw.f_x
    }

    pub fn f(&self) -> f64 {
        self.raw.f
    }

    pub fn c_u(&self) -> &Array2<f64> {
        &self.raw.c_u
    }

    pub fn c_x(&self) -> &Array2<f64> {
        &self.raw.c_x
    }

    pub fn c(&self) -> &Array1<f64> {
        &self.raw.c
    }

    /// Length of the stacked input $U$.
    pub fn n_u(&self) -> usize {
        self.raw.f_uu.nrows()
    }

    /// Dimension of the parameter $x_0$.
    pub fn n_x(&self) -> usize {
        self.raw.f_xx.nrows()
    }

    pub fn n_constraints(&self) -> usize {
        self.raw.c.len()
    }

    pub fn solve(&self, x0: &Array1<f64>) -> Result<ParametricSolution> {
        if x0.len() != self.n_x() {
            return Err(MpcError::dimension("initial state", self.n_x(), x0.len()));
        }
        let f = self.raw.f_xu.t().dot(x0) + &self.raw.f_u;
        let b = &self.raw.c + &self.raw.c_x.dot(x0);
        let sol = self.solver.quadratic_program(&self.raw.f_uu, &f, &self.raw.c_u, &b)?;
        if !sol.is_optimal() {
            return Ok(ParametricSolution::infeasible(self.n_u(), sol.status));
        }
        let cost = sol.min + 0.5 * x0.dot(&self.raw.f_xx.dot(x0)) + self.raw.f_x.dot(x0) + self.raw.f;
        Ok(ParametricSolution {
            u: sol.argmin,
            cost,
            status: sol.status,
        })
    }

    pub fn solve_staged(&self, x0: &Array1<f64>, n_u: usize) -> Result<(Vec<Array1<f64>>, f64)> {
        let sol = self.solve(x0)?;
        Ok((sol.staged(n_u)?, sol.cost))
    }

    /// Rows with $C_u u - C - C_x x_0 > -$ `tol`.
    pub fn active_set(&self, x0: &Array1<f64>, u: &Array1<f64>, tol: f64) -> Vec<usize> {
        let residual = self.raw.c_u.dot(u) - &self.raw.c - self.raw.c_x.dot(x0);
        residual
            .iter()
            .enumerate()
            .filter(|(_, &r)| r > -tol)
            .map(|(i, _)| i)
            .collect()
    }

    /// Primal and dual solution as affine functions of $x_0$, assuming
    /// `active_set` is optimal.
    ///
    /// Linearly dependent active rows are deflated first. Fails with
    /// [`MpcError::SingularActiveSet`] if the deflated rows are still rank
    /// deficient or $G_A H^{-1} G_A^\text{T}$ cannot be inverted.
    pub fn z_sensitivity(&self, active_set: &[usize]) -> Result<ZSensitivity> {
        let reduced = &self.reduced;
        let (n_u, n_x) = (self.n_u(), self.n_x());
        if let Some(&row) = active_set.iter().find(|&&i| i >= self.n_constraints()) {
            return Err(MpcError::dimension("active constraint index", self.n_constraints(), row));
        }
        let mut active_set: Vec<usize> = active_set.to_vec();
        active_set.sort_unstable();
        active_set.dedup();
        if active_set.is_empty() {
            return Ok(ZSensitivity {
                active_set,
                z_offset: Array1::zeros(n_u),
                z_linear: Array2::zeros((n_u, n_x)),
                lambda_offset: Array1::zeros(0),
                lambda_linear: Array2::zeros((0, n_x)),
            });
        }

        let g_a = reduced.g.select(Axis(0), &active_set);
        if rank(&g_a, None)? < g_a.nrows() {
            let independent = linearly_independent_rows(&g_a, DEFLATION_TOL);
            active_set = independent.iter().map(|&i| active_set[i]).collect();
        }
        let g_a = reduced.g.select(Axis(0), &active_set);
        if g_a.nrows() > n_u || rank(&g_a, None)? < g_a.nrows() {
            return Err(MpcError::SingularActiveSet {
                active_set,
                reason: "active constraints are linearly dependent after deflation".into(),
            });
        }
        let w_a = reduced.w.select(Axis(0), &active_set);
        let s_a = reduced.s.select(Axis(0), &active_set);

        let h_inv_g_a_t = reduced.h_inv.dot(&g_a.t());
        let h_a = match g_a.dot(&h_inv_g_a_t).inv() {
            Ok(h_a) => h_a,
            Err(e) => {
                return Err(MpcError::SingularActiveSet {
                    active_set,
                    reason: e.to_string(),
                })
            }
        };
        let lambda_offset = -h_a.dot(&w_a);
        let lambda_linear = -h_a.dot(&s_a);
        Ok(ZSensitivity {
            z_offset: -h_inv_g_a_t.dot(&lambda_offset),
            z_linear: -h_inv_g_a_t.dot(&lambda_linear),
            lambda_offset,
            lambda_linear,
            active_set,
        })
    }

    /// $u(x_0) = u_o + U_l x_0$ for the given active set.
    pub fn u_sensitivity(&self, active_set: &[usize]) -> Result<(Array1<f64>, Array2<f64>)> {
        let z = self.z_sensitivity(active_set)?;
        Ok(self.u_from_z(&z))
    }

    pub(crate) fn u_from_z(&self, z: &ZSensitivity) -> (Array1<f64>, Array2<f64>) {
        let h_inv = &self.reduced.h_inv;
        (
            &z.z_offset - &h_inv.dot(&self.raw.f_u),
            &z.z_linear - &h_inv.dot(&self.raw.f_xu.t()),
        )
    }

    /// Optimal value function for the given active set.
    pub fn value_function(&self, active_set: &[usize]) -> Result<ValueFunction> {
        let z = self.z_sensitivity(active_set)?;
        Ok(self.value_from_z(&z))
    }

    pub(crate) fn value_from_z(&self, z: &ZSensitivity) -> ValueFunction {
        let reduced = &self.reduced;
        let h_z_linear = reduced.h.dot(&z.z_linear);
        ValueFunction {
            quadratic: z.z_linear.t().dot(&h_z_linear) + &reduced.f_xx_q,
            linear: z.z_offset.dot(&h_z_linear) + &reduced.f_x_q,
            offset: reduced.f_q + 0.5 * z.z_offset.dot(&reduced.h.dot(&z.z_offset)),
        }
    }

    /// Planes tangent to the value function of `active_set` at each point of `x_list`.
    pub fn cost_sensitivity(&self, x_list: &[Array1<f64>], active_set: &[usize]) -> Result<Vec<ValuePlane>> {
        let value = self.value_function(active_set)?;
        x_list
            .iter()
            .map(|x| {
                if x.len() != self.n_x() {
                    return Err(MpcError::dimension("linearization point", self.n_x(), x.len()));
                }
                Ok(value.tangent_plane(x))
            })
            .collect()
    }

    pub fn lifted_polytope(&self) -> Result<Polytope> {
        lifted_polytope(&self.raw.c_u, &self.raw.c_x, &self.raw.c)
    }

    /// Set of initial states for which the program is feasible (memoized).
    pub fn feasible_set(&self) -> Result<Option<&Polytope>> {
        cached_feasible_set(&self.feasible_set, || {
            project_feasible_set(&self.raw.c_u, &self.raw.c_x, &self.raw.c)
        })
    }

    /// Remove the rows with $\|(C_u)_i\| < $ `tol`, which only constrain $x_0$,
    /// and refresh the reduced form.
    ///
    /// Fails with [`MpcError::InvariantViolation`] if more than
    /// `max_expected` such rows are found. Returns the number of removed rows.
    pub fn remove_initial_state_constraints(&mut self, max_expected: usize, tol: f64) -> Result<usize> {
        let rows = zero_rows(&self.raw.c_u, tol);
        if rows.len() > max_expected {
            return Err(MpcError::InvariantViolation(format!(
                "found {} initial-state constraints, at most {max_expected} expected",
                rows.len()
            )));
        }
        if rows.is_empty() {
            return Ok(0);
        }
        self.raw.c_u = delete_rows(&self.raw.c_u, &rows);
        self.raw.c_x = delete_rows(&self.raw.c_x, &rows);
        self.raw.c = delete_entries(&self.raw.c, &rows);
        self.remove_linear_terms()?;
        let was_computed = self.feasible_set.take().is_some();
        if was_computed {
            self.feasible_set()?;
        }
        debug!("Removed {} initial-state constraints", rows.len());
        Ok(rows.len())
    }

    /// Minimize jointly over the inputs and the initial state.
    pub fn solve_free_x(&self) -> Result<FreeStateSolution> {
        let (n_u, n_x) = (self.n_u(), self.n_x());
        let h = concatenate![
            Axis(0),
            concatenate![Axis(1), self.raw.f_uu, self.raw.f_xu.t()],
            concatenate![Axis(1), self.raw.f_xu, self.raw.f_xx]
        ];
        let f = concatenate![Axis(0), self.raw.f_u, self.raw.f_x];
        let a = concatenate![Axis(1), self.raw.c_u, -&self.raw.c_x];
        let sol = self.solver.quadratic_program(&h, &f, &a, &self.raw.c)?;
        if !sol.is_optimal() {
            warn!("Joint minimization over inputs and initial state returned {:?}", sol.status);
            return Ok(FreeStateSolution {
                u: Array1::from_elem(n_u, f64::NAN),
                x0: Array1::from_elem(n_x, f64::NAN),
                cost: f64::NAN,
                status: sol.status,
            });
        }
        Ok(FreeStateSolution {
            u: sol.argmin.slice(s![..n_u]).to_owned(),
            x0: sol.argmin.slice(s![n_u..]).to_owned(),
            cost: sol.min + self.raw.f,
            status: sol.status,
        })
    }
}

/// A condensed program for one switching sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CondensedProgram {
    Linear(ParametricLp),
    Quadratic(ParametricQp),
}

impl CondensedProgram {
    /// Use the given backend for every solve of this program.
    pub fn with_solver(self, solver: Clarabel) -> Self {
        match self {
            CondensedProgram::Linear(lp) => CondensedProgram::Linear(lp.with_solver(solver)),
            CondensedProgram::Quadratic(qp) => CondensedProgram::Quadratic(qp.with_solver(solver)),
        }
    }

    pub fn solve(&self, x0: &Array1<f64>) -> Result<ParametricSolution> {
        match self {
            CondensedProgram::Linear(lp) => lp.solve(x0),
            CondensedProgram::Quadratic(qp) => qp.solve(x0),
        }
    }

    pub fn solve_staged(&self, x0: &Array1<f64>, n_u: usize) -> Result<(Vec<Array1<f64>>, f64)> {
        match self {
            CondensedProgram::Linear(lp) => lp.solve_staged(x0, n_u),
            CondensedProgram::Quadratic(qp) => qp.solve_staged(x0, n_u),
        }
    }

    pub fn c_u(&self) -> &Array2<f64> {
        match self {
            CondensedProgram::Linear(lp) => lp.c_u(),
            CondensedProgram::Quadratic(qp) => qp.c_u(),
        }
    }

    pub fn c_x(&self) -> &Array2<f64> {
        match self {
            CondensedProgram::Linear(lp) => lp.c_x(),
            CondensedProgram::Quadratic(qp) => qp.c_x(),
        }
    }

    pub fn c(&self) -> &Array1<f64> {
        match self {
            CondensedProgram::Linear(lp) => lp.c(),
            CondensedProgram::Quadratic(qp) => qp.c(),
        }
    }

    pub fn n_x(&self) -> usize {
        match self {
            CondensedProgram::Linear(lp) => lp.n_x(),
            CondensedProgram::Quadratic(qp) => qp.n_x(),
        }
    }

    pub fn n_u(&self) -> usize {
        match self {
            CondensedProgram::Linear(lp) => lp.n_u(),
            CondensedProgram::Quadratic(qp) => qp.n_u(),
        }
    }

    pub fn lifted_polytope(&self) -> Result<Polytope> {
        lifted_polytope(self.c_u(), self.c_x(), self.c())
    }

    pub fn feasible_set(&self) -> Result<Option<&Polytope>> {
        match self {
            CondensedProgram::Linear(lp) => lp.feasible_set(),
            CondensedProgram::Quadratic(qp) => qp.feasible_set(),
        }
    }

    pub fn remove_initial_state_constraints(&mut self, max_expected: usize, tol: f64) -> Result<usize> {
        match self {
            CondensedProgram::Linear(lp) => lp.remove_initial_state_constraints(max_expected, tol),
            CondensedProgram::Quadratic(qp) => qp.remove_initial_state_constraints(max_expected, tol),
        }
    }

    pub fn as_quadratic(&self) -> Option<&ParametricQp> {
        match self {
            CondensedProgram::Quadratic(qp) => Some(qp),
            CondensedProgram::Linear(_) => None,
        }
    }

    pub fn into_quadratic(self) -> Result<ParametricQp> {
        match self {
            CondensedProgram::Quadratic(qp) => Ok(qp),
            CondensedProgram::Linear(_) => Err(MpcError::Unsupported(
                "explicit solutions exist only for quadratic objectives",
            )),
        }
    }
}
