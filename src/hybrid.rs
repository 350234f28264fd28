//! Hybrid MPC for piecewise-affine systems through a big-M mixed-integer program.
//!
//! For each stage $k$ and mode $i$ the program carries a binary $d_{k,i}$
//! selecting the active mode and an auxiliary state $z_{k,i}$ equal to the
//! successor state under mode $i$ when $d_{k,i} = 1$ and to zero otherwise,
//! so that $x_{k+1} = \sum_i z_{k,i}$.

use log::{debug, warn};
use ndarray::{concatenate, Array1, Array2, Axis};

use crate::condensing::{condense_ocp, ObjectiveWeights};
use crate::config::{ControllerConfig, ObjectiveNorm};
use crate::control_theory::clean_matrix;
use crate::dynamics::{PwaSystem, SwitchingSequence};
use crate::error::{MpcError, Result};
use crate::mip::{BranchAndBound, LinExpr, MipModel, MipStatus, MixedIntegerSolver, Sense, VarId};
use crate::optimization::{Clarabel, SolveStatus};
use crate::parametric::CondensedProgram;
use crate::polytope::Polytope;

const INITIAL_CONDITION: &str = "initial_condition";

/// Per-pair big-M vectors, indexed by (mode whose rows are relaxed, active mode).
#[derive(Debug, Clone, PartialEq)]
pub struct BigMTable {
    values: Array2<Array1<f64>>,
}

impl BigMTable {
    fn from_fn(n_modes: usize, mut f: impl FnMut(usize, usize) -> Result<Array1<f64>>) -> Result<Self> {
        let mut entries = Vec::with_capacity(n_modes * n_modes);
        for i in 0..n_modes {
            for j in 0..n_modes {
                entries.push(f(i, j)?);
            }
        }
        let values = Array2::from_shape_vec((n_modes, n_modes), entries)
            .map_err(|e| MpcError::InvariantViolation(e.to_string()))?;
        Ok(Self { values })
    }

    /// The vector used to relax the rows of mode `i` while mode `j` is active.
    pub fn get(&self, i: usize, j: usize) -> &Array1<f64> {
        &self.values[(i, j)]
    }

    pub fn n_modes(&self) -> usize {
        self.values.nrows()
    }

    fn cleaned(&self, tol: f64) -> Self {
        Self {
            values: self.values.map(|m| clean_matrix(m, tol)),
        }
    }
}

/// Optimal value of $\max_{z \in D} a^\text{T} z$, failing if unbounded.
fn support(solver: &Clarabel, a: &Array1<f64>, domain: &Polytope, context: &str) -> Result<f64> {
    let sol = solver.linear_program(&-a, domain.lhs(), domain.rhs())?;
    match sol.status {
        SolveStatus::Optimal => Ok(-sol.min),
        SolveStatus::Unbounded => Err(MpcError::Unbounded(format!(
            "{context}: the mode domain is unbounded along {a}"
        ))),
        status => Err(MpcError::Solver(format!("{context}: big-M program returned {status:?}"))),
    }
}

/// $M^\text{dom}_{ij}[r] = \max_{z \in D_j} (\text{lhs}_i)_r z - (\text{rhs}_i)_r$ for $i \ne j$.
///
/// Diagonal entries are empty.
pub fn big_m_domains(system: &PwaSystem, solver: &Clarabel) -> Result<BigMTable> {
    let domains = system.domains();
    BigMTable::from_fn(system.n_sys(), |i, j| {
        if i == j {
            return Ok(Array1::zeros(0));
        }
        let (lhs, rhs) = (domains[i].lhs(), domains[i].rhs());
        (0..lhs.nrows())
            .map(|r| -> Result<f64> {
                let max = support(solver, &lhs.row(r).to_owned(), &domains[j], "domain big-M")?;
                Ok(max - rhs[r])
            })
            .collect()
    })
}

/// Upper and lower bounds of the dynamics of mode $i$ over the domain of mode $j$:
/// $M^\text{dyn}_{ij} = \max_{D_j} [A_i\ B_i] z + c_i$ and
/// $m^\text{dyn}_{ij} = \min_{D_j} [A_i\ B_i] z + c_i$, row by row.
pub fn big_m_dynamics(system: &PwaSystem, solver: &Clarabel) -> Result<(BigMTable, BigMTable)> {
    let domains = system.domains();
    let systems = system.affine_systems();
    let bound = |i: usize, j: usize, sign: f64| -> Result<Array1<f64>> {
        let lhs = concatenate![Axis(1), systems[i].a, systems[i].b];
        (0..lhs.nrows())
            .map(|r| -> Result<f64> {
                let row = lhs.row(r).mapv(|v| sign * v);
                let max = support(solver, &row, &domains[j], "dynamics big-M")?;
                Ok(sign * max + systems[i].c[r])
            })
            .collect()
    };
    let upper = BigMTable::from_fn(system.n_sys(), |i, j| bound(i, j, 1.))?;
    let lower = BigMTable::from_fn(system.n_sys(), |i, j| bound(i, j, -1.))?;
    Ok((upper, lower))
}

/// Optional warm start of [`MpcHybridController::feedforward`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarmStart {
    /// $N$ inputs.
    pub u: Option<Vec<Array1<f64>>>,
    /// $N+1$ states.
    pub x: Option<Vec<Array1<f64>>>,
    pub switching_sequence: Option<SwitchingSequence>,
}

/// Solution of the hybrid optimal control problem.
///
/// When the mixed-integer solver does not return a proven optimum, `u`, `x`
/// and `cost` are NaN-filled, `switching_sequence` is `None` and `status`
/// tells why.
#[derive(Debug, Clone)]
pub struct HybridSolution {
    pub u: Vec<Array1<f64>>,
    pub x: Vec<Array1<f64>>,
    pub switching_sequence: Option<SwitchingSequence>,
    pub cost: f64,
    pub status: MipStatus,
}

impl HybridSolution {
    fn sentinel(horizon: usize, n_x: usize, n_u: usize, status: MipStatus) -> Self {
        Self {
            u: vec![Array1::from_elem(n_u, f64::NAN); horizon],
            x: vec![Array1::from_elem(n_x, f64::NAN); horizon + 1],
            switching_sequence: None,
            cost: f64::NAN,
            status,
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.status == MipStatus::Optimal && !self.cost.is_nan()
    }
}

/// Variable handles of the mixed-integer program.
#[derive(Debug, Clone)]
struct MipVariables {
    x: Vec<Vec<VarId>>,
    u: Vec<Vec<VarId>>,
    /// `z[k][i]`
    z: Vec<Vec<Vec<VarId>>>,
    /// `d[k][i]`
    d: Vec<Vec<VarId>>,
    /// 1-norm slacks of the states (N+1 stages) and inputs.
    phi: Vec<Vec<VarId>>,
    psi: Vec<Vec<VarId>>,
}

/// Hybrid MPC controller solving one mixed-integer program per initial state.
#[derive(Debug)]
pub struct MpcHybridController {
    system: PwaSystem,
    config: ControllerConfig,
    weights: ObjectiveWeights,
    terminal_set: Polytope,
    big_m_domains: BigMTable,
    big_m_dynamics: BigMTable,
    small_m_dynamics: BigMTable,
    model: MipModel,
    vars: MipVariables,
    solver: Box<dyn MixedIntegerSolver>,
}

impl MpcHybridController {
    pub fn new(
        system: PwaSystem,
        config: ControllerConfig,
        weights: ObjectiveWeights,
        terminal_set: Polytope,
    ) -> Result<Self> {
        let (n_x, n_u) = (system.n_x(), system.n_u());
        if config.horizon == 0 {
            return Err(MpcError::dimension("horizon", 1, 0));
        }
        if weights.q.nrows() != n_x || weights.p.nrows() != n_x {
            return Err(MpcError::dimension("state weight rows", n_x, weights.q.nrows()));
        }
        if weights.r.nrows() != n_u {
            return Err(MpcError::dimension("input weight rows", n_u, weights.r.nrows()));
        }
        if terminal_set.dim() != n_x {
            return Err(MpcError::dimension("terminal set", n_x, terminal_set.dim()));
        }
        let solver = Clarabel::new(config.solver.clone());
        let big_m_domains = big_m_domains(&system, &solver)?;
        let (big_m_dynamics, small_m_dynamics) = big_m_dynamics(&system, &solver)?;
        let mut controller = Self {
            solver: Box::new(BranchAndBound::new(config.mip.clone())),
            system,
            config,
            weights,
            terminal_set,
            big_m_domains,
            big_m_dynamics,
            small_m_dynamics,
            model: MipModel::new(),
            vars: MipVariables {
                x: Vec::new(),
                u: Vec::new(),
                z: Vec::new(),
                d: Vec::new(),
                phi: Vec::new(),
                psi: Vec::new(),
            },
        };
        controller.build_model();
        debug!(
            "Hybrid MIP with {} variables and {} constraints",
            controller.model.n_vars(),
            controller.model.n_constraints()
        );
        Ok(controller)
    }

    /// Replace the mixed-integer backend.
    pub fn with_solver(mut self, solver: Box<dyn MixedIntegerSolver>) -> Self {
        self.solver = solver;
        self
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

    pub fn horizon(&self) -> usize {
        self.config.horizon
    }

    pub fn big_m_domains(&self) -> &BigMTable {
        &self.big_m_domains
    }

    /// Upper and lower dynamics bounds $(M^\text{dyn}, m^\text{dyn})$.
    pub fn big_m_dynamics(&self) -> (&BigMTable, &BigMTable) {
        (&self.big_m_dynamics, &self.small_m_dynamics)
    }

    pub fn model(&self) -> &MipModel {
        &self.model
    }

    fn build_model(&mut self) {
        let horizon = self.config.horizon;
        let (n_x, n_u, n_sys) = (self.system.n_x(), self.system.n_u(), self.system.n_sys());
        let model = &mut self.model;
        let inf = f64::INFINITY;
        self.vars.x = (0..=horizon)
            .map(|k| model.add_continuous_vector(&format!("x[{k}]"), n_x, -inf, inf))
            .collect();
        self.vars.u = (0..horizon)
            .map(|k| model.add_continuous_vector(&format!("u[{k}]"), n_u, -inf, inf))
            .collect();
        self.vars.z = (0..horizon)
            .map(|k| {
                (0..n_sys)
                    .map(|i| model.add_continuous_vector(&format!("z[{k}][{i}]"), n_x, -inf, inf))
                    .collect()
            })
            .collect();
        self.vars.d = (0..horizon)
            .map(|k| (0..n_sys).map(|i| model.add_binary(format!("d[{k}][{i}]"))).collect())
            .collect();

        self.add_objective();
        self.add_mode_disjunction();
        self.add_domain_constraints();
        self.add_dynamics_constraints();
        self.add_terminal_constraint();
    }

    fn add_objective(&mut self) {
        let tol = self.config.clean_tol;
        let q = clean_matrix(&self.weights.q, tol);
        let r = clean_matrix(&self.weights.r, tol);
        let p = clean_matrix(&self.weights.p, tol);
        let horizon = self.config.horizon;
        let model = &mut self.model;
        match self.config.objective_norm {
            ObjectiveNorm::One => {
                let (n_x, n_u) = (q.nrows(), r.nrows());
                self.vars.phi = (0..=horizon)
                    .map(|k| model.add_continuous_vector(&format!("phi[{k}]"), n_x, 0., f64::INFINITY))
                    .collect();
                self.vars.psi = (0..horizon)
                    .map(|k| model.add_continuous_vector(&format!("psi[{k}]"), n_u, 0., f64::INFINITY))
                    .collect();
                let mut objective = LinExpr::new();
                for &slack in self.vars.phi.iter().chain(self.vars.psi.iter()).flatten() {
                    objective.add_term(slack, 1.);
                }
                model.set_objective(objective);
                for k in 0..=horizon {
                    let weight = if k < horizon { &q } else { &p };
                    add_abs_bounds(model, &self.vars.phi[k], weight, &self.vars.x[k]);
                }
                for k in 0..horizon {
                    add_abs_bounds(model, &self.vars.psi[k], &r, &self.vars.u[k]);
                }
            }
            ObjectiveNorm::Two => {
                model.set_objective(LinExpr::new());
                for k in 0..=horizon {
                    let weight = if k < horizon { &q } else { &p };
                    add_quadratic_form(model, weight, &self.vars.x[k]);
                }
                for k in 0..horizon {
                    add_quadratic_form(model, &r, &self.vars.u[k]);
                }
            }
        }
    }

    fn add_mode_disjunction(&mut self) {
        for d_k in &self.vars.d {
            let mut sum = LinExpr::new();
            for &d in d_k {
                sum.add_term(d, 1.);
            }
            self.model.add_constraint(sum, Sense::Eq, 1.);
            self.model.add_sos1(d_k.clone());
        }
    }

    // lhs_i (x_k, u_k) - rhs_i - sum_{j != i} M_ij d_kj <= 0
    fn add_domain_constraints(&mut self) {
        let tol = self.config.clean_tol;
        let big_m = self.big_m_domains.cleaned(tol);
        for (i, domain) in self.system.domains().iter().enumerate() {
            let lhs = clean_matrix(domain.lhs(), tol);
            let rhs = clean_matrix(domain.rhs(), tol);
            for k in 0..self.config.horizon {
                let xu: Vec<VarId> = self.vars.x[k].iter().chain(&self.vars.u[k]).copied().collect();
                for (row, (a, &b)) in lhs.rows().into_iter().zip(rhs.iter()).enumerate() {
                    let mut expr = LinExpr::weighted_sum(&xu, a);
                    for (j, &d) in self.vars.d[k].iter().enumerate() {
                        if j != i {
                            expr.add_term(d, -big_m.get(i, j)[row]);
                        }
                    }
                    self.model.add_constraint(expr, Sense::Le, b);
                }
            }
        }
    }

    fn add_dynamics_constraints(&mut self) {
        let tol = self.config.clean_tol;
        let upper = self.big_m_dynamics.cleaned(tol);
        let lower = self.small_m_dynamics.cleaned(tol);
        let n_x = self.system.n_x();
        for k in 0..self.config.horizon {
            // x_{k+1} = sum_i z_ki
            for r in 0..n_x {
                let mut expr = LinExpr::new().term(self.vars.x[k + 1][r], 1.);
                for z_ki in &self.vars.z[k] {
                    expr.add_term(z_ki[r], -1.);
                }
                self.model.add_constraint(expr, Sense::Eq, 0.);
            }
            for (i, system) in self.system.affine_systems().iter().enumerate() {
                let d_ki = self.vars.d[k][i];
                let a = clean_matrix(&system.a, tol);
                let b = clean_matrix(&system.b, tol);
                let c = clean_matrix(&system.c, tol);
                for r in 0..n_x {
                    let z = self.vars.z[k][i][r];
                    // m_ii d <= z <= M_ii d
                    self.model.add_constraint(
                        LinExpr::new().term(z, 1.).term(d_ki, -upper.get(i, i)[r]),
                        Sense::Le,
                        0.,
                    );
                    self.model.add_constraint(
                        LinExpr::new().term(z, 1.).term(d_ki, -lower.get(i, i)[r]),
                        Sense::Ge,
                        0.,
                    );
                    // z - A_i x - B_i u - c_i >= -sum_{j != i} M_ij d_j, and <= with m
                    let mut dynamics = LinExpr::weighted_sum(&self.vars.x[k], a.row(r));
                    dynamics.add_scaled(&LinExpr::weighted_sum(&self.vars.u[k], b.row(r)), 1.);
                    dynamics.add_constant(c[r]);
                    let mut above = LinExpr::new().term(z, 1.);
                    above.add_scaled(&dynamics, -1.);
                    let mut below = above.clone();
                    for (j, &d) in self.vars.d[k].iter().enumerate() {
                        if j != i {
                            above.add_term(d, upper.get(i, j)[r]);
                            below.add_term(d, lower.get(i, j)[r]);
                        }
                    }
                    self.model.add_constraint(above, Sense::Ge, 0.);
                    self.model.add_constraint(below, Sense::Le, 0.);
                }
            }
        }
    }

    fn add_terminal_constraint(&mut self) {
        let tol = self.config.clean_tol;
        let lhs = clean_matrix(self.terminal_set.lhs(), tol);
        let rhs = clean_matrix(self.terminal_set.rhs(), tol);
        let x_n = &self.vars.x[self.config.horizon];
        for (a, &b) in lhs.rows().into_iter().zip(rhs.iter()) {
            self.model.add_constraint(LinExpr::weighted_sum(x_n, a), Sense::Le, b);
        }
    }

    fn set_initial_condition(&mut self, x0: &Array1<f64>) {
        for (i, (&var, &value)) in self.vars.x[0].iter().zip(x0.iter()).enumerate() {
            let name = format!("{INITIAL_CONDITION}_{i}");
            self.model.remove_constraint(&name);
            self.model
                .add_named_constraint(name, LinExpr::new().term(var, 1.), Sense::Eq, value);
        }
    }

    fn apply_warm_start(&mut self, warm: &WarmStart) -> Result<()> {
        let horizon = self.config.horizon;
        self.model.clear_starts();
        if let Some(u_ws) = &warm.u {
            check_trajectory("input warm start", u_ws, horizon, self.system.n_u())?;
            set_starts(&mut self.model, &self.vars.u, u_ws);
        }
        if let Some(x_ws) = &warm.x {
            check_trajectory("state warm start", x_ws, horizon + 1, self.system.n_x())?;
            set_starts(&mut self.model, &self.vars.x, x_ws);
        }
        if let Some(ss) = &warm.switching_sequence {
            if ss.len() != horizon {
                return Err(MpcError::dimension("warm-start switching sequence", horizon, ss.len()));
            }
            if let Some(&mode) = ss.iter().find(|&&m| m >= self.system.n_sys()) {
                return Err(MpcError::dimension("warm-start mode bound", self.system.n_sys(), mode));
            }
            for (d_k, &mode) in self.vars.d.iter().zip(ss.iter()) {
                for (i, &d) in d_k.iter().enumerate() {
                    self.model.set_start(d, if i == mode { 1. } else { 0. });
                }
            }
            if let Some(x_ws) = &warm.x {
                for (k, &mode) in ss.iter().enumerate() {
                    for (i, z_ki) in self.vars.z[k].iter().enumerate() {
                        for (r, &z) in z_ki.iter().enumerate() {
                            self.model.set_start(z, if i == mode { x_ws[k + 1][r] } else { 0. });
                        }
                    }
                }
            }
        }
        if self.config.objective_norm == ObjectiveNorm::One {
            if let Some(x_ws) = &warm.x {
                for (k, (phi_k, x_k)) in self.vars.phi.iter().zip(x_ws).enumerate() {
                    let weight = if k < horizon { &self.weights.q } else { &self.weights.p };
                    set_abs_starts(&mut self.model, phi_k, weight, x_k);
                }
            }
            if let Some(u_ws) = &warm.u {
                for (psi_k, u_k) in self.vars.psi.iter().zip(u_ws) {
                    set_abs_starts(&mut self.model, psi_k, &self.weights.r, u_k);
                }
            }
        }
        Ok(())
    }

    /// Optimal input and state trajectories, switching sequence and cost from `x0`.
    pub fn feedforward(&mut self, x0: &Array1<f64>, warm: &WarmStart) -> Result<HybridSolution> {
        let (n_x, n_u, horizon) = (self.system.n_x(), self.system.n_u(), self.config.horizon);
        if x0.len() != n_x {
            return Err(MpcError::dimension("initial state", n_x, x0.len()));
        }
        self.set_initial_condition(x0);
        self.apply_warm_start(warm)?;
        let sol = self.solver.solve(&self.model)?;
        match sol.status {
            MipStatus::Optimal => {}
            MipStatus::TimeLimit => {
                warn!(
                    "The mixed-integer program exceeded the time limit of {} s",
                    self.config.mip.time_limit
                );
                return Ok(HybridSolution::sentinel(horizon, n_x, n_u, sol.status));
            }
            MipStatus::NodeLimit => {
                warn!("The mixed-integer program exceeded the node limit of {}", self.config.mip.max_nodes);
                return Ok(HybridSolution::sentinel(horizon, n_x, n_u, sol.status));
            }
            MipStatus::Incomplete => {
                warn!("The mixed-integer search dropped unsolved relaxations, no certified solution");
                return Ok(HybridSolution::sentinel(horizon, n_x, n_u, sol.status));
            }
            MipStatus::Infeasible => return Ok(HybridSolution::sentinel(horizon, n_x, n_u, sol.status)),
        }
        let switching_sequence: Vec<usize> = self
            .vars
            .d
            .iter()
            .map(|d_k| {
                let values = sol.values(d_k);
                values
                    .iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.total_cmp(b))
                    .map_or(0, |(i, _)| i)
            })
            .collect();
        Ok(HybridSolution {
            u: self.vars.u.iter().map(|u_k| sol.values(u_k)).collect(),
            x: self.vars.x.iter().map(|x_k| sol.values(x_k)).collect(),
            switching_sequence: Some(SwitchingSequence::new(switching_sequence)),
            cost: sol.objective,
            status: sol.status,
        })
    }

    /// First input of the optimal plan.
    pub fn feedback(&mut self, x0: &Array1<f64>) -> Result<Array1<f64>> {
        let mut sol = self.feedforward(x0, &WarmStart::default())?;
        Ok(sol.u.swap_remove(0))
    }

    /// The condensed LP/QP of a fixed switching sequence of length $N$.
    pub fn condense_program(&self, switching_sequence: &SwitchingSequence) -> Result<CondensedProgram> {
        switching_sequence.check_horizon(self.config.horizon)?;
        let program = condense_ocp(
            &self.system,
            self.config.objective_norm,
            &self.weights,
            &self.terminal_set,
            switching_sequence,
        )?;
        Ok(program.with_solver(Clarabel::new(self.config.solver.clone())))
    }
}

// slack_i >= +-(W v)_i
fn add_abs_bounds(model: &mut MipModel, slacks: &[VarId], weight: &Array2<f64>, vars: &[VarId]) {
    for (&slack, row) in slacks.iter().zip(weight.rows()) {
        let weighted = LinExpr::weighted_sum(vars, row);
        let mut upper = LinExpr::new().term(slack, 1.);
        upper.add_scaled(&weighted, -1.);
        let mut lower = LinExpr::new().term(slack, 1.);
        lower.add_scaled(&weighted, 1.);
        model.add_constraint(upper, Sense::Ge, 0.);
        model.add_constraint(lower, Sense::Ge, 0.);
    }
}

// v' W v
fn add_quadratic_form(model: &mut MipModel, weight: &Array2<f64>, vars: &[VarId]) {
    for ((i, j), &w) in weight.indexed_iter() {
        model.add_quadratic_term(vars[i], vars[j], w);
    }
}

fn check_trajectory(context: &str, trajectory: &[Array1<f64>], len: usize, dim: usize) -> Result<()> {
    if trajectory.len() != len {
        return Err(MpcError::dimension(format!("{context} length"), len, trajectory.len()));
    }
    if let Some(v) = trajectory.iter().find(|v| v.len() != dim) {
        return Err(MpcError::dimension(format!("{context} entries"), dim, v.len()));
    }
    Ok(())
}

fn set_starts(model: &mut MipModel, vars: &[Vec<VarId>], values: &[Array1<f64>]) {
    for (vars_k, values_k) in vars.iter().zip(values) {
        for (&var, &value) in vars_k.iter().zip(values_k.iter()) {
            model.set_start(var, value);
        }
    }
}

fn set_abs_starts(model: &mut MipModel, slacks: &[VarId], weight: &Array2<f64>, v: &Array1<f64>) {
    for (&slack, value) in slacks.iter().zip(weight.dot(v).iter()) {
        model.set_start(slack, value.abs());
    }
}
