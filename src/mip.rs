//! Mixed-integer programs with binary variables and a branch-and-bound solver.
//!
//! A [`MipModel`] is built incrementally: continuous and binary variables,
//! (optionally named) linear constraints, SOS1 sets, a linear objective and
//! quadratic terms. Any [`MixedIntegerSolver`] can solve it;
//! [`BranchAndBound`] explores a best-bound tree whose continuous
//! relaxations are solved with [`Clarabel`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Instant;

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1};

use crate::config::MipSettings;
use crate::error::{MpcError, Result};
use crate::optimization::{Clarabel, ConvexProgram, ProgramSolution, SolveStatus};

/// Bounds closer than this are treated as a fixed variable.
const FIXED_TOL: f64 = 1e-12;

/// Handle of a variable in a [`MipModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(usize);

impl VarId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Continuous,
    /// Takes the values 0 or 1.
    Binary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub lb: f64,
    pub ub: f64,
}

/// An affine expression $\sum_i a_i x_i + k$.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinExpr {
    terms: Vec<(VarId, f64)>,
    constant: f64,
}

impl LinExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(value: f64) -> Self {
        Self {
            terms: Vec::new(),
            constant: value,
        }
    }

    /// $\sum_i \text{coefs}_i\, \text{vars}_i$, skipping zero coefficients.
    pub fn weighted_sum(vars: &[VarId], coefs: ArrayView1<f64>) -> Self {
        let mut expr = Self::new();
        for (&var, &coef) in vars.iter().zip(coefs.iter()) {
            expr.add_term(var, coef);
        }
        expr
    }

    /// Builder form of [`LinExpr::add_term`].
    pub fn term(mut self, var: VarId, coef: f64) -> Self {
        self.add_term(var, coef);
        self
    }

    pub fn add_term(&mut self, var: VarId, coef: f64) {
        if coef != 0. {
            self.terms.push((var, coef));
        }
    }

    pub fn add_constant(&mut self, value: f64) {
        self.constant += value;
    }

    /// Add `scale` times `other` to this expression.
    pub fn add_scaled(&mut self, other: &LinExpr, scale: f64) {
        for &(var, coef) in &other.terms {
            self.add_term(var, scale * coef);
        }
        self.constant += scale * other.constant;
    }

    pub fn terms(&self) -> &[(VarId, f64)] {
        &self.terms
    }

    pub fn constant_term(&self) -> f64 {
        self.constant
    }

    pub fn evaluate(&self, x: &[f64]) -> f64 {
        self.terms
            .iter()
            .map(|&(var, coef)| coef * x[var.0])
            .sum::<f64>()
            + self.constant
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Le,
    Ge,
    Eq,
}

/// The constraint `expr sense rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub name: Option<String>,
    pub expr: LinExpr,
    pub sense: Sense,
    pub rhs: f64,
}

impl Constraint {
    fn violation(&self, x: &[f64]) -> f64 {
        let lhs = self.expr.evaluate(x);
        match self.sense {
            Sense::Le => (lhs - self.rhs).max(0.),
            Sense::Ge => (self.rhs - lhs).max(0.),
            Sense::Eq => (lhs - self.rhs).abs(),
        }
    }
}

/// A mixed-integer (quadratic) program in minimization form.
#[derive(Debug, Clone, Default)]
pub struct MipModel {
    variables: Vec<Variable>,
    constraints: Vec<Constraint>,
    sos1: Vec<Vec<VarId>>,
    objective: LinExpr,
    quadratic: Vec<(VarId, VarId, f64)>,
    start: Vec<Option<f64>>,
}

impl MipModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, name: impl Into<String>, kind: VariableKind, lb: f64, ub: f64) -> VarId {
        let (lb, ub) = match kind {
            VariableKind::Continuous => (lb, ub),
            VariableKind::Binary => (lb.max(0.), ub.min(1.)),
        };
        self.variables.push(Variable {
            name: name.into(),
            kind,
            lb,
            ub,
        });
        self.start.push(None);
        VarId(self.variables.len() - 1)
    }

    pub fn add_continuous(&mut self, name: impl Into<String>, lb: f64, ub: f64) -> VarId {
        self.add_variable(name, VariableKind::Continuous, lb, ub)
    }

    pub fn add_binary(&mut self, name: impl Into<String>) -> VarId {
        self.add_variable(name, VariableKind::Binary, 0., 1.)
    }

    /// Add `n` continuous variables named `prefix[0]`, ..., `prefix[n-1]`.
    pub fn add_continuous_vector(&mut self, prefix: &str, n: usize, lb: f64, ub: f64) -> Vec<VarId> {
        (0..n)
            .map(|i| self.add_continuous(format!("{prefix}[{i}]"), lb, ub))
            .collect()
    }

    pub fn add_constraint(&mut self, expr: LinExpr, sense: Sense, rhs: f64) {
        self.constraints.push(Constraint {
            name: None,
            expr,
            sense,
            rhs,
        });
    }

    pub fn add_named_constraint(&mut self, name: impl Into<String>, expr: LinExpr, sense: Sense, rhs: f64) {
        self.constraints.push(Constraint {
            name: Some(name.into()),
            expr,
            sense,
            rhs,
        });
    }

    /// Remove every constraint called `name`; returns whether one existed.
    pub fn remove_constraint(&mut self, name: &str) -> bool {
        let before = self.constraints.len();
        self.constraints.retain(|c| c.name.as_deref() != Some(name));
        self.constraints.len() != before
    }

    pub fn has_constraint(&self, name: &str) -> bool {
        self.constraints.iter().any(|c| c.name.as_deref() == Some(name))
    }

    /// At most one of `vars` may be nonzero.
    pub fn add_sos1(&mut self, vars: Vec<VarId>) {
        self.sos1.push(vars);
    }

    pub fn set_objective(&mut self, objective: LinExpr) {
        self.objective = objective;
    }

    /// Add $c\, x_i x_j$ to the objective.
    pub fn add_quadratic_term(&mut self, i: VarId, j: VarId, coef: f64) {
        if coef != 0. {
            self.quadratic.push((i, j, coef));
        }
    }

    pub fn set_start(&mut self, var: VarId, value: f64) {
        if let Some(start) = self.start.get_mut(var.0) {
            *start = Some(value);
        }
    }

    pub fn clear_starts(&mut self) {
        self.start.iter_mut().for_each(|s| *s = None);
    }

    pub fn start(&self, var: VarId) -> Option<f64> {
        self.start.get(var.0).copied().flatten()
    }

    pub fn variable(&self, var: VarId) -> Option<&Variable> {
        self.variables.get(var.0)
    }

    pub fn n_vars(&self) -> usize {
        self.variables.len()
    }

    pub fn n_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn binaries(&self) -> Vec<VarId> {
        self.variables
            .iter()
            .enumerate()
            .filter(|(_, v)| v.kind == VariableKind::Binary)
            .map(|(i, _)| VarId(i))
            .collect()
    }

    /// Objective value at `x`, quadratic terms included.
    pub fn objective_value(&self, x: &[f64]) -> f64 {
        self.objective.evaluate(x)
            + self
                .quadratic
                .iter()
                .map(|&(i, j, coef)| coef * x[i.0] * x[j.0])
                .sum::<f64>()
    }

    /// Whether `x` satisfies bounds, constraints, integrality and SOS1 sets up to `tol`.
    pub fn is_feasible(&self, x: &[f64], tol: f64) -> bool {
        if x.len() != self.n_vars() {
            return false;
        }
        let bounds_ok = self
            .variables
            .iter()
            .zip(x)
            .all(|(v, &xi)| xi >= v.lb - tol && xi <= v.ub + tol);
        let integral = self
            .binaries()
            .iter()
            .all(|b| fractionality(x[b.0]) <= tol);
        let constraints_ok = self.constraints.iter().all(|c| c.violation(x) <= tol);
        let sos1_ok = self
            .sos1
            .iter()
            .all(|set| set.iter().filter(|v| x[v.0].abs() > tol).count() <= 1);
        bounds_ok && integral && constraints_ok && sos1_ok
    }

    fn check_var(&self, var: VarId) -> Result<usize> {
        if var.0 < self.n_vars() {
            Ok(var.0)
        } else {
            Err(MpcError::dimension("variable index bound", self.n_vars(), var.0))
        }
    }

    fn compile(&self) -> Result<CompiledModel> {
        let n = self.n_vars();
        let mut cost = Array1::<f64>::zeros(n);
        for &(var, coef) in self.objective.terms() {
            cost[self.check_var(var)?] += coef;
        }
        let hessian = if self.quadratic.is_empty() {
            None
        } else {
            // c x_i x_j = 1/2 x' H x with H_ij = H_ji = c
            let mut h = Array2::<f64>::zeros((n, n));
            for &(i, j, coef) in &self.quadratic {
                let (i, j) = (self.check_var(i)?, self.check_var(j)?);
                h[(i, j)] += coef;
                h[(j, i)] += coef;
            }
            Some(h)
        };

        let mut ineq_rows = Vec::new();
        let mut eq_rows = Vec::new();
        for constraint in &self.constraints {
            let mut row = Array1::<f64>::zeros(n);
            for &(var, coef) in constraint.expr.terms() {
                row[self.check_var(var)?] += coef;
            }
            let rhs = constraint.rhs - constraint.expr.constant_term();
            match constraint.sense {
                Sense::Le => ineq_rows.push((row, rhs)),
                Sense::Ge => ineq_rows.push((-row, -rhs)),
                Sense::Eq => eq_rows.push((row, rhs)),
            }
        }
        let (a_ineq, b_ineq) = stack_rows(ineq_rows, n);
        let (a_eq, b_eq) = stack_rows(eq_rows, n);

        let sos1 = self
            .sos1
            .iter()
            .map(|set| set.iter().map(|&v| self.check_var(v)).collect::<Result<Vec<_>>>())
            .collect::<Result<Vec<_>>>()?;

        Ok(CompiledModel {
            hessian,
            cost,
            constant: self.objective.constant_term(),
            a_ineq,
            b_ineq,
            a_eq,
            b_eq,
            lb: self.variables.iter().map(|v| v.lb).collect(),
            ub: self.variables.iter().map(|v| v.ub).collect(),
            binaries: self.binaries().into_iter().map(|b| b.0).collect(),
            sos1,
        })
    }
}

fn stack_rows(rows: Vec<(Array1<f64>, f64)>, n: usize) -> (Array2<f64>, Array1<f64>) {
    let mut a = Array2::<f64>::zeros((rows.len(), n));
    let mut b = Array1::<f64>::zeros(rows.len());
    for (k, (row, rhs)) in rows.into_iter().enumerate() {
        a.row_mut(k).assign(&row);
        b[k] = rhs;
    }
    (a, b)
}

fn fractionality(value: f64) -> f64 {
    (value - value.floor()).min(value.ceil() - value)
}

/// Dense form of a [`MipModel`] without its variable bounds.
struct CompiledModel {
    hessian: Option<Array2<f64>>,
    cost: Array1<f64>,
    constant: f64,
    a_ineq: Array2<f64>,
    b_ineq: Array1<f64>,
    a_eq: Array2<f64>,
    b_eq: Array1<f64>,
    lb: Vec<f64>,
    ub: Vec<f64>,
    binaries: Vec<usize>,
    sos1: Vec<Vec<usize>>,
}

impl CompiledModel {
    /// Continuous relaxation with the bounds `lb`, `ub`.
    fn solve_relaxation(&self, solver: &Clarabel, lb: &[f64], ub: &[f64]) -> Result<ProgramSolution> {
        let n = self.cost.len();
        if lb.iter().zip(ub).any(|(l, u)| l > u) {
            return Ok(ProgramSolution::sentinel(SolveStatus::Infeasible, n, 0));
        }
        let mut ineq_rows: Vec<(Array1<f64>, f64)> = self
            .a_ineq
            .rows()
            .into_iter()
            .zip(self.b_ineq.iter())
            .map(|(row, &b)| (row.to_owned(), b))
            .collect();
        let mut eq_rows: Vec<(Array1<f64>, f64)> = self
            .a_eq
            .rows()
            .into_iter()
            .zip(self.b_eq.iter())
            .map(|(row, &b)| (row.to_owned(), b))
            .collect();
        for i in 0..n {
            let mut unit = Array1::<f64>::zeros(n);
            unit[i] = 1.;
            if (ub[i] - lb[i]).abs() <= FIXED_TOL {
                eq_rows.push((unit, lb[i]));
                continue;
            }
            if ub[i].is_finite() {
                ineq_rows.push((unit.clone(), ub[i]));
            }
            if lb[i].is_finite() {
                ineq_rows.push((-unit, -lb[i]));
            }
        }
        let (a_ineq, b_ineq) = stack_rows(ineq_rows, n);
        let (a_eq, b_eq) = stack_rows(eq_rows, n);
        let mut sol = solver.solve(&ConvexProgram {
            hessian: self.hessian.as_ref(),
            cost: &self.cost,
            a_ineq: &a_ineq,
            b_ineq: &b_ineq,
            a_eq: Some(&a_eq),
            b_eq: Some(&b_eq),
        })?;
        sol.min += self.constant;
        Ok(sol)
    }

    /// The binary with the largest fractionality above `tol`, if any.
    fn most_fractional(&self, x: &Array1<f64>, tol: f64) -> Option<usize> {
        self.binaries
            .iter()
            .map(|&b| (b, fractionality(x[b])))
            .filter(|&(_, frac)| frac > tol)
            .max_by(|(_, f1), (_, f2)| f1.total_cmp(f2))
            .map(|(b, _)| b)
    }
}

/// Status of a mixed-integer solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipStatus {
    /// Optimal within the relative gap.
    Optimal,
    Infeasible,
    /// Time limit reached, best incumbent (if any) returned.
    TimeLimit,
    /// Node limit reached, best incumbent (if any) returned.
    NodeLimit,
    /// The tree was exhausted but some relaxations ended without an optimal
    /// or infeasible status, so their subtrees were never searched. The
    /// incumbent (if any) is not proven optimal, and no incumbent does not
    /// prove infeasibility.
    Incomplete,
}

/// Result of a mixed-integer solve.
#[derive(Debug, Clone)]
pub struct MipSolution {
    pub status: MipStatus,
    /// Best solution found, NaN-filled if there is none.
    pub x: Array1<f64>,
    /// Objective of `x`, NaN if there is none.
    pub objective: f64,
    /// Best lower bound on the optimal objective.
    pub bound: f64,
    pub nodes_explored: u64,
    /// Wall-clock time in seconds.
    pub solve_time: f64,
}

impl MipSolution {
    /// Returns true if a feasible solution was found.
    pub fn has_solution(&self) -> bool {
        !self.objective.is_nan()
    }

    pub fn value(&self, var: VarId) -> f64 {
        self.x.get(var.0).copied().unwrap_or(f64::NAN)
    }

    pub fn values(&self, vars: &[VarId]) -> Array1<f64> {
        vars.iter().map(|&v| self.value(v)).collect()
    }
}

/// A backend able to solve a [`MipModel`].
pub trait MixedIntegerSolver: fmt::Debug {
    fn solve(&self, model: &MipModel) -> Result<MipSolution>;
}

/// Open node of the search tree.
#[derive(Debug, Clone)]
struct SearchNode {
    id: u64,
    depth: usize,
    lb: Vec<f64>,
    ub: Vec<f64>,
    /// Lower bound inherited from the parent relaxation.
    bound: f64,
}

impl PartialEq for SearchNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SearchNode {}

impl PartialOrd for SearchNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SearchNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lowest bound first, deeper nodes first on ties
        other
            .bound
            .total_cmp(&self.bound)
            .then(self.depth.cmp(&other.depth))
    }
}

/// Best-bound branch and bound on the binary variables.
///
/// Branches on the most fractional binary; the up branch also fixes to 0 the
/// other members of every SOS1 set containing the branching variable. Binary
/// starting values (see [`MipModel::set_start`]) are fixed in a first
/// relaxation to obtain an initial incumbent; continuous starts are not used
/// by the interior-point relaxations.
#[derive(Debug, Clone, Default)]
pub struct BranchAndBound {
    settings: MipSettings,
}

impl BranchAndBound {
    pub fn new(settings: MipSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MipSettings {
        &self.settings
    }

    fn prunable(&self, bound: f64, incumbent: Option<f64>) -> bool {
        match incumbent {
            Some(obj) => bound >= obj - self.settings.mip_gap * obj.abs().max(1.),
            None => false,
        }
    }

    fn start_incumbent(
        &self,
        model: &MipModel,
        compiled: &CompiledModel,
        solver: &Clarabel,
    ) -> Result<Option<(Array1<f64>, f64)>> {
        let mut lb = compiled.lb.clone();
        let mut ub = compiled.ub.clone();
        let mut any_start = false;
        for &b in &compiled.binaries {
            if let Some(value) = model.start(VarId(b)) {
                let value = value.round().clamp(0., 1.);
                lb[b] = value;
                ub[b] = value;
                any_start = true;
            }
        }
        if !any_start {
            return Ok(None);
        }
        let sol = compiled.solve_relaxation(solver, &lb, &ub)?;
        if !sol.is_optimal() || compiled.most_fractional(&sol.argmin, self.settings.integrality_tol).is_some() {
            debug!("MIP start rejected ({:?})", sol.status);
            return Ok(None);
        }
        Ok(Some((round_binaries(sol.argmin, &compiled.binaries), sol.min)))
    }
}

fn round_binaries(mut x: Array1<f64>, binaries: &[usize]) -> Array1<f64> {
    for &b in binaries {
        x[b] = x[b].round();
    }
    x
}

impl MixedIntegerSolver for BranchAndBound {
    fn solve(&self, model: &MipModel) -> Result<MipSolution> {
        let start_time = Instant::now();
        let compiled = model.compile()?;
        let solver = Clarabel::new(self.settings.relaxation_settings());
        let tol = self.settings.integrality_tol;

        let mut incumbent = self.start_incumbent(model, &compiled, &solver)?;
        if let Some((_, obj)) = &incumbent {
            info!("MIP start accepted with objective {obj:.6e}");
        }

        let mut queue = BinaryHeap::new();
        queue.push(SearchNode {
            id: 0,
            depth: 0,
            lb: compiled.lb.clone(),
            ub: compiled.ub.clone(),
            bound: f64::NEG_INFINITY,
        });
        let mut next_id = 1;
        let mut nodes_explored = 0;
        // Lowest bound among nodes whose relaxation could not be solved.
        let mut dropped_bound: Option<f64> = None;

        let status = loop {
            if start_time.elapsed().as_secs_f64() > self.settings.time_limit {
                break MipStatus::TimeLimit;
            }
            if nodes_explored >= self.settings.max_nodes {
                break MipStatus::NodeLimit;
            }
            let Some(node) = queue.pop() else {
                break if dropped_bound.is_some() {
                    MipStatus::Incomplete
                } else if incumbent.is_some() {
                    MipStatus::Optimal
                } else {
                    MipStatus::Infeasible
                };
            };
            let incumbent_obj = incumbent.as_ref().map(|(_, obj)| *obj);
            if self.prunable(node.bound, incumbent_obj) {
                continue;
            }
            nodes_explored += 1;
            if self.settings.log_freq > 0 && nodes_explored % self.settings.log_freq == 0 {
                info!(
                    "B&B: {nodes_explored} nodes, {} open, incumbent {incumbent_obj:?}",
                    queue.len()
                );
            }

            let relaxation = compiled.solve_relaxation(&solver, &node.lb, &node.ub)?;
            match relaxation.status {
                SolveStatus::Optimal => {}
                SolveStatus::Infeasible => continue,
                other => {
                    warn!("Relaxation of node {} ended with status {other:?}, node dropped", node.id);
                    dropped_bound = Some(dropped_bound.map_or(node.bound, |b| b.min(node.bound)));
                    continue;
                }
            }
            let bound = relaxation.min;
            if self.prunable(bound, incumbent_obj) {
                continue;
            }

            let Some(var) = compiled.most_fractional(&relaxation.argmin, tol) else {
                debug!("New incumbent {bound:.6e} at node {} (depth {})", node.id, node.depth);
                incumbent = Some((round_binaries(relaxation.argmin, &compiled.binaries), bound));
                continue;
            };

            let mut down = SearchNode {
                id: next_id,
                depth: node.depth + 1,
                lb: node.lb.clone(),
                ub: node.ub.clone(),
                bound,
            };
            down.ub[var] = 0.;
            let mut up = SearchNode {
                id: next_id + 1,
                depth: node.depth + 1,
                lb: node.lb,
                ub: node.ub,
                bound,
            };
            up.lb[var] = 1.;
            for set in compiled.sos1.iter().filter(|set| set.contains(&var)) {
                for &other in set.iter().filter(|&&other| other != var) {
                    up.ub[other] = 0.;
                }
            }
            next_id += 2;
            queue.push(down);
            queue.push(up);
        };

        let open_bound = queue
            .iter()
            .map(|node| node.bound)
            .fold(dropped_bound.unwrap_or(f64::INFINITY), f64::min);
        let solve_time = start_time.elapsed().as_secs_f64();
        let solution = match incumbent {
            Some((x, objective)) => MipSolution {
                status,
                bound: if status == MipStatus::Optimal {
                    objective
                } else {
                    open_bound.min(objective)
                },
                x,
                objective,
                nodes_explored,
                solve_time,
            },
            None => MipSolution {
                status,
                x: Array1::from_elem(compiled.cost.len(), f64::NAN),
                objective: f64::NAN,
                bound: open_bound,
                nodes_explored,
                solve_time,
            },
        };
        debug!(
            "B&B finished with {:?} after {} nodes in {:.3}s",
            solution.status, solution.nodes_explored, solution.solve_time
        );
        Ok(solution)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn knapsack() -> (MipModel, Vec<VarId>) {
        let mut model = MipModel::new();
        let vars: Vec<VarId> = ["a", "b", "c"].iter().map(|n| model.add_binary(*n)).collect();
        model.add_constraint(
            LinExpr::weighted_sum(&vars, array![2., 1., 3.].view()),
            Sense::Le,
            4.,
        );
        model.set_objective(LinExpr::weighted_sum(&vars, array![-3., -2., -4.].view()));
        (model, vars)
    }

    #[test]
    fn test_lin_expr() {
        let mut model = MipModel::new();
        let x = model.add_continuous("x", 0., 1.);
        let y = model.add_continuous("y", 0., 1.);
        let mut expr = LinExpr::constant(1.).term(x, 2.).term(y, 0.);
        assert_eq!(expr.terms().len(), 1);
        expr.add_scaled(&LinExpr::new().term(y, 1.), -3.);
        assert_eq!(expr.evaluate(&[1., 2.]), -3.);
    }

    #[test]
    fn test_binary_bounds_are_clamped() {
        let mut model = MipModel::new();
        let d = model.add_variable("d", VariableKind::Binary, -5., 5.);
        let var = model.variable(d).unwrap();
        assert_eq!((var.lb, var.ub), (0., 1.));
        assert_eq!(model.binaries(), vec![d]);
    }

    #[test]
    fn test_named_constraints() {
        let mut model = MipModel::new();
        let x = model.add_continuous("x", f64::NEG_INFINITY, f64::INFINITY);
        model.add_named_constraint("init", LinExpr::new().term(x, 1.), Sense::Eq, 1.);
        model.add_named_constraint("init", LinExpr::new().term(x, 1.), Sense::Le, 2.);
        model.add_constraint(LinExpr::new().term(x, 1.), Sense::Ge, 0.);
        assert!(model.has_constraint("init"));
        assert!(model.remove_constraint("init"));
        assert!(!model.remove_constraint("init"));
        assert_eq!(model.n_constraints(), 1);
    }

    #[test]
    fn test_knapsack() {
        let (model, vars) = knapsack();
        let sol = BranchAndBound::default().solve(&model).unwrap();
        assert_eq!(sol.status, MipStatus::Optimal);
        assert!((sol.objective + 6.).abs() < 1e-6);
        assert_eq!(sol.values(&vars), array![0., 1., 1.]);
        assert!(model.is_feasible(sol.x.as_slice().unwrap(), 1e-6));
    }

    #[test]
    fn test_infeasible() {
        let mut model = MipModel::new();
        let a = model.add_binary("a");
        let b = model.add_binary("b");
        model.add_constraint(LinExpr::new().term(a, 1.).term(b, 1.), Sense::Ge, 3.);
        let sol = BranchAndBound::default().solve(&model).unwrap();
        assert_eq!(sol.status, MipStatus::Infeasible);
        assert!(!sol.has_solution());
        assert!(sol.value(a).is_nan());
    }

    #[test]
    fn test_quadratic_objective() {
        // min (x - 0.7)^2 + 0.1 d  s.t.  x <= d
        let mut model = MipModel::new();
        let x = model.add_continuous("x", 0., 1.);
        let d = model.add_binary("d");
        model.add_constraint(LinExpr::new().term(x, 1.).term(d, -1.), Sense::Le, 0.);
        model.set_objective(LinExpr::constant(0.49).term(x, -1.4).term(d, 0.1));
        model.add_quadratic_term(x, x, 1.);
        let sol = BranchAndBound::default().solve(&model).unwrap();
        assert_eq!(sol.status, MipStatus::Optimal);
        assert!((sol.objective - 0.1).abs() < 1e-6);
        assert!((sol.value(x) - 0.7).abs() < 1e-5);
        assert_eq!(sol.value(d), 1.);
        assert!((model.objective_value(sol.x.as_slice().unwrap()) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_sos1_selects_one_mode() {
        // Pick the cheapest of three modes, each enabling a different value of y.
        let mut model = MipModel::new();
        let y = model.add_continuous("y", -10., 10.);
        let d: Vec<VarId> = (0..3).map(|i| model.add_binary(format!("d[{i}]"))).collect();
        model.add_constraint(LinExpr::weighted_sum(&d, array![1., 1., 1.].view()), Sense::Eq, 1.);
        model.add_sos1(d.clone());
        // y = 1 d_0 + 2 d_1 + 3 d_2
        let mut link = LinExpr::weighted_sum(&d, array![1., 2., 3.].view());
        link.add_term(y, -1.);
        model.add_constraint(link, Sense::Eq, 0.);
        model.set_objective(LinExpr::new().term(y, 1.).term(d[0], 5.));
        let sol = BranchAndBound::default().solve(&model).unwrap();
        assert_eq!(sol.status, MipStatus::Optimal);
        assert_eq!(sol.values(&d), array![0., 1., 0.]);
        assert!((sol.objective - 2.).abs() < 1e-6);
    }

    #[test]
    fn test_node_limit_keeps_start_incumbent() {
        let (mut model, vars) = knapsack();
        model.set_start(vars[0], 1.);
        model.set_start(vars[1], 1.);
        model.set_start(vars[2], 0.);
        let solver = BranchAndBound::new(MipSettings::default().with_max_nodes(0));
        let sol = solver.solve(&model).unwrap();
        assert_eq!(sol.status, MipStatus::NodeLimit);
        assert!((sol.objective + 5.).abs() < 1e-6);
        assert!(sol.bound <= sol.objective);

        model.clear_starts();
        let sol = solver.solve(&model).unwrap();
        assert_eq!(sol.status, MipStatus::NodeLimit);
        assert!(!sol.has_solution());
    }

    #[test]
    fn test_unsolved_relaxation_is_not_proof() {
        // The relaxation is unbounded, so the root is dropped and nothing is proven.
        let mut model = MipModel::new();
        let y = model.add_continuous("y", f64::NEG_INFINITY, f64::INFINITY);
        let d = model.add_binary("d");
        model.add_constraint(LinExpr::new().term(y, 1.).term(d, -1.), Sense::Le, 0.);
        model.set_objective(LinExpr::new().term(y, 1.).term(d, 1.));
        let sol = BranchAndBound::default().solve(&model).unwrap();
        assert_eq!(sol.status, MipStatus::Incomplete);
        assert!(!sol.has_solution());
        assert_eq!(sol.bound, f64::NEG_INFINITY);
        assert_eq!(sol.nodes_explored, 1);
    }

    #[test]
    fn test_infeasible_start_is_ignored() {
        let (mut model, vars) = knapsack();
        for &v in &vars {
            model.set_start(v, 1.);
        }
        let sol = BranchAndBound::default().solve(&model).unwrap();
        assert_eq!(sol.status, MipStatus::Optimal);
        assert!((sol.objective + 6.).abs() < 1e-6);
    }

    #[test]
    fn test_compile_rejects_foreign_variables() {
        let mut model = MipModel::new();
        model.set_objective(LinExpr::new().term(VarId(3), 1.));
        assert!(matches!(
            BranchAndBound::default().solve(&model),
            Err(MpcError::Dimension { .. })
        ));
    }
}
