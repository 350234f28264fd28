//! Explicit solution of a parametric QP as a partition of the feasible set
//! into critical regions.
//!
//! Inside a critical region the optimal active set is constant, so the
//! optimal input is affine and the value function quadratic in $x_0$.
//! [`MpqpSolver`] discovers the regions by stepping across the facets of the
//! regions found so far, and stores them as the nodes of an undirected
//! [`petgraph`] graph whose edges are shared facets.

use std::collections::{HashMap, VecDeque};

use log::{debug, info, warn};
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, Axis};
use petgraph::{graph::NodeIndex, graph::UnGraph, visit::EdgeRef};

use crate::config::ExplicitConfig;
use crate::error::{MpcError, Result};
use crate::optimization::Clarabel;
use crate::parametric::{CondensedProgram, ParametricQp, ValueFunction};
use crate::polytope::Polytope;

/// Rows of a region's half-space representation closer than this are merged.
const REGION_TOL: f64 = 1e-9;

/// A polytope of initial states sharing the same optimal active set.
#[derive(Debug, Clone)]
pub struct CriticalRegion {
    /// Active set after deflation of linearly dependent rows (sorted).
    pub active_set: Vec<usize>,
    pub polytope: Polytope,
    pub u_offset: Array1<f64>,
    pub u_linear: Array2<f64>,
    pub value_function: ValueFunction,
    /// Chebyshev center and radius of `polytope`.
    pub center: Array1<f64>,
    pub radius: f64,
}

impl CriticalRegion {
    pub fn contains(&self, x: &Array1<f64>, tol: f64) -> bool {
        self.polytope.contains(x, tol)
    }

    /// The optimal stacked input $u_o + U_l x$.
    pub fn u_star(&self, x: &Array1<f64>) -> Array1<f64> {
        &self.u_offset + &self.u_linear.dot(x)
    }

    pub fn value(&self, x: &Array1<f64>) -> f64 {
        self.value_function.evaluate(x)
    }
}

/// Edge between two adjacent regions.
#[derive(Debug, Clone)]
pub struct SharedFacet {
    /// A point on the common facet.
    pub point: Array1<f64>,
}

/// An active set whose KKT system could not be inverted during exploration.
#[derive(Debug, Clone)]
pub struct FlaggedActiveSet {
    pub active_set: Vec<usize>,
    /// The initial state at which it was met.
    pub point: Array1<f64>,
    pub reason: String,
}

/// Critical regions of a parametric QP and their adjacency.
#[derive(Debug, Clone)]
pub struct CriticalRegionPartition {
    graph: UnGraph<CriticalRegion, SharedFacet>,
    flagged: Vec<FlaggedActiveSet>,
    lookup_tol: f64,
}

impl CriticalRegionPartition {
    fn new(lookup_tol: f64) -> Self {
        Self {
            graph: UnGraph::default(),
            flagged: Vec::new(),
            lookup_tol,
        }
    }

    /// The region containing `x`, if any.
    pub fn lookup(&self, x: &Array1<f64>) -> Option<&CriticalRegion> {
        self.locate(x).map(|i| &self.graph[i])
    }

    fn locate(&self, x: &Array1<f64>) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&i| self.graph[i].contains(x, self.lookup_tol))
    }

    /// Optimal stacked input and cost at `x`, `None` outside the partition.
    pub fn evaluate(&self, x: &Array1<f64>) -> Option<(Array1<f64>, f64)> {
        self.lookup(x).map(|region| (region.u_star(x), region.value(x)))
    }

    pub fn n_regions(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn regions(&self) -> impl Iterator<Item = &CriticalRegion> {
        self.graph.node_weights()
    }

    /// Pairs of adjacent regions with their shared facet.
    pub fn adjacent_regions(&self) -> impl Iterator<Item = (&CriticalRegion, &CriticalRegion, &SharedFacet)> {
        self.graph
            .edge_references()
            .map(|e| (&self.graph[e.source()], &self.graph[e.target()], e.weight()))
    }

    /// Regions sharing a facet with the region containing `x`.
    pub fn neighbors_of(&self, x: &Array1<f64>) -> Vec<&CriticalRegion> {
        match self.locate(x) {
            Some(i) => self.graph.neighbors(i).map(|j| &self.graph[j]).collect(),
            None => Vec::new(),
        }
    }

    pub fn flagged(&self) -> &[FlaggedActiveSet] {
        &self.flagged
    }

    pub fn graph(&self) -> &UnGraph<CriticalRegion, SharedFacet> {
        &self.graph
    }
}

/// A point beyond a facet of `parent`, still to be explored.
struct FacetCandidate {
    parent: NodeIndex,
    facet_point: Array1<f64>,
    normal: Array1<f64>,
}

enum Exploration {
    Region(CriticalRegion),
    Thin,
    Infeasible,
    Flagged(FlaggedActiveSet),
}

/// Builds a [`CriticalRegionPartition`] by exploring across region facets.
#[derive(Debug, Clone)]
pub struct MpqpSolver {
    config: ExplicitConfig,
    active_set_tol: f64,
    solver: Clarabel,
}

impl MpqpSolver {
    pub fn new(config: ExplicitConfig) -> Self {
        Self {
            config,
            active_set_tol: 1e-6,
            solver: Clarabel::default(),
        }
    }

    /// Tolerance used to detect active constraints (primal) and positive multipliers (dual).
    pub fn with_active_set_tol(mut self, tol: f64) -> Self {
        self.active_set_tol = tol;
        self
    }

    pub fn solve(&self, qp: &ParametricQp) -> Result<CriticalRegionPartition> {
        let n_x = qp.n_x();
        let mut partition = CriticalRegionPartition::new(self.config.lookup_tol);
        let Some((lifted_center, _)) = qp.lifted_polytope()?.chebyshev_center(self.config.max_radius)? else {
            warn!("The parametric QP is infeasible for every initial state");
            return Ok(partition);
        };
        let start = lifted_center.slice(s![..n_x]).to_owned();

        let mut visited: HashMap<Vec<usize>, NodeIndex> = HashMap::new();
        let mut worklist: VecDeque<FacetCandidate> = VecDeque::new();
        match self.explore(qp, &start)? {
            Exploration::Region(region) => {
                let root = self.insert(&mut partition, &mut visited, region);
                self.push_facets(&partition, root, &mut worklist)?;
            }
            Exploration::Flagged(flagged) => partition.flagged.push(flagged),
            Exploration::Thin | Exploration::Infeasible => {
                warn!("No full-dimensional critical region at the starting point {start}");
            }
        }

        while let Some(candidate) = worklist.pop_front() {
            let mut step = self.config.facet_step;
            for _ in 0..=self.config.step_retries {
                let x = &candidate.facet_point + &(&candidate.normal * step);
                step *= 10.;
                if partition.graph[candidate.parent].contains(&x, 0.) {
                    continue;
                }
                if let Some(existing) = partition.locate(&x) {
                    if existing != candidate.parent {
                        connect(&mut partition, candidate.parent, existing, &candidate.facet_point);
                        break;
                    }
                    continue;
                }
                match self.explore(qp, &x)? {
                    Exploration::Infeasible => break,
                    Exploration::Thin => continue,
                    Exploration::Flagged(flagged) => {
                        partition.flagged.push(flagged);
                        break;
                    }
                    Exploration::Region(region) => {
                        if let Some(&existing) = visited.get(&region.active_set) {
                            if existing == candidate.parent {
                                continue;
                            }
                            connect(&mut partition, candidate.parent, existing, &candidate.facet_point);
                            break;
                        }
                        let node = self.insert(&mut partition, &mut visited, region);
                        connect(&mut partition, candidate.parent, node, &candidate.facet_point);
                        self.push_facets(&partition, node, &mut worklist)?;
                        break;
                    }
                }
            }
        }

        info!(
            "Explicit solution with {} critical regions, {} adjacencies and {} flagged active sets",
            partition.n_regions(),
            partition.graph.edge_count(),
            partition.flagged.len()
        );
        Ok(partition)
    }

    fn insert(
        &self,
        partition: &mut CriticalRegionPartition,
        visited: &mut HashMap<Vec<usize>, NodeIndex>,
        region: CriticalRegion,
    ) -> NodeIndex {
        debug!(
            "Critical region {:?} with {} facets, radius {:.3e}",
            region.active_set,
            region.polytope.n_facets(),
            region.radius
        );
        let key = region.active_set.clone();
        let node = partition.graph.add_node(region);
        visited.insert(key, node);
        node
    }

    fn push_facets(
        &self,
        partition: &CriticalRegionPartition,
        node: NodeIndex,
        worklist: &mut VecDeque<FacetCandidate>,
    ) -> Result<()> {
        let polytope = &partition.graph[node].polytope;
        for i in 0..polytope.n_facets() {
            let Some((facet_point, _)) = polytope.facet_center(i, self.config.max_radius)? else {
                continue;
            };
            let row = polytope.lhs().row(i);
            let norm = row.dot(&row).sqrt();
            worklist.push_back(FacetCandidate {
                parent: node,
                facet_point,
                normal: row.mapv(|v| v / norm),
            });
        }
        Ok(())
    }

    /// Solve the QP at `x` and build the critical region of its optimal active set.
    fn explore(&self, qp: &ParametricQp, x: &Array1<f64>) -> Result<Exploration> {
        let rhs = qp.c() + &qp.c_x().dot(x);
        let f = qp.f_xu().t().dot(x) + qp.f_u();
        let sol = self.solver.quadratic_program(qp.f_uu(), &f, qp.c_u(), &rhs)?;
        if !sol.is_optimal() {
            return Ok(Exploration::Infeasible);
        }
        let primal = qp.active_set(x, &sol.argmin, self.active_set_tol);
        let exploration = self.region_of(qp, &primal, x)?;
        if !matches!(exploration, Exploration::Thin) {
            return Ok(exploration);
        }
        // Weakly active rows make the primal guess degenerate; trust the multipliers.
        let dual: Vec<usize> = sol
            .inequality_duals
            .iter()
            .enumerate()
            .filter(|(_, &l)| l > self.active_set_tol)
            .map(|(i, _)| i)
            .collect();
        if dual == primal {
            return Ok(Exploration::Thin);
        }
        self.region_of(qp, &dual, x)
    }

    fn region_of(&self, qp: &ParametricQp, active_set: &[usize], x: &Array1<f64>) -> Result<Exploration> {
        match self.critical_region(qp, active_set) {
            Ok(Some(region)) if region.radius >= self.config.min_radius => Ok(Exploration::Region(region)),
            Ok(_) => Ok(Exploration::Thin),
            Err(MpcError::SingularActiveSet { active_set, reason }) => {
                warn!("Skipping singular active set {active_set:?} at {x}: {reason}");
                Ok(Exploration::Flagged(FlaggedActiveSet {
                    active_set,
                    point: x.clone(),
                    reason,
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Region where `active_set` is optimal, `None` if it is empty.
    ///
    /// Primal feasibility of the inactive rows gives
    /// $(G_I Z_l - S_I) x \le W_I - G_I z_o$ and dual feasibility of the
    /// active rows gives $-\Lambda_l x \le \lambda_o$.
    pub fn critical_region(&self, qp: &ParametricQp, active_set: &[usize]) -> Result<Option<CriticalRegion>> {
        let z = qp.z_sensitivity(active_set)?;
        let reduced = qp.reduced();
        let inactive: Vec<usize> = (0..qp.n_constraints())
            .filter(|i| !z.active_set.contains(i))
            .collect();
        let g_i = reduced.g.select(Axis(0), &inactive);
        let s_i = reduced.s.select(Axis(0), &inactive);
        let w_i = reduced.w.select(Axis(0), &inactive);
        let lhs = concatenate![Axis(0), g_i.dot(&z.z_linear) - s_i, -&z.lambda_linear];
        let rhs = concatenate![Axis(0), w_i - g_i.dot(&z.z_offset), z.lambda_offset];
        let polytope = Polytope::new(lhs, rhs)?.minimal(REGION_TOL)?;
        let Some((center, radius)) = polytope.chebyshev_center(self.config.max_radius)? else {
            return Ok(None);
        };
        let (u_offset, u_linear) = qp.u_from_z(&z);
        let value_function = qp.value_from_z(&z);
        Ok(Some(CriticalRegion {
            active_set: z.active_set,
            polytope,
            u_offset,
            u_linear,
            value_function,
            center,
            radius,
        }))
    }
}

fn connect(partition: &mut CriticalRegionPartition, a: NodeIndex, b: NodeIndex, point: &Array1<f64>) {
    partition.graph.update_edge(a, b, SharedFacet { point: point.clone() });
}

/// Explicit solution of a QP obtained by hybrid condensing: the
/// initial-state rows are removed before exploring.
///
/// `initial_domain` is the domain of the first mode of the sequence, in
/// $(x, u)$. Only its rows that constrain $x$ alone may condense into rows
/// free of inputs; finding more of those is an [`MpcError::InvariantViolation`].
pub fn explicit_solution_from_hybrid_condensing(
    program: &CondensedProgram,
    initial_domain: &Polytope,
    config: &ExplicitConfig,
    zero_row_tol: f64,
) -> Result<CriticalRegionPartition> {
    let mut qp = program
        .as_quadratic()
        .ok_or(MpcError::Unsupported(
            "explicit solutions require a quadratic objective",
        ))?
        .clone();
    let n_x = qp.n_x();
    if initial_domain.dim() <= n_x {
        return Err(MpcError::dimension("initial domain", n_x + 1, initial_domain.dim()));
    }
    let max_initial_rows = state_only_rows(initial_domain, n_x, zero_row_tol);
    qp.remove_initial_state_constraints(max_initial_rows, zero_row_tol)?;
    MpqpSolver::new(config.clone()).solve(&qp)
}

/// Rows of a domain in $(x, u)$ with a zero input part and a nonzero state part.
fn state_only_rows(domain: &Polytope, n_x: usize, tol: f64) -> usize {
    let norm = |row: ArrayView1<f64>| row.dot(&row).sqrt();
    domain
        .lhs()
        .rows()
        .into_iter()
        .filter(|row| norm(row.slice(s![n_x..])) < tol && norm(row.slice(s![..n_x])) >= tol)
        .count()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::condensing::{condense_ocp, ObjectiveWeights};
    use crate::config::ObjectiveNorm;
    use crate::dynamics::{AffineSystem, PwaSystem, SwitchingSequence};

    /// $x' = x + u$, $|x| \le 10$, $|u| \le 1$, $N = 2$, unit weights, stage-0 rows removed.
    fn scalar_qp() -> ParametricQp {
        let program = scalar_program();
        let mut qp = program.into_quadratic().unwrap();
        qp.remove_initial_state_constraints(2, 1e-10).unwrap();
        qp
    }

    fn scalar_system(input_set: Polytope) -> PwaSystem {
        PwaSystem::from_orthogonal_domains(
            vec![AffineSystem::linear(array![[1.]], array![[1.]]).unwrap()],
            &[Polytope::from_bounds(&array![-10.], &array![10.]).unwrap()],
            &[input_set],
        )
        .unwrap()
    }

    fn scalar_program_of(system: &PwaSystem) -> CondensedProgram {
        let weights = ObjectiveWeights::new(array![[1.]], array![[1.]], array![[1.]]).unwrap();
        condense_ocp(
            system,
            ObjectiveNorm::Two,
            &weights,
            &Polytope::from_bounds(&array![-10.], &array![10.]).unwrap(),
            &SwitchingSequence::constant(0, 2),
        )
        .unwrap()
    }

    fn scalar_program() -> CondensedProgram {
        scalar_program_of(&scalar_system(Polytope::from_bounds(&array![-1.], &array![1.]).unwrap()))
    }

    #[test]
    fn test_scalar_partition() {
        let partition = MpqpSolver::new(ExplicitConfig::default()).solve(&scalar_qp()).unwrap();
        // Breakpoints at +-5/3 and +-3, feasible set [-11, 11].
        assert_eq!(partition.n_regions(), 5);
        assert_eq!(partition.graph().edge_count(), 4);
        assert!(partition.flagged().is_empty());

        let unconstrained = partition.lookup(&array![0.5]).unwrap();
        assert!(unconstrained.active_set.is_empty());
        assert!((unconstrained.u_linear[(0, 0)] + 0.6).abs() < 1e-9);

        let (u, cost) = partition.evaluate(&array![2.]).unwrap();
        assert!((u[0] + 1.).abs() < 1e-7);
        assert!((u[1] + 0.5).abs() < 1e-7);
        assert!(cost.is_finite());

        let (_, cost) = partition.evaluate(&array![5.]).unwrap();
        assert!((cost - 52.).abs() < 1e-6);

        assert!(partition.lookup(&array![12.]).is_none());
        assert!(partition.lookup(&array![-10.9]).is_some());
    }

    #[test]
    fn test_explicit_matches_online_solution() {
        let qp = scalar_qp();
        let partition = MpqpSolver::new(ExplicitConfig::default()).solve(&qp).unwrap();
        for &x in &[-10.5, -4., -2.5, -1., 0.3, 1.9, 2.7, 8.] {
            let x0 = array![x];
            let online = qp.solve(&x0).unwrap();
            let (u, cost) = partition.evaluate(&x0).unwrap();
            assert!((online.cost - cost).abs() < 1e-6, "x0 = {x}");
            assert!(online.u.abs_diff_eq(&u, 1e-5), "x0 = {x}");
        }
    }

    #[test]
    fn test_adjacent_regions_agree_on_the_facet() {
        let partition = MpqpSolver::new(ExplicitConfig::default()).solve(&scalar_qp()).unwrap();
        for (a, b, facet) in partition.adjacent_regions() {
            assert!((a.value(&facet.point) - b.value(&facet.point)).abs() < 1e-6);
            assert!(a.u_star(&facet.point).abs_diff_eq(&b.u_star(&facet.point), 1e-6));
        }
        assert_eq!(partition.neighbors_of(&array![0.]).len(), 2);
        assert_eq!(partition.neighbors_of(&array![10.]).len(), 1);
    }

    #[test]
    fn test_explicit_solution_from_hybrid_condensing() {
        let system = scalar_system(Polytope::from_bounds(&array![-1.], &array![1.]).unwrap());
        let partition = explicit_solution_from_hybrid_condensing(
            &scalar_program_of(&system),
            &system.domains()[0],
            &ExplicitConfig::default(),
            1e-10,
        )
        .unwrap();
        assert_eq!(partition.n_regions(), 5);
    }

    #[test]
    fn test_hybrid_condensing_with_stray_input_free_rows() {
        // 0 u <= 1 condenses into rows without inputs at every stage.
        let u_set = Polytope::new(array![[1.], [-1.], [0.]], array![1., 1., 1.]).unwrap();
        let system = scalar_system(u_set);
        let result = explicit_solution_from_hybrid_condensing(
            &scalar_program_of(&system),
            &system.domains()[0],
            &ExplicitConfig::default(),
            1e-10,
        );
        assert!(matches!(result, Err(MpcError::InvariantViolation(_))));
    }

    #[test]
    fn test_hybrid_condensing_checks_domain_dimension() {
        let result = explicit_solution_from_hybrid_condensing(
            &scalar_program(),
            &Polytope::from_bounds(&array![-10.], &array![10.]).unwrap(),
            &ExplicitConfig::default(),
            1e-10,
        );
        assert!(matches!(result, Err(MpcError::Dimension { .. })));
    }

    #[test]
    fn test_explicit_solution_requires_quadratic_objective() {
        let system = PwaSystem::from_orthogonal_domains(
            vec![AffineSystem::linear(array![[1.]], array![[1.]]).unwrap()],
            &[Polytope::from_bounds(&array![-10.], &array![10.]).unwrap()],
            &[Polytope::from_bounds(&array![-1.], &array![1.]).unwrap()],
        )
        .unwrap();
        let weights = ObjectiveWeights::new(array![[1.]], array![[1.]], array![[1.]]).unwrap();
        let lp = condense_ocp(
            &system,
            ObjectiveNorm::One,
            &weights,
            &Polytope::from_bounds(&array![-10.], &array![10.]).unwrap(),
            &SwitchingSequence::constant(0, 2),
        )
        .unwrap();
        assert!(matches!(
            explicit_solution_from_hybrid_condensing(&lp, &system.domains()[0], &ExplicitConfig::default(), 1e-10),
            Err(MpcError::Unsupported(_))
        ));
    }

    #[test]
    fn test_critical_region_of_unconstrained_set() {
        let qp = scalar_qp();
        let region = MpqpSolver::new(ExplicitConfig::default())
            .critical_region(&qp, &[])
            .unwrap()
            .unwrap();
        assert!(region.contains(&array![5. / 3. - 1e-6], 1e-9));
        assert!(!region.contains(&array![5. / 3. + 1e-3], 1e-9));
        assert!((region.radius - 5. / 3.).abs() < 1e-6);
    }
}
