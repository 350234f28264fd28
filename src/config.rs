//! Configuration for the controllers and their numerical backends.
//!
//! Every struct has a [`Default`] implementation carrying the tolerances the
//! controllers are tuned for, and every struct round-trips through serde so a
//! configuration can be loaded from JSON.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Norm used for the stage and terminal costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveNorm {
    /// $\sum_k \|Q x_k\|_1 + \|R u_k\|_1 + \|P x_N\|_1$, condensed into a parametric LP.
    One,
    /// $\sum_k x_k^\text{T} Q x_k + u_k^\text{T} R u_k + x_N^\text{T} P x_N$, condensed into a parametric QP.
    Two,
}

/// Settings forwarded to the continuous LP/QP backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Maximum interior-point iterations.
    pub max_iter: u32,
    /// Absolute duality gap tolerance.
    pub tol_gap_abs: f64,
    /// Relative duality gap tolerance.
    pub tol_gap_rel: f64,
    /// Primal/dual feasibility tolerance.
    pub tol_feas: f64,
    /// Time limit in seconds (`None` = unlimited).
    pub time_limit: Option<f64>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iter: 200,
            tol_gap_abs: 1e-10,
            tol_gap_rel: 1e-10,
            tol_feas: 1e-10,
            time_limit: None,
        }
    }
}

/// Settings of the branch-and-bound mixed-integer solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MipSettings {
    /// Wall-clock limit for one solve, in seconds.
    pub time_limit: f64,
    /// Optimality tolerance of the relaxations.
    pub optimality_tol: f64,
    /// Feasibility tolerance of the relaxations.
    pub feasibility_tol: f64,
    /// A binary is integral if it is within this distance of 0 or 1.
    pub integrality_tol: f64,
    /// Relative gap at which a node is pruned against the incumbent.
    pub mip_gap: f64,
    /// Maximum number of explored nodes.
    pub max_nodes: u64,
    /// Emit progress at `info` level every `log_freq` nodes (0 disables it).
    pub log_freq: u64,
}

impl Default for MipSettings {
    fn default() -> Self {
        Self {
            time_limit: 600.,
            optimality_tol: 1e-9,
            feasibility_tol: 1e-9,
            integrality_tol: 1e-6,
            mip_gap: 1e-9,
            max_nodes: 1_000_000,
            log_freq: 0,
        }
    }
}

impl MipSettings {
    /// Set the time limit in seconds.
    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = seconds;
        self
    }

    /// Set the maximum number of nodes.
    pub fn with_max_nodes(mut self, nodes: u64) -> Self {
        self.max_nodes = nodes;
        self
    }

    /// Settings of the continuous relaxations solved at every node.
    pub fn relaxation_settings(&self) -> SolverSettings {
        SolverSettings {
            tol_gap_abs: self.optimality_tol,
            tol_gap_rel: self.optimality_tol,
            tol_feas: self.feasibility_tol,
            ..Default::default()
        }
    }
}

/// Configuration shared by [`MpcController`](crate::controller::MpcController)
/// and [`MpcHybridController`](crate::hybrid::MpcHybridController).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Prediction horizon $N$.
    pub horizon: usize,
    pub objective_norm: ObjectiveNorm,
    /// Distance from equality under which a constraint is considered active.
    pub active_set_tol: f64,
    /// Matrix entries below this magnitude are zeroed before building the MIP.
    pub clean_tol: f64,
    /// Rows of $C_u$ with a smaller norm are initial-state pseudo-constraints.
    pub zero_row_tol: f64,
    /// Settings of the LP/QP backend.
    pub solver: SolverSettings,
    /// Settings of the mixed-integer backend.
    pub mip: MipSettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            horizon: 10,
            objective_norm: ObjectiveNorm::Two,
            active_set_tol: 1e-6,
            clean_tol: 1e-7,
            zero_row_tol: 1e-10,
            solver: SolverSettings::default(),
            mip: MipSettings::default(),
        }
    }
}

impl ControllerConfig {
    /// Create a configuration with the given horizon and norm and default tolerances.
    pub fn new(horizon: usize, objective_norm: ObjectiveNorm) -> Self {
        Self {
            horizon,
            objective_norm,
            ..Default::default()
        }
    }

    /// Parse a configuration from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Shape of the feasible regions grown by the
/// [`FeasibleSetLibrary`](crate::library::FeasibleSetLibrary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RegionPolicy {
    /// Seed each region with the support points of the sequence's feasible set
    /// along $\pm e_i$, then grow it with every observed sample.
    #[default]
    SupportSeeded,
    /// The region is the convex hull of the observed samples only.
    SampledOnly,
}

/// Configuration of the feasible-set library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub region_policy: RegionPolicy,
    /// A point belongs to a region if its distance (1-norm) to the hull is below this value.
    pub containment_tol: f64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            region_policy: RegionPolicy::default(),
            containment_tol: 1e-7,
        }
    }
}

/// Configuration of the explicit (critical region) solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplicitConfig {
    /// Initial distance stepped across a facet to reach the neighboring region.
    pub facet_step: f64,
    /// Number of times the step is enlarged tenfold before giving up on a facet.
    pub step_retries: usize,
    /// Regions whose Chebyshev radius is below this value are discarded.
    pub min_radius: f64,
    /// Cap on Chebyshev radii, so that unbounded regions still have a center.
    pub max_radius: f64,
    /// Tolerance of point location queries.
    pub lookup_tol: f64,
}

impl Default for ExplicitConfig {
    fn default() -> Self {
        Self {
            facet_step: 1e-4,
            step_retries: 3,
            min_radius: 1e-7,
            max_radius: 1e3,
            lookup_tol: 1e-8,
        }
    }
}
