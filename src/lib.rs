//! A library for model predictive control of piecewise-affine (PWA) systems
//!
//! The primary uses involve describing a switched system as a set of
//! affine modes with polyhedral domains, condensing the optimal control
//! problem of a switching sequence into a parametric program in the
//! initial state, and then controlling the system either online (one LP/QP
//! or one mixed-integer program per query) or offline (critical regions and
//! a library of feasible switching sequences).
//!
//! The `dynamics`, `condensing` and `parametric` modules define the core
//! types, with the controllers built on top of them in `controller`,
//! `hybrid` and `library`. The most commonly used functionality is
//! re-exported to the top level for ease-of-use.

pub mod condensing;
pub mod config;
pub mod control_theory;
pub mod controller;
pub mod dynamics;
pub mod error;
pub mod explicit;
pub mod hybrid;
pub mod library;
pub mod mip;
pub mod optimization;
pub mod parametric;
pub mod polytope;
pub mod simulation;

pub use condensing::{condense_ocp, ObjectiveWeights};
pub use config::{ControllerConfig, ExplicitConfig, LibraryConfig, ObjectiveNorm, RegionPolicy};
pub use controller::MpcController;
pub use dynamics::{AffineSystem, Dynamics, PwaSystem, SwitchingSequence};
pub use error::{MpcError, Result};
pub use explicit::{CriticalRegion, CriticalRegionPartition, MpqpSolver};
pub use hybrid::{HybridSolution, MpcHybridController, WarmStart};
pub use library::{FeasibleSetLibrary, LibrarySolution, SampleOutcome};
pub use parametric::{CondensedProgram, ParametricLp, ParametricQp};
pub use polytope::{InnerApproximation, Polytope};
pub use simulation::{closed_loop, Stepper};
