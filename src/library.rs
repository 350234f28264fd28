//! Feasible-set library: a cache of the switching sequences found by the
//! hybrid controller.
//!
//! Each cached sequence keeps its condensed program and an inner
//! approximation of the initial states for which that program is feasible.
//! Online, the library replaces the mixed-integer program by one LP/QP per
//! candidate sequence.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::{debug, info, warn};
use ndarray::{s, Array1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{LibraryConfig, RegionPolicy, SolverSettings};
use crate::dynamics::SwitchingSequence;
use crate::error::{MpcError, Result};
use crate::hybrid::{MpcHybridController, WarmStart};
use crate::optimization::Clarabel;
use crate::parametric::{destack, CondensedProgram};
use crate::polytope::InnerApproximation;

/// Region of initial states known to be feasible for a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeasibleRegion {
    /// Placeholder of a sequence that has not been observed yet.
    Empty,
    Inner(InnerApproximation),
}

impl FeasibleRegion {
    pub fn contains(&self, x: &Array1<f64>) -> Result<bool> {
        match self {
            FeasibleRegion::Empty => Ok(false),
            FeasibleRegion::Inner(inner) => inner.applies_to(x),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FeasibleRegion::Empty)
    }
}

/// Cached data of one switching sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub program: CondensedProgram,
    pub feasible_region: FeasibleRegion,
}

/// What [`FeasibleSetLibrary::include_sample`] did with a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    /// Already covered by a cached region: nothing was solved.
    Rejected,
    /// The optimal sequence was cached and its region grew.
    Included(SwitchingSequence),
    /// The optimal sequence was new and has been cached.
    NewSequence(SwitchingSequence),
    /// The hybrid program has no solution from this state.
    Infeasible,
}

/// Counters of [`FeasibleSetLibrary::sample_policy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplingStats {
    pub new_sequences: usize,
    pub included: usize,
    pub rejected: usize,
    pub infeasible: usize,
    /// Samples whose processing raised an error.
    pub failed: usize,
}

impl SamplingStats {
    pub fn total(&self) -> usize {
        self.new_sequences + self.included + self.rejected + self.infeasible + self.failed
    }
}

/// Best plan among the candidate sequences.
///
/// If no candidate is feasible, `u` and `cost` are NaN and
/// `switching_sequence` is `None`.
#[derive(Debug, Clone)]
pub struct LibrarySolution {
    pub u: Vec<Array1<f64>>,
    pub cost: f64,
    pub switching_sequence: Option<SwitchingSequence>,
    /// Cost of every evaluated candidate, in evaluation order.
    pub costs: Vec<(SwitchingSequence, f64)>,
}

#[derive(Debug)]
pub struct FeasibleSetLibrary {
    controller: MpcHybridController,
    config: LibraryConfig,
    entries: HashMap<SwitchingSequence, LibraryEntry>,
}

impl FeasibleSetLibrary {
    pub fn new(controller: MpcHybridController, config: LibraryConfig) -> Self {
        Self {
            controller,
            config,
            entries: HashMap::new(),
        }
    }

    pub fn controller(&self) -> &MpcHybridController {
        &self.controller
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, switching_sequence: &SwitchingSequence) -> Option<&LibraryEntry> {
        self.entries.get(switching_sequence)
    }

    /// Cached sequences, sorted.
    pub fn switching_sequences(&self) -> Vec<&SwitchingSequence> {
        let mut keys: Vec<_> = self.entries.keys().collect();
        keys.sort();
        keys
    }

    /// `true` if a cached region already contains `x`.
    pub fn sampling_rejection(&self, x: &Array1<f64>) -> Result<bool> {
        for entry in self.entries.values() {
            if entry.feasible_region.contains(x)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Sorted sequences whose region contains `x`.
    pub fn get_feasible_switching_sequences(&self, x: &Array1<f64>) -> Result<Vec<SwitchingSequence>> {
        let mut feasible = Vec::new();
        for (ss, entry) in &self.entries {
            if entry.feasible_region.contains(x)? {
                feasible.push(ss.clone());
            }
        }
        feasible.sort();
        Ok(feasible)
    }

    /// Solve the hybrid program from `x` (unless `x` is already covered) and
    /// record its optimal sequence.
    pub fn include_sample(&mut self, x: &Array1<f64>) -> Result<SampleOutcome> {
        if self.sampling_rejection(x)? {
            return Ok(SampleOutcome::Rejected);
        }
        let solution = self.controller.feedforward(x, &WarmStart::default())?;
        let Some(ss) = solution.switching_sequence else {
            debug!("No switching sequence from {x} ({:?})", solution.status);
            return Ok(SampleOutcome::Infeasible);
        };
        let settings = &self.controller.config().solver;
        match self.entries.entry(ss.clone()) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if let FeasibleRegion::Inner(inner) = &mut entry.feasible_region {
                    inner.include_point(x)?;
                } else {
                    let region = seeded_region(&entry.program, x, &self.config, settings)?;
                    entry.feasible_region = FeasibleRegion::Inner(region);
                }
                Ok(SampleOutcome::Included(ss))
            }
            Entry::Vacant(vacant) => {
                info!("New switching sequence {ss}");
                let program = self.controller.condense_program(&ss)?;
                let region = seeded_region(&program, x, &self.config, settings)?;
                vacant.insert(LibraryEntry {
                    program,
                    feasible_region: FeasibleRegion::Inner(region),
                });
                Ok(SampleOutcome::NewSequence(ss))
            }
        }
    }

    /// Process `n_samples` states drawn from `sampler`.
    ///
    /// A sample whose processing fails is logged and counted, and sampling goes on.
    pub fn sample_policy<F>(&mut self, n_samples: usize, mut sampler: F) -> SamplingStats
    where
        F: FnMut() -> Array1<f64>,
    {
        let mut stats = SamplingStats::default();
        for i in 0..n_samples {
            let x = sampler();
            match self.include_sample(&x) {
                Ok(SampleOutcome::Rejected) => stats.rejected += 1,
                Ok(SampleOutcome::Included(_)) => stats.included += 1,
                Ok(SampleOutcome::NewSequence(_)) => stats.new_sequences += 1,
                Ok(SampleOutcome::Infeasible) => stats.infeasible += 1,
                Err(err) => {
                    warn!("Sample {i} at {x} failed: {err}");
                    stats.failed += 1;
                }
            }
        }
        info!(
            "{n_samples} samples: {} new sequences, {} included, {} rejected, {} infeasible, {} failed",
            stats.new_sequences, stats.included, stats.rejected, stats.infeasible, stats.failed
        );
        stats
    }

    /// Best plan from `x` over the cached sequences whose region contains `x`.
    ///
    /// `priority` is evaluated first; a sequence missing from the library
    /// is condensed for this query only. At most `max_candidates` sequences
    /// are evaluated. A candidate replaces the incumbent if its cost is
    /// strictly lower, NaN costs being infeasible.
    pub fn feedforward(
        &self,
        x: &Array1<f64>,
        priority: Option<&SwitchingSequence>,
        max_candidates: Option<usize>,
    ) -> Result<LibrarySolution> {
        let (n_u, horizon) = (self.controller.system().n_u(), self.controller.horizon());
        let mut candidates = self.get_feasible_switching_sequences(x)?;
        if let Some(priority) = priority {
            candidates.retain(|ss| ss != priority);
            candidates.insert(0, priority.clone());
        }
        if let Some(max) = max_candidates {
            if max < candidates.len() {
                debug!("Evaluating {max} of {} candidate sequences", candidates.len());
                candidates.truncate(max);
            }
        }

        let mut best = LibrarySolution {
            u: vec![Array1::from_elem(n_u, f64::NAN); horizon],
            cost: f64::NAN,
            switching_sequence: None,
            costs: Vec::with_capacity(candidates.len()),
        };
        for ss in candidates {
            let solution = match self.entries.get(&ss) {
                Some(entry) => entry.program.solve(x)?,
                None => self.controller.condense_program(&ss)?.solve(x)?,
            };
            let cost = solution.cost;
            if !cost.is_nan() && (best.cost.is_nan() || cost < best.cost) {
                best.u = destack(&solution.u, n_u)?;
                best.cost = cost;
                best.switching_sequence = Some(ss.clone());
            }
            best.costs.push((ss, cost));
        }
        Ok(best)
    }

    /// First input of the best plan and its sequence.
    pub fn feedback(
        &self,
        x: &Array1<f64>,
        priority: Option<&SwitchingSequence>,
        max_candidates: Option<usize>,
    ) -> Result<(Array1<f64>, Option<SwitchingSequence>)> {
        let mut solution = self.feedforward(x, priority, max_candidates)?;
        Ok((solution.u.swap_remove(0), solution.switching_sequence))
    }

    /// Cache, with an empty region, every shift of every cached sequence
    /// padded with `terminal_mode`.
    ///
    /// Returns the number of sequences added.
    pub fn add_shifted_switching_sequences(&mut self, terminal_mode: usize) -> Result<usize> {
        if terminal_mode >= self.controller.system().n_sys() {
            return Err(MpcError::dimension(
                "terminal mode",
                self.controller.system().n_sys(),
                terminal_mode,
            ));
        }
        let keys: Vec<SwitchingSequence> = self.switching_sequences().into_iter().cloned().collect();
        let mut added = 0;
        for ss in keys {
            for k in 1..ss.len() {
                if let Entry::Vacant(vacant) = self.entries.entry(ss.shifted(k, terminal_mode)) {
                    let program = self.controller.condense_program(vacant.key())?;
                    vacant.insert(LibraryEntry {
                        program,
                        feasible_region: FeasibleRegion::Empty,
                    });
                    added += 1;
                }
            }
        }
        debug!("Added {added} shifted switching sequences");
        Ok(added)
    }

    /// The cached entries as a JSON list of `[sequence, entry]` pairs.
    pub fn entries_to_json(&self) -> Result<String> {
        let mut pairs: Vec<_> = self.entries.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        Ok(serde_json::to_string(&pairs)?)
    }

    /// Insert the entries of a document written by
    /// [`FeasibleSetLibrary::entries_to_json`], replacing cached ones.
    ///
    /// Returns the number of loaded entries.
    pub fn load_entries_json(&mut self, json: &str) -> Result<usize> {
        let pairs: Vec<(SwitchingSequence, LibraryEntry)> = serde_json::from_str(json)?;
        let horizon = self.controller.horizon();
        let n_loaded = pairs.len();
        for (ss, mut entry) in pairs {
            ss.check_horizon(horizon)?;
            entry.program = entry
                .program
                .with_solver(Clarabel::new(self.controller.config().solver.clone()));
            self.entries.insert(ss, entry);
        }
        Ok(n_loaded)
    }
}

/// A region of `program` containing `x`.
///
/// With [`RegionPolicy::SupportSeeded`] the region also contains the
/// maximizer and minimizer of every coordinate of $x_0$ over the feasible set.
fn seeded_region(
    program: &CondensedProgram,
    x: &Array1<f64>,
    config: &LibraryConfig,
    settings: &SolverSettings,
) -> Result<InnerApproximation> {
    let mut region = InnerApproximation::new(config.containment_tol);
    if config.region_policy == RegionPolicy::SupportSeeded {
        let lifted = program.lifted_polytope()?;
        let solver = Clarabel::new(settings.clone());
        let n_x = program.n_x();
        for i in 0..n_x {
            for sign in [1., -1.] {
                let mut cost = Array1::zeros(lifted.dim());
                cost[i] = -sign;
                let sol = solver.linear_program(&cost, lifted.lhs(), lifted.rhs())?;
                if sol.is_optimal() {
                    region.include_point(&sol.argmin.slice(s![..n_x]).to_owned())?;
                } else {
                    debug!("No support point along {sign} e_{i}: {:?}", sol.status);
                }
            }
        }
    }
    region.include_point(x)?;
    Ok(region)
}

/// Sampler of the box $[x_{min}, x_{max}]$ with uniform distribution.
pub fn uniform_sampler<R: Rng>(
    mut rng: R,
    x_min: Array1<f64>,
    x_max: Array1<f64>,
) -> impl FnMut() -> Array1<f64> {
    move || {
        Array1::from_shape_fn(x_min.len(), |i| {
            x_min[i] + rng.gen::<f64>() * (x_max[i] - x_min[i])
        })
    }
}
