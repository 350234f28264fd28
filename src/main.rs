use hybrid_mpc as mpc;
use mpc::library::uniform_sampler;
use mpc::{
    closed_loop, AffineSystem, ControllerConfig, FeasibleSetLibrary, LibraryConfig, MpcHybridController,
    ObjectiveNorm, ObjectiveWeights, Polytope, PwaSystem, WarmStart,
};
use ndarray::array;
use rand::{rngs::StdRng, SeedableRng};

fn main() -> mpc::Result<()> {
    // Two modes x' = x + u and x' = 0.5 x + u + 1 split at x = 0.
    let u_set = Polytope::from_bounds(&array![-1.], &array![1.])?;
    let system = PwaSystem::from_orthogonal_domains(
        vec![
            AffineSystem::linear(array![[1.]], array![[1.]])?,
            AffineSystem::new(array![[0.5]], array![[1.]], array![1.])?,
        ],
        &[
            Polytope::from_bounds(&array![-10.], &array![0.])?,
            Polytope::from_bounds(&array![0.], &array![10.])?,
        ],
        &[u_set.clone(), u_set],
    )?;
    let weights = ObjectiveWeights::with_riccati_terminal(&system.affine_systems()[0], array![[1.]], array![[0.1]])?;
    let terminal_set = Polytope::from_bounds(&array![-10.], &array![10.])?;
    let mut controller = MpcHybridController::new(
        system.clone(),
        ControllerConfig::new(4, ObjectiveNorm::Two),
        weights,
        terminal_set,
    )?;

    let solution = controller.feedforward(&array![-6.], &WarmStart::default())?;
    println!("MIQP from x0 = -6: cost {:.4}", solution.cost);
    if let Some(ss) = &solution.switching_sequence {
        println!("switching sequence {ss}");
    }

    let mut library = FeasibleSetLibrary::new(controller, LibraryConfig::default());
    let stats = library.sample_policy(30, uniform_sampler(StdRng::seed_from_u64(0), array![-10.], array![10.]));
    println!("{stats:?}");

    let trajectory = closed_loop(&system, &array![-6.], 10, |x| {
        let (u, _) = library.feedback(x, None, None)?;
        Ok(u)
    })?;
    println!("{}", trajectory.states);
    Ok(())
}
