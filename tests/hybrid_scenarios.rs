use hybrid_mpc::hybrid::big_m_domains;
use hybrid_mpc::optimization::Clarabel;
use hybrid_mpc::{
    closed_loop, condense_ocp, AffineSystem, ControllerConfig, ExplicitConfig, FeasibleSetLibrary, LibraryConfig,
    MpcController, MpcHybridController, ObjectiveNorm, ObjectiveWeights, Polytope, PwaSystem, RegionPolicy,
    SampleOutcome, SwitchingSequence, WarmStart,
};
use ndarray::{array, Array1};
use proptest::prelude::*;

fn unit_weights() -> ObjectiveWeights {
    ObjectiveWeights::new(array![[1.]], array![[1.]], array![[1.]]).unwrap()
}

fn scalar_controller() -> MpcController {
    MpcController::new(
        array![[1.]],
        array![[1.]],
        ControllerConfig::new(2, ObjectiveNorm::Two),
        unit_weights(),
        Polytope::from_bounds(&array![-10.], &array![10.]).unwrap(),
        Polytope::from_bounds(&array![-1.], &array![1.]).unwrap(),
        None,
    )
    .unwrap()
}

/// $x' = x + u$ on $x \in [-10, -1]$ (mode 0) and $x \in [1, 10]$ (mode 1), $|u| \le 1$.
fn two_mode_system() -> PwaSystem {
    let system = AffineSystem::linear(array![[1.]], array![[1.]]).unwrap();
    let u_dom = Polytope::from_bounds(&array![-1.], &array![1.]).unwrap();
    PwaSystem::from_orthogonal_domains(
        vec![system.clone(), system],
        &[
            Polytope::from_bounds(&array![-10.], &array![-1.]).unwrap(),
            Polytope::from_bounds(&array![1.], &array![10.]).unwrap(),
        ],
        &[u_dom.clone(), u_dom],
    )
    .unwrap()
}

fn terminal_set() -> Polytope {
    Polytope::from_bounds(&array![-10.], &array![10.]).unwrap()
}

fn hybrid_controller() -> MpcHybridController {
    MpcHybridController::new(
        two_mode_system(),
        ControllerConfig::new(2, ObjectiveNorm::Two),
        unit_weights(),
        terminal_set(),
    )
    .unwrap()
}

#[test]
fn test_scalar_quadratic_mpc() {
    let controller = scalar_controller();
    let (u, cost) = controller.feedforward(&array![5.]).unwrap();
    assert!(cost.is_finite());
    assert!(u[0][0].abs() <= 1. + 1e-7);
    assert!((cost - 52.).abs() < 1e-5);
}

#[test]
fn test_scalar_closed_loop_is_admissible() {
    let controller = scalar_controller();
    let result = closed_loop(controller.system(), &array![5.], 8, |x| controller.feedback(x)).unwrap();
    assert_eq!(result.steps(), 8);
    assert!(result.inputs.iter().all(|u| u.abs() <= 1. + 1e-7));
    assert!(result.states.iter().all(|x| x.abs() <= 10. + 1e-7));
    assert!(result.states[(0, 8)].abs() < 0.1);
}

#[test]
fn test_library_selects_mode_one_sequence() {
    let mut library = FeasibleSetLibrary::new(hybrid_controller(), LibraryConfig::default());
    let x0 = array![5.];
    assert_eq!(
        library.include_sample(&x0).unwrap(),
        SampleOutcome::NewSequence(SwitchingSequence::constant(1, 2))
    );
    let solution = library.feedforward(&x0, None, None).unwrap();
    let mode_one = SwitchingSequence::constant(1, 2);
    assert_eq!(solution.switching_sequence.as_ref(), Some(&mode_one));

    let direct = condense_ocp(&two_mode_system(), ObjectiveNorm::Two, &unit_weights(), &terminal_set(), &mode_one)
        .unwrap()
        .into_quadratic()
        .unwrap()
        .solve(&x0)
        .unwrap();
    assert!((solution.cost - direct.cost).abs() < 1e-6);
    assert!(solution.u[0].abs_diff_eq(&direct.u.slice(ndarray::s![..1]).to_owned(), 1e-6));
}

#[test]
fn test_big_m_is_large_enough_where_naive_bound_is_not() {
    let system = two_mode_system();
    let table = big_m_domains(&system, &Clarabel::default()).unwrap();
    // Row 0 of mode 0 is x <= -1, which mode 1 violates by up to 11.
    let m = table.get(0, 1)[0];
    assert!((m - 11.).abs() < 1e-6);

    let domain = &system.domains()[0];
    let z = array![10., 0.];
    let violation = domain.lhs().row(0).dot(&z) - domain.rhs()[0];
    assert!(violation <= m + 1e-6);
    // A naive M = 5 would cut off the admissible pair (10, 0) of mode 1.
    assert!(violation > 5.);
    assert!(system.domains()[1].contains(&z, 1e-9));
}

#[test]
fn test_miqp_matches_condensed_qp() {
    let mut controller = hybrid_controller();
    for x in [-7., -2., 3., 6.] {
        let x0 = array![x];
        let hybrid = controller.feedforward(&x0, &WarmStart::default()).unwrap();
        let sequence = hybrid.switching_sequence.clone().unwrap();
        let qp = controller.condense_program(&sequence).unwrap().solve(&x0).unwrap();
        assert!((hybrid.cost - qp.cost).abs() < 1e-5, "x0 = {x}");
    }
}

#[test]
fn test_library_round_trip_keeps_membership() {
    let mut library = FeasibleSetLibrary::new(
        hybrid_controller(),
        LibraryConfig {
            region_policy: RegionPolicy::SampledOnly,
            ..Default::default()
        },
    );
    for x in [2., 6., -4., -8.] {
        library.include_sample(&array![x]).unwrap();
    }
    let json = library.entries_to_json().unwrap();
    let mut loaded = FeasibleSetLibrary::new(hybrid_controller(), LibraryConfig::default());
    loaded.load_entries_json(&json).unwrap();
    for x in [-9., -6., -3., 0., 1.5, 4., 7.] {
        let x = array![x];
        assert_eq!(
            library.sampling_rejection(&x).unwrap(),
            loaded.sampling_rejection(&x).unwrap()
        );
        assert_eq!(
            library.get_feasible_switching_sequences(&x).unwrap(),
            loaded.get_feasible_switching_sequences(&x).unwrap()
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_explicit_law_matches_online_solve(x in -10.9f64..10.9) {
        let mut controller = scalar_controller();
        controller.compute_explicit_solution(ExplicitConfig::default()).unwrap();
        let x0: Array1<f64> = array![x];
        let (u_online, cost_online) = controller.feedforward(&x0).unwrap();
        let (u_explicit, cost_explicit) = controller.feedforward_explicit(&x0).unwrap();
        prop_assert!((cost_online - cost_explicit).abs() < 1e-4);
        prop_assert!((u_online[0][0] - u_explicit[0][0]).abs() < 1e-4);
    }
}
