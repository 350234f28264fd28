//! Discrete-time affine and piecewise-affine (PWA) dynamics.

use std::fmt;
use std::ops::Deref;

use log::debug;
use ndarray::{concatenate, s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::control_theory::block_diag;
use crate::error::{MpcError, Result};
use crate::optimization::Clarabel;
use crate::polytope::Polytope;

/// Tolerance used when locating a state-input pair in a mode domain.
const DOMAIN_TOL: f64 = 1e-9;

/// Discrete-time dynamics of the form $x' = f(x, u)$.
///
/// It is defined this way to allow downstream users to plug their own
/// (possibly nonlinear) plant into the simulation loop, while the
/// controllers in this crate work with affine and PWA models.
pub trait Dynamics {
    /// Calculate the next state, i.e., $x' = f(x, u)$.
    fn dynamics(&self, x: &Array1<f64>, u: &Array1<f64>) -> Result<Array1<f64>>;
    /// Get the dimension of the state $x$.
    fn n_state(&self) -> usize;
    /// Get the dimension of the input $u$.
    fn n_input(&self) -> usize;
}

/// Affine dynamics, i.e., $x' = A x + B u + c$.
///
/// Example
/// ```
/// use ndarray::array;
/// use hybrid_mpc::dynamics::{AffineSystem, Dynamics};
///
/// let dynamics = AffineSystem::new(array![[1., 1.], [0., 1.]], array![[0.], [1.]], array![0., -1.]).unwrap();
/// assert_eq!(dynamics.dynamics(&array![1., 2.], &array![3.]).unwrap(), array![3., 4.]);
/// assert_eq!(dynamics.n_input(), 1);
/// assert_eq!(dynamics.n_state(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineSystem {
    pub a: Array2<f64>,
    pub b: Array2<f64>,
    pub c: Array1<f64>,
}

impl AffineSystem {
    /// Create an affine system from $A$ (`a`), $B$ (`b`) and the offset $c$ (`c`).
    pub fn new(a: Array2<f64>, b: Array2<f64>, c: Array1<f64>) -> Result<Self> {
        let n_x = a.nrows();
        if a.ncols() != n_x {
            return Err(MpcError::dimension("A columns", n_x, a.ncols()));
        }
        if b.nrows() != n_x {
            return Err(MpcError::dimension("B rows", n_x, b.nrows()));
        }
        if c.len() != n_x {
            return Err(MpcError::dimension("c length", n_x, c.len()));
        }
        Ok(Self { a, b, c })
    }

    /// Linear dynamics $x' = A x + B u$.
    pub fn linear(a: Array2<f64>, b: Array2<f64>) -> Result<Self> {
        let c = Array1::zeros(a.nrows());
        Self::new(a, b, c)
    }
}

impl Dynamics for AffineSystem {
    fn dynamics(&self, x: &Array1<f64>, u: &Array1<f64>) -> Result<Array1<f64>> {
        if x.len() != self.n_state() {
            return Err(MpcError::dimension("state", self.n_state(), x.len()));
        }
        if u.len() != self.n_input() {
            return Err(MpcError::dimension("input", self.n_input(), u.len()));
        }
        Ok(self.a.dot(x) + self.b.dot(u) + &self.c)
    }

    fn n_state(&self) -> usize {
        self.a.ncols()
    }

    fn n_input(&self) -> usize {
        self.b.ncols()
    }
}

/// An ordered sequence of mode indices, one per stage of the horizon.
///
/// Compared and hashed by value, so it can key the feasible-set library.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwitchingSequence(Vec<usize>);

impl SwitchingSequence {
    pub fn new(modes: Vec<usize>) -> Self {
        Self(modes)
    }

    /// The sequence where every stage is in `mode`.
    pub fn constant(mode: usize, horizon: usize) -> Self {
        Self(vec![mode; horizon])
    }

    /// Drop the first `k` stages and pad the tail with `terminal_mode`.
    ///
    /// # Examples
    /// ```
    /// use hybrid_mpc::dynamics::SwitchingSequence;
    ///
    /// let ss = SwitchingSequence::from(vec![0, 1, 2]);
    /// assert_eq!(ss.shifted(1, 3), SwitchingSequence::from(vec![1, 2, 3]));
    /// ```
    pub fn shifted(&self, k: usize, terminal_mode: usize) -> Self {
        let k = k.min(self.0.len());
        let mut modes = self.0[k..].to_vec();
        modes.extend(std::iter::repeat(terminal_mode).take(k));
        Self(modes)
    }

    pub fn into_inner(self) -> Vec<usize> {
        self.0
    }

    /// Fail with [`MpcError::Dimension`] unless the sequence has `horizon` stages.
    pub fn check_horizon(&self, horizon: usize) -> Result<()> {
        if self.0.len() != horizon {
            return Err(MpcError::dimension("switching sequence length", horizon, self.0.len()));
        }
        Ok(())
    }
}

impl Deref for SwitchingSequence {
    type Target = [usize];

    fn deref(&self) -> &[usize] {
        &self.0
    }
}

impl From<Vec<usize>> for SwitchingSequence {
    fn from(modes: Vec<usize>) -> Self {
        Self(modes)
    }
}

impl fmt::Display for SwitchingSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, mode) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{mode}")?;
        }
        write!(f, ")")
    }
}

/// Lifted dynamics of a switching sequence: the stacked trajectory
/// $X = [x_0; \dots; x_N]$ is $X = \bar{A} x_0 + \bar{B} U + \bar{c}$.
#[derive(Debug, Clone, PartialEq)]
pub struct CondensedMatrices {
    /// $(N+1) n_x \times n_x$
    pub a_bar: Array2<f64>,
    /// $(N+1) n_x \times N n_u$
    pub b_bar: Array2<f64>,
    /// $(N+1) n_x$
    pub c_bar: Array1<f64>,
}

/// A piecewise-affine system: mode $i$ applies the dynamics
/// `affine_systems[i]` on `domains[i]` $\subset \mathbb{R}^{n_x + n_u}$.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PwaSystem {
    affine_systems: Vec<AffineSystem>,
    domains: Vec<Polytope>,
    n_x: usize,
    n_u: usize,
}

impl PwaSystem {
    pub fn new(affine_systems: Vec<AffineSystem>, domains: Vec<Polytope>) -> Result<Self> {
        let first = affine_systems
            .first()
            .ok_or_else(|| MpcError::dimension("number of modes", 1, 0))?;
        let (n_x, n_u) = (first.n_state(), first.n_input());
        if domains.len() != affine_systems.len() {
            return Err(MpcError::dimension(
                "number of domains",
                affine_systems.len(),
                domains.len(),
            ));
        }
        for (i, (system, domain)) in affine_systems.iter().zip(domains.iter()).enumerate() {
            if system.n_state() != n_x {
                return Err(MpcError::dimension(format!("states of mode {i}"), n_x, system.n_state()));
            }
            if system.n_input() != n_u {
                return Err(MpcError::dimension(format!("inputs of mode {i}"), n_u, system.n_input()));
            }
            if domain.dim() != n_x + n_u {
                return Err(MpcError::dimension(format!("domain of mode {i}"), n_x + n_u, domain.dim()));
            }
        }
        Ok(Self {
            affine_systems,
            domains,
            n_x,
            n_u,
        })
    }

    /// Build the system from state domains $X_i$ and input domains $U_i$,
    /// with mode domain $X_i \times U_i$.
    pub fn from_orthogonal_domains(
        affine_systems: Vec<AffineSystem>,
        state_domains: &[Polytope],
        input_domains: &[Polytope],
    ) -> Result<Self> {
        if state_domains.len() != affine_systems.len() {
            return Err(MpcError::dimension(
                "number of state domains",
                affine_systems.len(),
                state_domains.len(),
            ));
        }
        if input_domains.len() != affine_systems.len() {
            return Err(MpcError::dimension(
                "number of input domains",
                affine_systems.len(),
                input_domains.len(),
            ));
        }
        let domains = state_domains
            .iter()
            .zip(input_domains.iter())
            .map(|(x_dom, u_dom)| {
                Polytope::new(
                    block_diag(&[x_dom.lhs(), u_dom.lhs()]),
                    concatenate![Axis(0), *x_dom.rhs(), *u_dom.rhs()],
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(affine_systems, domains)
    }

    pub fn affine_systems(&self) -> &[AffineSystem] {
        &self.affine_systems
    }

    pub fn domains(&self) -> &[Polytope] {
        &self.domains
    }

    pub fn n_x(&self) -> usize {
        self.n_x
    }

    pub fn n_u(&self) -> usize {
        self.n_u
    }

    /// Number of modes.
    pub fn n_sys(&self) -> usize {
        self.affine_systems.len()
    }

    /// The first mode whose domain contains $(x, u)$.
    pub fn mode_of(&self, x: &Array1<f64>, u: &Array1<f64>) -> Option<usize> {
        let xu = concatenate![Axis(0), *x, *u];
        self.domains.iter().position(|d| d.contains(&xu, DOMAIN_TOL))
    }

    /// `true` if some mode admits an input $u$ with $(x, u)$ in its domain.
    pub fn is_inside_a_domain(&self, x: &Array1<f64>) -> Result<bool> {
        if x.len() != self.n_x {
            return Err(MpcError::dimension("state", self.n_x, x.len()));
        }
        let solver = Clarabel::default();
        for domain in &self.domains {
            let lhs_x = domain.lhs().slice(s![.., ..self.n_x]);
            let lhs_u = domain.lhs().slice(s![.., self.n_x..]).to_owned();
            let rhs = domain.rhs() - &lhs_x.dot(x);
            if solver
                .linear_program(&Array1::zeros(self.n_u), &lhs_u, &rhs)?
                .is_optimal()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Condense a switching sequence into its lifted dynamics.
    ///
    /// The length of the sequence is the horizon $N$; callers with a fixed
    /// horizon check it with [`SwitchingSequence::check_horizon`].
    ///
    /// With $\bar{A}_0 = I$, $\bar{B}_0 = 0$, $\bar{c}_0 = 0$ and $\sigma_k$
    /// the mode of stage $k$, the block rows follow the recursion
    /// $$ \bar{A}_{k+1} = A_{\sigma_k} \bar{A}_k, \quad
    ///    \bar{B}_{k+1} = A_{\sigma_k} \bar{B}_k + [0 \cdots B_{\sigma_k} \cdots 0], \quad
    ///    \bar{c}_{k+1} = A_{\sigma_k} \bar{c}_k + c_{\sigma_k}. $$
    pub fn condense(&self, switching_sequence: &SwitchingSequence) -> Result<CondensedMatrices> {
        let horizon = switching_sequence.len();
        if horizon == 0 {
            return Err(MpcError::dimension("switching sequence length", 1, 0));
        }
        if let Some(&mode) = switching_sequence.iter().find(|&&m| m >= self.n_sys()) {
            return Err(MpcError::dimension("mode index", self.n_sys(), mode));
        }
        let (n_x, n_u) = (self.n_x, self.n_u);
        let mut a_bar = Array2::zeros(((horizon + 1) * n_x, n_x));
        let mut b_bar = Array2::zeros(((horizon + 1) * n_x, horizon * n_u));
        let mut c_bar = Array1::zeros((horizon + 1) * n_x);
        a_bar.slice_mut(s![..n_x, ..]).assign(&Array2::<f64>::eye(n_x));

        for (k, &mode) in switching_sequence.iter().enumerate() {
            let system = &self.affine_systems[mode];
            let (prev, next) = (k * n_x..(k + 1) * n_x, (k + 1) * n_x..(k + 2) * n_x);

            let a_next = system.a.dot(&a_bar.slice(s![prev.clone(), ..]));
            a_bar.slice_mut(s![next.clone(), ..]).assign(&a_next);

            let mut b_next = system.a.dot(&b_bar.slice(s![prev.clone(), ..]));
            b_next
                .slice_mut(s![.., k * n_u..(k + 1) * n_u])
                .assign(&system.b);
            b_bar.slice_mut(s![next.clone(), ..]).assign(&b_next);

            let c_next = system.a.dot(&c_bar.slice(s![prev])) + &system.c;
            c_bar.slice_mut(s![next]).assign(&c_next);
        }
        debug!("Condensed dynamics of switching sequence {switching_sequence}");
        Ok(CondensedMatrices { a_bar, b_bar, c_bar })
    }
}

impl Dynamics for PwaSystem {
    /// Apply the dynamics of the mode whose domain contains $(x, u)$.
    fn dynamics(&self, x: &Array1<f64>, u: &Array1<f64>) -> Result<Array1<f64>> {
        let mode = self.mode_of(x, u).ok_or_else(|| {
            MpcError::InvariantViolation(format!(
                "state {x} and input {u} are outside every domain of the PWA system"
            ))
        })?;
        self.affine_systems[mode].dynamics(x, u)
    }

    fn n_state(&self) -> usize {
        self.n_x
    }

    fn n_input(&self) -> usize {
        self.n_u
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ndarray::array;
    use proptest::prelude::*;

    use super::*;

    /// Two scalar modes $x' = x + u$ on $x \in [-10, -1]$ and $x \in [1, 10]$, $|u| \le 1$.
    pub(crate) fn two_mode_system() -> PwaSystem {
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

    #[test]
    fn test_affine_dynamics() {
        let system = AffineSystem::new(array![[0., 1.], [0., 0.]], array![[0.], [1.]], array![1., 0.]).unwrap();
        assert_eq!(system.n_input(), 1);
        assert_eq!(system.n_state(), 2);
        assert_eq!(
            system.dynamics(&array![1., 1.], &array![2.]).unwrap(),
            array![2., 2.]
        );
        assert!(system.dynamics(&array![1.], &array![2.]).is_err());
    }

    #[test]
    fn test_affine_system_checks_dimensions() {
        assert!(AffineSystem::new(array![[1., 0.]], array![[1.]], array![0.]).is_err());
        assert!(AffineSystem::new(array![[1.]], array![[1.], [1.]], array![0.]).is_err());
    }

    #[test]
    fn test_switching_sequence() {
        let ss = SwitchingSequence::from(vec![0, 1, 1]);
        assert_eq!(ss.len(), 3);
        assert_eq!(ss.to_string(), "(0, 1, 1)");
        assert_eq!(ss.shifted(2, 0), SwitchingSequence::from(vec![1, 0, 0]));
        assert_ne!(ss, SwitchingSequence::from(vec![1, 1, 0]));
        assert_eq!(serde_json::to_string(&ss).unwrap(), "[0,1,1]");
    }

    #[test]
    fn test_condense_scalar() {
        let system = AffineSystem::new(array![[2.]], array![[1.]], array![1.]).unwrap();
        let pwa = PwaSystem::new(
            vec![system],
            vec![Polytope::from_bounds(&array![-1., -1.], &array![1., 1.]).unwrap()],
        )
        .unwrap();
        let condensed = pwa.condense(&SwitchingSequence::constant(0, 2)).unwrap();
        assert_eq!(condensed.a_bar, array![[1.], [2.], [4.]]);
        assert_eq!(condensed.b_bar, array![[0., 0.], [1., 0.], [2., 1.]]);
        assert_eq!(condensed.c_bar, array![0., 1., 3.]);
    }

    #[test]
    fn test_condense_matches_simulation() {
        let a0 = AffineSystem::new(array![[1., 1.], [0., 1.]], array![[0.], [1.]], array![0., 0.1]).unwrap();
        let a1 = AffineSystem::new(array![[0.5, 0.], [1., 1.]], array![[1.], [0.]], array![-1., 0.]).unwrap();
        let dom = Polytope::from_bounds(&array![-5., -5., -1.], &array![5., 5., 1.]).unwrap();
        let pwa = PwaSystem::new(vec![a0, a1], vec![dom.clone(), dom]).unwrap();
        let ss = SwitchingSequence::from(vec![0, 1, 1, 0]);
        let condensed = pwa.condense(&ss).unwrap();

        let x0 = array![0.3, -0.2];
        let inputs = array![0.5, -1., 0.2, 0.7];
        let stacked = condensed.a_bar.dot(&x0) + condensed.b_bar.dot(&inputs) + &condensed.c_bar;
        let mut x = x0.clone();
        for (k, &mode) in ss.iter().enumerate() {
            assert!(stacked.slice(s![2 * k..2 * k + 2]).abs_diff_eq(&x, 1e-12));
            x = pwa.affine_systems()[mode]
                .dynamics(&x, &inputs.slice(s![k..k + 1]).to_owned())
                .unwrap();
        }
        assert!(stacked.slice(s![8..10]).abs_diff_eq(&x, 1e-12));
    }

    #[test]
    fn test_condense_rejects_bad_sequences() {
        let pwa = two_mode_system();
        assert!(matches!(
            pwa.condense(&SwitchingSequence::from(vec![0, 2])),
            Err(MpcError::Dimension { .. })
        ));
        assert!(matches!(
            pwa.condense(&SwitchingSequence::from(vec![])),
            Err(MpcError::Dimension { .. })
        ));
    }

    #[test]
    fn test_switching_sequence_horizon() {
        let ss = SwitchingSequence::from(vec![0, 1, 1]);
        assert!(ss.check_horizon(3).is_ok());
        assert!(matches!(
            ss.check_horizon(2),
            Err(MpcError::Dimension { expected: 2, got: 3, .. })
        ));
    }

    #[test]
    fn test_mode_of() {
        let pwa = two_mode_system();
        assert_eq!(pwa.mode_of(&array![5.], &array![0.]), Some(1));
        assert_eq!(pwa.mode_of(&array![-5.], &array![1.]), Some(0));
        assert_eq!(pwa.mode_of(&array![0.], &array![0.]), None);
        assert_eq!(pwa.mode_of(&array![5.], &array![2.]), None);
        assert_eq!(pwa.dynamics(&array![5.], &array![-1.]).unwrap(), array![4.]);
        assert!(pwa.dynamics(&array![0.], &array![0.]).is_err());
    }

    #[test]
    fn test_is_inside_a_domain() {
        let pwa = two_mode_system();
        assert!(pwa.is_inside_a_domain(&array![3.]).unwrap());
        assert!(!pwa.is_inside_a_domain(&array![0.5]).unwrap());
        assert!(!pwa.is_inside_a_domain(&array![11.]).unwrap());
    }

    #[test]
    fn test_new_rejects_mismatched_domains() {
        let system = AffineSystem::linear(array![[1.]], array![[1.]]).unwrap();
        let bad = Polytope::from_bounds(&array![-1.], &array![1.]).unwrap();
        assert!(PwaSystem::new(vec![system.clone()], vec![bad]).is_err());
        assert!(PwaSystem::new(vec![system], vec![]).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn condensed_dimensions(modes in prop::collection::vec(0usize..2, 1..6)) {
            let a0 = AffineSystem::new(array![[1., 1.], [0., 1.]], array![[0.], [1.]], array![0., 0.]).unwrap();
            let a1 = AffineSystem::new(array![[1., 0.], [0., 0.5]], array![[1.], [1.]], array![1., 0.]).unwrap();
            let dom = Polytope::from_bounds(&array![-5., -5., -1.], &array![5., 5., 1.]).unwrap();
            let pwa = PwaSystem::new(vec![a0, a1], vec![dom.clone(), dom]).unwrap();
            let horizon = modes.len();
            let condensed = pwa.condense(&SwitchingSequence::from(modes)).unwrap();
            prop_assert_eq!(condensed.a_bar.dim(), ((horizon + 1) * 2, 2));
            prop_assert_eq!(condensed.b_bar.dim(), ((horizon + 1) * 2, horizon));
            prop_assert_eq!(condensed.c_bar.len(), (horizon + 1) * 2);
        }
    }
}
