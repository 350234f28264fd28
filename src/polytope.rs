//! Polyhedra in half-space representation $\{x : A x \le b\}$.
//!
//! Only the operations the condensers and controllers need are provided:
//! redundancy removal, emptiness, Chebyshev centers, point containment and
//! Fourier–Motzkin projection. [`InnerApproximation`] is the vertex-based
//! inner approximation grown by the feasible-set library.

use log::debug;
use ndarray::{concatenate, s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{MpcError, Result};
use crate::optimization::{Clarabel, ConvexProgram, SolveStatus};

/// Rows whose normal is smaller than this are treated as zero rows.
const ZERO_ROW_TOL: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polytope {
    lhs: Array2<f64>,
    rhs: Array1<f64>,
}

impl Polytope {
    /// Create the polytope $\{x : \text{lhs}\, x \le \text{rhs}\}$.
    pub fn new(lhs: Array2<f64>, rhs: Array1<f64>) -> Result<Self> {
        if lhs.nrows() != rhs.len() {
            return Err(MpcError::dimension(
                "polytope right-hand side",
                lhs.nrows(),
                rhs.len(),
            ));
        }
        Ok(Self { lhs, rhs })
    }

    /// The box $\{x : x_\text{min} \le x \le x_\text{max}\}$.
    ///
    /// # Examples
    /// ```
    /// use ndarray::array;
    /// use hybrid_mpc::polytope::Polytope;
    ///
    /// let p = Polytope::from_bounds(&array![-1., -2.], &array![1., 2.]).unwrap();
    /// assert!(p.contains(&array![0.5, -1.5], 0.));
    /// assert!(!p.contains(&array![1.5, 0.], 0.));
    /// ```
    pub fn from_bounds(x_min: &Array1<f64>, x_max: &Array1<f64>) -> Result<Self> {
        if x_min.len() != x_max.len() {
            return Err(MpcError::dimension("box bounds", x_min.len(), x_max.len()));
        }
        let mut p = Self::new(Array2::zeros((0, x_min.len())), Array1::zeros(0))?;
        p.add_bounds(x_min, x_max)?;
        Ok(p)
    }

    /// Append the rows $A x \le b$.
    pub fn add_facets(&mut self, lhs: &Array2<f64>, rhs: &Array1<f64>) -> Result<()> {
        if lhs.ncols() != self.dim() {
            return Err(MpcError::dimension("facet columns", self.dim(), lhs.ncols()));
        }
        if lhs.nrows() != rhs.len() {
            return Err(MpcError::dimension("facet right-hand side", lhs.nrows(), rhs.len()));
        }
        self.lhs = concatenate![Axis(0), self.lhs, *lhs];
        self.rhs = concatenate![Axis(0), self.rhs, *rhs];
        Ok(())
    }

    /// Append the rows $x \le x_\text{max}$ and $-x \le -x_\text{min}$.
    pub fn add_bounds(&mut self, x_min: &Array1<f64>, x_max: &Array1<f64>) -> Result<()> {
        let n = self.dim();
        if x_min.len() != n || x_max.len() != n {
            return Err(MpcError::dimension("bounds", n, x_min.len().min(x_max.len())));
        }
        let eye = Array2::<f64>::eye(n);
        self.add_facets(&concatenate![Axis(0), eye, -&eye], &concatenate![Axis(0), *x_max, -x_min])
    }

    pub fn lhs(&self) -> &Array2<f64> {
        &self.lhs
    }

    pub fn rhs(&self) -> &Array1<f64> {
        &self.rhs
    }

    /// Dimension of the ambient space.
    pub fn dim(&self) -> usize {
        self.lhs.ncols()
    }

    pub fn n_facets(&self) -> usize {
        self.lhs.nrows()
    }

    /// Check $A x \le b + \text{tol}$ row by row.
    pub fn contains(&self, x: &Array1<f64>, tol: f64) -> bool {
        x.len() == self.dim()
            && self
                .lhs
                .dot(x)
                .iter()
                .zip(self.rhs.iter())
                .all(|(ax, b)| *ax <= b + tol)
    }

    /// `true` if no point satisfies all the inequalities.
    pub fn is_empty(&self) -> Result<bool> {
        let solver = Clarabel::default();
        let sol = solver.linear_program(&Array1::zeros(self.dim()), &self.lhs, &self.rhs)?;
        match sol.status {
            SolveStatus::Optimal => Ok(false),
            SolveStatus::Infeasible => Ok(true),
            status => Err(MpcError::Solver(format!(
                "emptiness check of a polytope returned {status:?}"
            ))),
        }
    }

    /// Center and radius of the largest ball inscribed in the polytope.
    ///
    /// The radius is capped at `max_radius` so that unbounded polytopes still
    /// have a center. Returns `None` if the polytope is empty.
    pub fn chebyshev_center(&self, max_radius: f64) -> Result<Option<(Array1<f64>, f64)>> {
        self.chebyshev_lp(None, max_radius)
    }

    /// Chebyshev center of the facet `index`, i.e. of the polytope
    /// intersected with the hyperplane $a_i^\text{T} x = b_i$.
    pub fn facet_center(&self, index: usize, max_radius: f64) -> Result<Option<(Array1<f64>, f64)>> {
        if index >= self.n_facets() {
            return Err(MpcError::dimension("facet index", self.n_facets(), index));
        }
        self.chebyshev_lp(Some(index), max_radius)
    }

    // max r s.t. a_i x + ||a_i|| r <= b_i (i != eq), a_eq x = b_eq, r <= r_max
    fn chebyshev_lp(&self, equality: Option<usize>, max_radius: f64) -> Result<Option<(Array1<f64>, f64)>> {
        let n = self.dim();
        let rows: Vec<usize> = (0..self.n_facets()).filter(|&i| Some(i) != equality).collect();
        let mut a_ineq = Array2::zeros((rows.len() + 1, n + 1));
        let mut b_ineq = Array1::zeros(rows.len() + 1);
        for (k, &i) in rows.iter().enumerate() {
            let row = self.lhs.row(i);
            a_ineq.slice_mut(s![k, ..n]).assign(&row);
            a_ineq[(k, n)] = row.dot(&row).sqrt();
            b_ineq[k] = self.rhs[i];
        }
        a_ineq[(rows.len(), n)] = 1.;
        b_ineq[rows.len()] = max_radius;

        let mut cost = Array1::zeros(n + 1);
        cost[n] = -1.;
        let (a_eq, b_eq) = match equality {
            Some(i) => {
                let mut a_eq = Array2::zeros((1, n + 1));
                a_eq.slice_mut(s![0, ..n]).assign(&self.lhs.row(i));
                (Some(a_eq), Some(Array1::from_elem(1, self.rhs[i])))
            }
            None => (None, None),
        };
        let sol = Clarabel::default().solve(&ConvexProgram {
            hessian: None,
            cost: &cost,
            a_ineq: &a_ineq,
            b_ineq: &b_ineq,
            a_eq: a_eq.as_ref(),
            b_eq: b_eq.as_ref(),
        })?;
        if !sol.is_optimal() {
            return Ok(None);
        }
        let radius = sol.argmin[n];
        if radius < 0. {
            return Ok(None);
        }
        Ok(Some((sol.argmin.slice(s![..n]).to_owned(), radius)))
    }

    /// A minimal half-space representation of the polytope.
    ///
    /// Rows are normalized, zero rows with a non-negative right-hand side
    /// and duplicated rows are dropped, then each remaining row is tested
    /// for redundancy with one LP against the rows kept so far. An empty
    /// polytope is returned normalized but otherwise unreduced.
    pub fn minimal(&self, tol: f64) -> Result<Polytope> {
        let n = self.dim();
        let mut normalized: Vec<(Array1<f64>, f64)> = Vec::with_capacity(self.n_facets());
        for (row, &b) in self.lhs.rows().into_iter().zip(self.rhs.iter()) {
            let norm = row.dot(&row).sqrt();
            if norm < ZERO_ROW_TOL {
                if b < -tol {
                    // 0 <= b fails everywhere.
                    return Ok(self.clone());
                }
                continue;
            }
            let a = row.mapv(|v| v / norm);
            let b = b / norm;
            let duplicate = normalized.iter().any(|(a_k, b_k)| {
                (b_k - b).abs() <= tol && a_k.iter().zip(a.iter()).all(|(x, y)| (x - y).abs() <= tol)
            });
            if !duplicate {
                normalized.push((a, b));
            }
        }
        let candidate = stack_rows(&normalized, n);
        if candidate.is_empty()? {
            return Ok(candidate);
        }

        let solver = Clarabel::default();
        let mut kept: Vec<bool> = vec![true; normalized.len()];
        for i in 0..normalized.len() {
            let others: Vec<(Array1<f64>, f64)> = normalized
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i && kept[*j])
                .map(|(_, r)| r.clone())
                .collect();
            let (a_i, b_i) = &normalized[i];
            let mut rows = others;
            // Keep the LP bounded along a_i.
            rows.push((a_i.clone(), b_i + 1.));
            let p = stack_rows(&rows, n);
            let sol = solver.linear_program(&-a_i, &p.lhs, &p.rhs)?;
            if sol.is_optimal() && -sol.min <= b_i + tol {
                kept[i] = false;
            }
        }
        let minimal: Vec<(Array1<f64>, f64)> = normalized
            .into_iter()
            .zip(kept)
            .filter_map(|(r, keep)| keep.then_some(r))
            .collect();
        debug!(
            "Minimal representation kept {} of {} facets",
            minimal.len(),
            self.n_facets()
        );
        Ok(stack_rows(&minimal, n))
    }

    /// Orthogonal projection onto the coordinates `dims` (in that order).
    ///
    /// The remaining coordinates are eliminated by Fourier–Motzkin, reducing
    /// to a minimal representation after every elimination. Returns `None`
    /// if the polytope is empty.
    pub fn orthogonal_projection(&self, dims: &[usize]) -> Result<Option<Polytope>> {
        if let Some(&d) = dims.iter().find(|&&d| d >= self.dim()) {
            return Err(MpcError::dimension("projection coordinate", self.dim(), d));
        }
        let tol = 1e-9;
        let mut current = self.minimal(tol)?;
        if current.is_empty()? {
            return Ok(None);
        }
        // Columns still present in `current`, mapping to original coordinates.
        let mut columns: Vec<usize> = (0..self.dim()).collect();
        let mut eliminate: Vec<usize> = (0..self.dim()).filter(|c| !dims.contains(c)).collect();
        eliminate.reverse();
        for coordinate in eliminate {
            let Some(col) = columns.iter().position(|&c| c == coordinate) else {
                continue;
            };
            current = current.fourier_motzkin(col).minimal(tol)?;
            columns.remove(col);
        }
        let order: Vec<usize> = dims
            .iter()
            .filter_map(|d| columns.iter().position(|c| c == d))
            .collect();
        let lhs = current.lhs.select(Axis(1), &order);
        Ok(Some(Polytope::new(lhs, current.rhs)?))
    }

    fn fourier_motzkin(&self, col: usize) -> Polytope {
        let n = self.dim();
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        let mut rows: Vec<(Array1<f64>, f64)> = Vec::new();
        for i in 0..self.n_facets() {
            let a_ij = self.lhs[(i, col)];
            if a_ij > ZERO_ROW_TOL {
                positive.push(i);
            } else if a_ij < -ZERO_ROW_TOL {
                negative.push(i);
            } else {
                rows.push((self.lhs.row(i).to_owned(), self.rhs[i]));
            }
        }
        for &p in &positive {
            let a_p = self.lhs[(p, col)];
            for &q in &negative {
                let a_q = -self.lhs[(q, col)];
                let row = &self.lhs.row(p) / a_p + &self.lhs.row(q) / a_q;
                rows.push((row, self.rhs[p] / a_p + self.rhs[q] / a_q));
            }
        }
        let stacked = stack_rows(&rows, n);
        let keep: Vec<usize> = (0..n).filter(|&j| j != col).collect();
        Polytope {
            lhs: stacked.lhs.select(Axis(1), &keep),
            rhs: stacked.rhs,
        }
    }
}

fn stack_rows(rows: &[(Array1<f64>, f64)], n: usize) -> Polytope {
    let mut lhs = Array2::zeros((rows.len(), n));
    let mut rhs = Array1::zeros(rows.len());
    for (i, (a, b)) in rows.iter().enumerate() {
        lhs.row_mut(i).assign(a);
        rhs[i] = *b;
    }
    Polytope { lhs, rhs }
}

/// Inner approximation of a convex set as the convex hull of points known to
/// belong to it.
///
/// Points are only ever added, so the approximation only grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerApproximation {
    vertices: Vec<Array1<f64>>,
    tol: f64,
}

impl InnerApproximation {
    /// An approximation with no vertices, whose containment tolerance is `tol`.
    pub fn new(tol: f64) -> Self {
        Self {
            vertices: Vec::new(),
            tol,
        }
    }

    pub fn vertices(&self) -> &[Array1<f64>] {
        &self.vertices
    }

    pub fn dim(&self) -> Option<usize> {
        self.vertices.first().map(|v| v.len())
    }

    /// Grow the approximation so that it contains `x`.
    ///
    /// Returns `true` if `x` was outside and has been added as a vertex.
    pub fn include_point(&mut self, x: &Array1<f64>) -> Result<bool> {
        if let Some(n) = self.dim() {
            if x.len() != n {
                return Err(MpcError::dimension("included point", n, x.len()));
            }
        }
        if self.applies_to(x)? {
            return Ok(false);
        }
        self.vertices.push(x.clone());
        Ok(true)
    }

    /// `true` if `x` lies in the convex hull of the vertices.
    ///
    /// Solved as the LP $\min \|V\lambda - x\|_1$ s.t. $\lambda \ge 0$,
    /// $\mathbf{1}^\text{T}\lambda = 1$, accepting distances up to the tolerance.
    pub fn applies_to(&self, x: &Array1<f64>) -> Result<bool> {
        let Some(n) = self.dim() else {
            return Ok(false);
        };
        if x.len() != n {
            return Ok(false);
        }
        let m = self.vertices.len();
        let mut v_mat = Array2::zeros((n, m));
        for (j, v) in self.vertices.iter().enumerate() {
            v_mat.column_mut(j).assign(v);
        }
        // Variables [lambda (m); e (n)].
        let eye_n = Array2::<f64>::eye(n);
        let a_ineq = concatenate![
            Axis(0),
            concatenate![Axis(1), v_mat, -&eye_n],
            concatenate![Axis(1), -&v_mat, -&eye_n],
            concatenate![Axis(1), -Array2::<f64>::eye(m), Array2::<f64>::zeros((m, n))]
        ];
        let b_ineq = concatenate![Axis(0), *x, -x, Array1::<f64>::zeros(m)];
        let cost = concatenate![Axis(0), Array1::<f64>::zeros(m), Array1::<f64>::ones(n)];
        let a_eq = concatenate![Axis(1), Array2::<f64>::ones((1, m)), Array2::<f64>::zeros((1, n))];
        let b_eq = Array1::ones(1);
        let sol = Clarabel::default().solve(&ConvexProgram {
            hessian: None,
            cost: &cost,
            a_ineq: &a_ineq,
            b_ineq: &b_ineq,
            a_eq: Some(&a_eq),
            b_eq: Some(&b_eq),
        })?;
        Ok(sol.is_optimal() && sol.min <= self.tol)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use proptest::prelude::*;

    use super::*;

    fn unit_box(n: usize) -> Polytope {
        Polytope::from_bounds(&Array1::from_elem(n, -1.), &Array1::ones(n)).unwrap()
    }

    #[test]
    fn test_new_checks_dimensions() {
        assert!(Polytope::new(Array2::zeros((2, 1)), Array1::zeros(3)).is_err());
    }

    #[test]
    fn test_contains() {
        let p = unit_box(2);
        assert!(p.contains(&array![1., -1.], 0.));
        assert!(!p.contains(&array![1. + 1e-6, 0.], 1e-8));
        assert!(!p.contains(&array![0.], 0.));
    }

    #[test]
    fn test_is_empty() {
        assert!(!unit_box(2).is_empty().unwrap());
        let empty = Polytope::new(array![[1.], [-1.]], array![-1., -1.]).unwrap();
        assert!(empty.is_empty().unwrap());
    }

    #[test]
    fn test_minimal_removes_redundant_rows() {
        let mut p = unit_box(2);
        p.add_facets(&array![[1., 1.], [2., 0.], [0., 0.]], &array![5., 2., 1.])
            .unwrap();
        let minimal = p.minimal(1e-9).unwrap();
        assert_eq!(minimal.n_facets(), 4);
        assert!(minimal.contains(&array![1., 1.], 1e-9));
        assert!(!minimal.contains(&array![1.1, 0.], 1e-9));
    }

    #[test]
    fn test_minimal_keeps_tight_cut() {
        let mut p = unit_box(2);
        p.add_facets(&array![[1., 1.]], &array![1.]).unwrap();
        let minimal = p.minimal(1e-9).unwrap();
        assert_eq!(minimal.n_facets(), 5);
        assert!(!minimal.contains(&array![1., 1.], 1e-9));
    }

    #[test]
    fn test_chebyshev_center() {
        let p = Polytope::from_bounds(&array![0., 0.], &array![4., 2.]).unwrap();
        let (center, radius) = p.chebyshev_center(1e3).unwrap().unwrap();
        assert!((radius - 1.).abs() < 1e-6);
        assert!((center[1] - 1.).abs() < 1e-6);
        assert!(center[0] > 1. - 1e-6 && center[0] < 3. + 1e-6);
    }

    #[test]
    fn test_chebyshev_center_unbounded_is_capped() {
        let p = Polytope::new(array![[-1.]], array![0.]).unwrap();
        let (center, radius) = p.chebyshev_center(10.).unwrap().unwrap();
        assert!((radius - 10.).abs() < 1e-6);
        assert!(center[0] >= 10. - 1e-6);
    }

    #[test]
    fn test_chebyshev_center_empty() {
        let empty = Polytope::new(array![[1.], [-1.]], array![-1., -1.]).unwrap();
        assert!(empty.chebyshev_center(1e3).unwrap().is_none());
    }

    #[test]
    fn test_facet_center() {
        let p = unit_box(2);
        // Facet x_0 <= 1.
        let (center, radius) = p.facet_center(0, 1e3).unwrap().unwrap();
        assert!((center[0] - 1.).abs() < 1e-6);
        assert!(center[1].abs() < 1e-6);
        assert!(radius > 0.);
    }

    #[test]
    fn test_orthogonal_projection_of_triangle() {
        // 0 <= y <= x <= 1 projected on x is [0, 1], on y is [0, 1].
        let p = Polytope::new(
            array![[-1., 1.], [1., 0.], [0., -1.]],
            array![0., 1., 0.],
        )
        .unwrap();
        let on_x = p.orthogonal_projection(&[0]).unwrap().unwrap();
        assert!(on_x.contains(&array![0.], 1e-8));
        assert!(on_x.contains(&array![1.], 1e-8));
        assert!(!on_x.contains(&array![1.01], 1e-8));
        assert!(!on_x.contains(&array![-0.01], 1e-8));
        assert_eq!(on_x.n_facets(), 2);
    }

    #[test]
    fn test_orthogonal_projection_of_lifted_set() {
        // |u| <= 1, |x + u| <= 2 projected on x is [-3, 3].
        let p = Polytope::new(
            array![[1., 0.], [-1., 0.], [1., 1.], [-1., -1.]],
            array![1., 1., 2., 2.],
        )
        .unwrap();
        let on_x = p.orthogonal_projection(&[1]).unwrap().unwrap();
        assert!(on_x.contains(&array![3.], 1e-8));
        assert!(on_x.contains(&array![-3.], 1e-8));
        assert!(!on_x.contains(&array![3.1], 1e-8));
    }

    #[test]
    fn test_orthogonal_projection_of_empty_set() {
        let empty = Polytope::new(array![[1., 0.], [-1., 0.]], array![-1., -1.]).unwrap();
        assert!(empty.orthogonal_projection(&[1]).unwrap().is_none());
    }

    #[test]
    fn test_inner_approximation() {
        let mut approx = InnerApproximation::new(1e-7);
        assert!(!approx.applies_to(&array![0., 0.]).unwrap());
        assert!(approx.include_point(&array![0., 0.]).unwrap());
        assert!(approx.include_point(&array![2., 0.]).unwrap());
        assert!(approx.include_point(&array![0., 2.]).unwrap());
        assert!(approx.applies_to(&array![0.5, 0.5]).unwrap());
        assert!(!approx.applies_to(&array![1.5, 1.5]).unwrap());
        // Already inside, nothing changes.
        assert!(!approx.include_point(&array![1., 1.]).unwrap());
        assert_eq!(approx.vertices().len(), 3);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn inner_approximation_is_monotone(
            points in prop::collection::vec((-5.0f64..5.0, -5.0f64..5.0), 1..6),
            query in (-5.0f64..5.0, -5.0f64..5.0),
        ) {
            let query = array![query.0, query.1];
            let mut approx = InnerApproximation::new(1e-7);
            let mut was_inside = false;
            for (a, b) in points {
                approx.include_point(&array![a, b]).unwrap();
                let inside = approx.applies_to(&query).unwrap();
                prop_assert!(inside || !was_inside);
                was_inside = inside;
            }
        }
    }
}
