//! This module contains common control-theoretic functions and the matrix
//! helpers the condensers and controllers share.

use ndarray::{s, Array, Array2, Dimension, LinalgScalar};
use ndarray_linalg::{error::LinalgError, Inverse, Lapack, Scalar, SVD};

/// Determine the rank of a matrix (using the SVD).
///
/// Uses a similar method to the numpy implementation: see [numpy][numpy-rank]
///
/// # Examples
/// ```
/// use ndarray::array;
/// use hybrid_mpc::control_theory::rank;
///
/// let mat = array![[1., 2., 1.], [0., 1., 0.], [2., 5., 2.]];
///
/// assert_eq!(rank(&mat, Default::default()).expect("Error in rank"), 2);
/// ```
///
/// [numpy-rank]: https://numpy.org/doc/stable/reference/generated/numpy.linalg.matrix_rank.html
pub fn rank<T: Lapack>(mat: &Array2<T>, eps: Option<f64>) -> Result<usize, LinalgError> {
    if mat.is_empty() {
        return Ok(0);
    }
    let (_, singular_values, _) = mat.svd(false, false)?;
    let sv_max = singular_values
        .iter()
        .map(|&v| v.abs().re())
        .fold(T::real(0.), |acc, v| if v > acc { v } else { acc });
    let max_dim = mat.nrows().max(mat.ncols());
    let eps = eps.unwrap_or(f64::EPSILON);
    let tol = sv_max * T::real(max_dim) * T::real(eps);
    Ok(singular_values
        .iter()
        .map(|&v| if v.abs().re() <= tol { 0_usize } else { 1 })
        .sum())
}

/// Assemble a block-diagonal matrix from the given blocks.
///
/// Blocks may be rectangular or have zero rows/columns, in which case they
/// only shift the following blocks.
///
/// # Examples
/// ```
/// use ndarray::array;
/// use hybrid_mpc::control_theory::block_diag;
///
/// let mat = block_diag(&[&array![[1.]], &array![[2., 3.]]]);
/// assert_eq!(mat, array![[1., 0., 0.], [0., 2., 3.]]);
/// ```
pub fn block_diag<T: LinalgScalar>(blocks: &[&Array2<T>]) -> Array2<T> {
    let n_rows = blocks.iter().map(|b| b.nrows()).sum();
    let n_cols = blocks.iter().map(|b| b.ncols()).sum();
    let mut mat = Array2::zeros((n_rows, n_cols));
    let (mut row, mut col) = (0, 0);
    for block in blocks {
        mat.slice_mut(s![row..row + block.nrows(), col..col + block.ncols()])
            .assign(block);
        row += block.nrows();
        col += block.ncols();
    }
    mat
}

/// Set to zero every entry whose magnitude is below `tol`.
pub fn clean_matrix<D: Dimension>(mat: &Array<f64, D>, tol: f64) -> Array<f64, D> {
    mat.mapv(|v| if v.abs() < tol { 0. } else { v })
}

/// Indices of a maximal set of linearly independent rows of `mat`.
///
/// Rows are scanned in order and orthogonalized against the ones already
/// kept (a Gram-Schmidt QR of $A^\text{T}$); a row is kept if the diagonal
/// entry of $R$ it produces is larger than `tol` in magnitude.
///
/// # Examples
/// ```
/// use ndarray::array;
/// use hybrid_mpc::control_theory::linearly_independent_rows;
///
/// let mat = array![[1., 0.], [2., 0.], [0., 1.]];
/// assert_eq!(linearly_independent_rows(&mat, 1e-6), vec![0, 2]);
/// ```
pub fn linearly_independent_rows(mat: &Array2<f64>, tol: f64) -> Vec<usize> {
    let mut basis: Vec<ndarray::Array1<f64>> = Vec::new();
    let mut independent = Vec::new();
    for (i, row) in mat.rows().into_iter().enumerate() {
        let mut residual = row.to_owned();
        // Two passes keep the basis orthogonal to working precision.
        for _ in 0..2 {
            for q in &basis {
                let projection = q.dot(&residual);
                residual.scaled_add(-projection, q);
            }
        }
        let r_ii = residual.dot(&residual).sqrt();
        if r_ii > tol {
            basis.push(residual / r_ii);
            independent.push(i);
        }
    }
    independent
}

/// Solve the Discrete Algebraic Riccati Equation (DARE) iteratively.
///
/// With $Q\succcurlyeq 0$ and $R\succ 0$ the DARE is
/// $P = Q + A^\text{T}PA - A^\text{T}PB(R + B^\text{T}PB)^{-1}B^\text{T}PA$.
/// The iterative method runs the Riccati recursion backwards in time from
/// $P_0 = Q$ until two consecutive iterates differ (in Frobenius norm) by
/// less than `tol`, or `iter_max` iterations have been performed.
///
/// The solution is the natural terminal weight of a stabilizing MPC
/// controller (the infinite-horizon unconstrained cost-to-go).
///
/// # Examples
/// ```
/// use ndarray::array;
/// use hybrid_mpc::control_theory::dare_iterative;
///
/// let p_mat = dare_iterative(
///     &array![[1.]],
///     &array![[1.]],
///     &array![[1.]],
///     &array![[1.]],
///     Default::default(), // default `tol` is 1E-12
///     Default::default(), // default `iter_max` is 10000
/// )
/// .unwrap();
/// // The golden ratio solves p^2 - p - 1 = 0.
/// assert!((p_mat[(0, 0)] - 1.618033988749895).abs() < 1e-9);
/// ```
pub fn dare_iterative(
    a_mat: &Array2<f64>,
    b_mat: &Array2<f64>,
    q_mat: &Array2<f64>,
    r_mat: &Array2<f64>,
    tol: Option<f64>,
    iter_max: Option<usize>,
) -> Result<Array2<f64>, LinalgError> {
    let tol = tol.unwrap_or(1.0e-12);
    let iter_max = iter_max.unwrap_or(10000);

    let a_transpose = a_mat.t();
    let b_transpose = b_mat.t();
    let mut p_mat = q_mat.clone();

    for _i in 0..iter_max {
        let pa = p_mat.dot(a_mat);
        let pb = p_mat.dot(b_mat);
        let gain_inverse = (r_mat + &b_transpose.dot(&pb)).inv()?;
        let p_next = q_mat + &a_transpose.dot(&pa)
            - a_transpose.dot(&pb).dot(&gain_inverse).dot(&b_transpose.dot(&pa));
        let diff = (&p_next - &p_mat).iter().map(|v| v * v).sum::<f64>().sqrt();
        p_mat = p_next;
        if diff < tol {
            break;
        }
    }
    Ok(p_mat)
}

/// Determine the discrete LQR feedback matrix $K$ from $P$, the DARE solution.
///
/// Simply $K=(R + B^\text{T}PB)^{-1}B^\text{T}PA$, for the control law $u = -Kx$.
pub fn lqr_gain(
    a_mat: &Array2<f64>,
    b_mat: &Array2<f64>,
    r_mat: &Array2<f64>,
    p_mat: &Array2<f64>,
) -> Result<Array2<f64>, LinalgError> {
    let bt_p = b_mat.t().dot(p_mat);
    Ok((r_mat + &bt_p.dot(b_mat)).inv()?.dot(&bt_p).dot(a_mat))
}

/// Determine the discrete LQR solution for the given A, B, Q, and R.
///
/// Returns the pair $(K, P)$, with $P$ from [`dare_iterative`] and $K$ from
/// [`lqr_gain`].
pub fn dlqr(
    a_mat: &Array2<f64>,
    b_mat: &Array2<f64>,
    q_mat: &Array2<f64>,
    r_mat: &Array2<f64>,
    tol: Option<f64>,
    iter_max: Option<usize>,
) -> Result<(Array2<f64>, Array2<f64>), LinalgError> {
    let p_mat = dare_iterative(a_mat, b_mat, q_mat, r_mat, tol, iter_max)?;
    Ok((lqr_gain(a_mat, b_mat, r_mat, &p_mat)?, p_mat))
}
