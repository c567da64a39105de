//! Operations on distributed matrices.
//!
//! # The three GEMM shapes of a dense layer
//!
//! With replicated weights and column-distributed activations, every matrix
//! product a dense layer performs falls into one of three cases:
//!
//! 1. `replicated · column → column` — the forward linearity
//!    ($Z = W A_{prev}$) and the backward error GEMM ($E = W^T E_{prev}$).
//!    The contraction runs over a replicated dimension, so each rank computes
//!    its own columns with **no communication**.
//! 2. `replicated · replicated → replicated` — scratch products used by the
//!    gradient-check utility. Purely local.
//! 3. `column · columnᵀ → replicated` — the gradient outer product
//!    ($dW = E_{prev} A_{prev}^T$). The contraction runs over the
//!    *distributed* mini-batch columns: each rank produces a partial sum and
//!    an **All-Reduce** combines them, which is exactly where data-parallel
//!    gradient averaging happens.
//!
//! All kernels are `rayon`-parallel over output rows; each output element is
//! reduced by a sequential inner loop, so results are bit-deterministic for
//! fixed inputs regardless of thread scheduling.

use rayon::prelude::*;

use super::{DistMat, Distribution, MatElem, MatError, MatView, Result};

/// Whether an operand enters a GEMM as itself or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Normal,
    Transpose,
}

fn op_dims(view: MatView, orient: Orientation) -> (usize, usize) {
    match orient {
        Orientation::Normal => (view.height(), view.width()),
        Orientation::Transpose => (view.width(), view.height()),
    }
}

fn partitions_aligned<T: MatElem>(a: &DistMat<T>, b: &DistMat<T>) -> bool {
    a.col_start() == b.col_start() && a.local_width() == b.local_width()
}

/// General matrix multiply on views: `C = alpha * op(A) * op(B) + beta * C`.
///
/// Views address the *stored* operands; the orientation is applied on top,
/// as in `Gemm(TRANSPOSE, NORMAL, ...)`-style BLAS interfaces.
///
/// Supported distribution combinations are the three described in the module
/// docs; anything else returns [`MatError::UnsupportedDistribution`].
#[allow(clippy::too_many_arguments)]
pub fn gemm<T: MatElem>(
    orient_a: Orientation,
    orient_b: Orientation,
    alpha: T,
    a: &DistMat<T>,
    a_view: MatView,
    b: &DistMat<T>,
    b_view: MatView,
    beta: T,
    c: &mut DistMat<T>,
    c_view: MatView,
) -> Result<()> {
    if !a.same_grid(b) || !a.same_grid(c) {
        return Err(MatError::GridMismatch);
    }
    a.check_view(a_view)?;
    b.check_view(b_view)?;
    c.check_view(c_view)?;

    let (m, k) = op_dims(a_view, orient_a);
    let (k2, n) = op_dims(b_view, orient_b);
    if k != k2 || c_view.height() != m || c_view.width() != n {
        return Err(MatError::ShapeMismatch {
            expected: vec![m, k, n],
            got: vec![c_view.height(), k2, c_view.width()],
        });
    }
    // Degenerate output: nothing to write. `m` and `n` are global, so every
    // rank takes this branch together and no collective is skipped unevenly.
    if m == 0 || n == 0 {
        return Ok(());
    }

    match (a.dist(), b.dist(), c.dist()) {
        // Case 1 and 2: contraction over a replicated dimension; each rank
        // fills its own output columns locally.
        (Distribution::Replicated, _, _)
            if orient_b == Orientation::Normal && b.dist() == c.dist() =>
        {
            if b_view.cols() != c_view.cols()
                || (b.dist() == Distribution::ColumnDist && !partitions_aligned(b, c))
            {
                return Err(MatError::PartitionMismatch { op: "gemm" });
            }
            let lcols = b.local_col_range(b_view.cols());
            if lcols.is_empty() {
                return Ok(());
            }
            let cw = c.local_width();
            let c_row0 = c_view.row_start;
            let c_rows = &mut c.local_mut()[c_row0 * cw..(c_row0 + m) * cw];
            c_rows
                .par_chunks_mut(cw)
                .enumerate()
                .for_each(|(i, c_row)| {
                    for lc in lcols.clone() {
                        let mut acc = T::zero();
                        for kk in 0..k {
                            let a_val = match orient_a {
                                Orientation::Normal => {
                                    a.at_local(a_view.row_start + i, a_view.col_start + kk)
                                }
                                Orientation::Transpose => {
                                    a.at_local(a_view.row_start + kk, a_view.col_start + i)
                                }
                            };
                            let b_val = b.at_local(b_view.row_start + kk, lc);
                            acc += a_val * b_val;
                        }
                        c_row[lc] = alpha * acc + beta * c_row[lc];
                    }
                });
            Ok(())
        }
        // Case 3: contraction over the distributed mini-batch columns.
        (Distribution::ColumnDist, Distribution::ColumnDist, Distribution::Replicated)
            if orient_a == Orientation::Normal && orient_b == Orientation::Transpose =>
        {
            if !partitions_aligned(a, b) || a_view.cols() != b_view.cols() {
                return Err(MatError::PartitionMismatch { op: "gemm" });
            }
            let lcols = a.local_col_range(a_view.cols());
            let mut partial = vec![0f64; m * n];
            partial
                .par_chunks_mut(n)
                .enumerate()
                .for_each(|(i, p_row)| {
                    for lc in lcols.clone() {
                        let a_val = a.at_local(a_view.row_start + i, lc);
                        for (j, p) in p_row.iter_mut().enumerate() {
                            let b_val = b.at_local(b_view.row_start + j, lc);
                            *p += (a_val * b_val).to_f64().unwrap_or(0.0);
                        }
                    }
                });
            c.grid().all_reduce_sum(&mut partial);
            let cw = c.local_width();
            let c_row0 = c_view.row_start;
            let c_col0 = c_view.col_start;
            let c_rows = &mut c.local_mut()[c_row0 * cw..(c_row0 + m) * cw];
            c_rows
                .par_chunks_mut(cw)
                .enumerate()
                .for_each(|(i, c_row)| {
                    for j in 0..n {
                        let total = T::from_f64(partial[i * n + j]).unwrap_or_else(T::zero);
                        c_row[c_col0 + j] = alpha * total + beta * c_row[c_col0 + j];
                    }
                });
            Ok(())
        }
        _ => Err(MatError::UnsupportedDistribution { op: "gemm" }),
    }
}

/// Copies the full contents of `src` into `dst` (same shape, distribution and
/// grid required).
pub fn copy<T: MatElem>(src: &DistMat<T>, dst: &mut DistMat<T>) -> Result<()> {
    if !src.same_grid(dst) {
        return Err(MatError::GridMismatch);
    }
    if !src.same_shape(dst) || src.dist() != dst.dist() {
        return Err(MatError::ShapeMismatch {
            expected: vec![src.height(), src.width()],
            got: vec![dst.height(), dst.width()],
        });
    }
    dst.local_mut().copy_from_slice(src.local());
    Ok(())
}

/// `y[view] += alpha * x[view]`, element-wise over aligned views.
pub fn axpy<T: MatElem>(
    alpha: T,
    x: &DistMat<T>,
    x_view: MatView,
    y: &mut DistMat<T>,
    y_view: MatView,
) -> Result<()> {
    if !x.same_grid(y) {
        return Err(MatError::GridMismatch);
    }
    x.check_view(x_view)?;
    y.check_view(y_view)?;
    if x_view.height() != y_view.height()
        || x_view.width() != y_view.width()
        || x.dist() != y.dist()
        || x_view.cols() != y_view.cols()
        || !partitions_aligned(x, y)
    {
        return Err(MatError::PartitionMismatch { op: "axpy" });
    }
    let lcols = x.local_col_range(x_view.cols());
    if lcols.is_empty() || x_view.height() == 0 {
        return Ok(());
    }
    let yw = y.local_width();
    let rows = x_view.height();
    let y_row0 = y_view.row_start;
    let x_row0 = x_view.row_start;
    let y_rows = &mut y.local_mut()[y_row0 * yw..(y_row0 + rows) * yw];
    y_rows
        .par_chunks_mut(yw)
        .enumerate()
        .for_each(|(i, y_row)| {
            for lc in lcols.clone() {
                y_row[lc] += alpha * x.at_local(x_row0 + i, lc);
            }
        });
    Ok(())
}

/// Applies `f` in place to every locally owned element of `view`.
pub fn apply<T, F>(mat: &mut DistMat<T>, view: MatView, f: F) -> Result<()>
where
    T: MatElem,
    F: Fn(T) -> T + Sync + Send,
{
    mat.check_view(view)?;
    let lcols = mat.local_col_range(view.cols());
    if lcols.is_empty() || view.height() == 0 {
        return Ok(());
    }
    let w = mat.local_width();
    let rows = view.height();
    let row0 = view.row_start;
    let slab = &mut mat.local_mut()[row0 * w..(row0 + rows) * w];
    slab.par_chunks_mut(w).for_each(|row| {
        for lc in lcols.clone() {
            row[lc] = f(row[lc]);
        }
    });
    Ok(())
}

/// `dst[i][j] = f(dst[i][j], src[i][j])` over aligned views. Used for the
/// backward nonlinearity, where the error signal is scaled by the activation
/// derivative evaluated at the pre-activations.
pub fn zip_apply<T, F>(
    dst: &mut DistMat<T>,
    dst_view: MatView,
    src: &DistMat<T>,
    src_view: MatView,
    f: F,
) -> Result<()>
where
    T: MatElem,
    F: Fn(T, T) -> T + Sync + Send,
{
    if !dst.same_grid(src) {
        return Err(MatError::GridMismatch);
    }
    dst.check_view(dst_view)?;
    src.check_view(src_view)?;
    if dst_view.height() != src_view.height()
        || dst_view.width() != src_view.width()
        || dst.dist() != src.dist()
        || dst_view.cols() != src_view.cols()
        || !partitions_aligned(dst, src)
    {
        return Err(MatError::PartitionMismatch { op: "zip_apply" });
    }
    let lcols = dst.local_col_range(dst_view.cols());
    if lcols.is_empty() || dst_view.height() == 0 {
        return Ok(());
    }
    let w = dst.local_width();
    let rows = dst_view.height();
    let d_row0 = dst_view.row_start;
    let s_row0 = src_view.row_start;
    let slab = &mut dst.local_mut()[d_row0 * w..(d_row0 + rows) * w];
    slab.par_chunks_mut(w).enumerate().for_each(|(i, row)| {
        for lc in lcols.clone() {
            row[lc] = f(row[lc], src.at_local(s_row0 + i, lc));
        }
    });
    Ok(())
}

/// Squared Frobenius norm of the whole matrix.
///
/// Sequential accumulation: this value feeds reported statistics, and a fixed
/// summation order keeps repeated passes bit-identical.
pub fn frobenius_norm_sq<T: MatElem>(mat: &DistMat<T>) -> T {
    let local: f64 = mat
        .local()
        .iter()
        .fold(0.0, |acc, &v| acc + v.to_f64().unwrap_or(0.0).powi(2));
    let total = match mat.dist() {
        Distribution::Replicated => local,
        Distribution::ColumnDist => mat.grid().all_reduce_sum_scalar(local),
    };
    T::from_f64(total).unwrap_or_else(T::zero)
}

/// Euclidean norm of each locally owned column of `view`, in local column
/// order. Cross-rank aggregation is the caller's concern.
pub fn column_norms_local<T: MatElem>(mat: &DistMat<T>, view: MatView) -> Result<Vec<T>> {
    mat.check_view(view)?;
    let lcols = mat.local_col_range(view.cols());
    let mut norms = Vec::with_capacity(lcols.len());
    for lc in lcols {
        let mut acc = 0.0f64;
        for row in view.rows() {
            acc += mat.at_local(row, lc).to_f64().unwrap_or(0.0).powi(2);
        }
        norms.push(T::from_f64(acc.sqrt()).unwrap_or_else(T::zero));
    }
    Ok(norms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::ProcessGrid;
    use crate::mat::Distribution;

    fn mat_from(
        grid: &std::sync::Arc<ProcessGrid>,
        dist: Distribution,
        h: usize,
        w: usize,
        data: &[f64],
    ) -> DistMat<f64> {
        let mut m = DistMat::zeros(grid.clone(), dist, h, w);
        m.local_mut().copy_from_slice(data);
        m
    }

    #[test]
    fn test_gemm_replicated_times_column() {
        let grid = ProcessGrid::local();
        // A = [[1, 2], [3, 4]], B = [[5, 6], [7, 8]]
        let a = mat_from(&grid, Distribution::Replicated, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = mat_from(&grid, Distribution::ColumnDist, 2, 2, &[5.0, 6.0, 7.0, 8.0]);
        let mut c = DistMat::zeros(grid, Distribution::ColumnDist, 2, 2);
        let (av, bv, cv) = (a.full_view(), b.full_view(), c.full_view());
        gemm(
            Orientation::Normal,
            Orientation::Normal,
            1.0,
            &a,
            av,
            &b,
            bv,
            0.0,
            &mut c,
            cv,
        )
        .unwrap();
        assert_eq!(c.local(), &[19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_gemm_transpose_a() {
        let grid = ProcessGrid::local();
        // A^T * B with A = [[1, 2], [3, 4]]: A^T = [[1, 3], [2, 4]]
        let a = mat_from(&grid, Distribution::Replicated, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = mat_from(&grid, Distribution::ColumnDist, 2, 1, &[1.0, 1.0]);
        let mut c = DistMat::zeros(grid, Distribution::ColumnDist, 2, 1);
        let (av, bv, cv) = (a.full_view(), b.full_view(), c.full_view());
        gemm(
            Orientation::Transpose,
            Orientation::Normal,
            1.0,
            &a,
            av,
            &b,
            bv,
            0.0,
            &mut c,
            cv,
        )
        .unwrap();
        assert_eq!(c.local(), &[4.0, 6.0]);
    }

    #[test]
    fn test_gemm_outer_product_into_replicated() {
        let grid = ProcessGrid::local();
        // A (2x2 coldist) * B^T (from 2x2 coldist) -> replicated 2x2.
        let a = mat_from(&grid, Distribution::ColumnDist, 2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let b = mat_from(&grid, Distribution::ColumnDist, 2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let mut c = DistMat::zeros(grid, Distribution::Replicated, 2, 2);
        let (av, bv, cv) = (a.full_view(), b.full_view(), c.full_view());
        gemm(
            Orientation::Normal,
            Orientation::Transpose,
            0.5,
            &a,
            av,
            &b,
            bv,
            0.0,
            &mut c,
            cv,
        )
        .unwrap();
        // A * B^T = [[1, 2], [3, 4]] (B is identity), halved.
        assert_eq!(c.local(), &[0.5, 1.0, 1.5, 2.0]);
    }

    #[test]
    fn test_gemm_view_restriction() {
        let grid = ProcessGrid::local();
        let a = mat_from(&grid, Distribution::Replicated, 2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let b = mat_from(
            &grid,
            Distribution::ColumnDist,
            2,
            3,
            &[1.0, 2.0, 9.0, 3.0, 4.0, 9.0],
        );
        let mut c = mat_from(
            &grid,
            Distribution::ColumnDist,
            2,
            3,
            &[0.0, 0.0, 7.0, 0.0, 0.0, 7.0],
        );
        // Restrict to the first two columns; the third must stay untouched.
        let view2 = MatView::new(0..2, 0..2);
        gemm(
            Orientation::Normal,
            Orientation::Normal,
            1.0,
            &a,
            a.full_view(),
            &b,
            view2,
            0.0,
            &mut c,
            view2,
        )
        .unwrap();
        assert_eq!(c.local(), &[1.0, 2.0, 7.0, 3.0, 4.0, 7.0]);
    }

    #[test]
    fn test_gemm_shape_mismatch() {
        let grid = ProcessGrid::local();
        let a = DistMat::<f64>::zeros(grid.clone(), Distribution::Replicated, 2, 3);
        let b = DistMat::<f64>::zeros(grid.clone(), Distribution::ColumnDist, 2, 2);
        let mut c = DistMat::<f64>::zeros(grid, Distribution::ColumnDist, 2, 2);
        let (av, bv, cv) = (a.full_view(), b.full_view(), c.full_view());
        let res = gemm(
            Orientation::Normal,
            Orientation::Normal,
            1.0,
            &a,
            av,
            &b,
            bv,
            0.0,
            &mut c,
            cv,
        );
        assert!(matches!(res, Err(MatError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_gemm_grid_mismatch() {
        let g1 = ProcessGrid::local();
        let g2 = ProcessGrid::local();
        let a = DistMat::<f64>::zeros(g1, Distribution::Replicated, 2, 2);
        let b = DistMat::<f64>::zeros(g2.clone(), Distribution::ColumnDist, 2, 2);
        let mut c = DistMat::<f64>::zeros(g2, Distribution::ColumnDist, 2, 2);
        let (av, bv, cv) = (a.full_view(), b.full_view(), c.full_view());
        let res = gemm(
            Orientation::Normal,
            Orientation::Normal,
            1.0,
            &a,
            av,
            &b,
            bv,
            0.0,
            &mut c,
            cv,
        );
        assert!(matches!(res, Err(MatError::GridMismatch)));
    }

    #[test]
    fn test_axpy_and_apply() {
        let grid = ProcessGrid::local();
        let x = mat_from(&grid, Distribution::Replicated, 1, 3, &[1.0, 2.0, 3.0]);
        let mut y = mat_from(&grid, Distribution::Replicated, 1, 3, &[1.0, 1.0, 1.0]);
        let (xv, yv) = (x.full_view(), y.full_view());
        axpy(2.0, &x, xv, &mut y, yv).unwrap();
        assert_eq!(y.local(), &[3.0, 5.0, 7.0]);
        let view = y.full_view();
        apply(&mut y, view, |v| v - 1.0).unwrap();
        assert_eq!(y.local(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_zip_apply() {
        let grid = ProcessGrid::local();
        let z = mat_from(&grid, Distribution::ColumnDist, 1, 3, &[1.0, 2.0, 3.0]);
        let mut e = mat_from(&grid, Distribution::ColumnDist, 1, 3, &[4.0, 5.0, 6.0]);
        let (ev, zv) = (e.full_view(), z.full_view());
        zip_apply(&mut e, ev, &z, zv, |a, b| a * b).unwrap();
        assert_eq!(e.local(), &[4.0, 10.0, 18.0]);
    }

    #[test]
    fn test_frobenius_norm_sq() {
        let grid = ProcessGrid::local();
        let m = mat_from(&grid, Distribution::Replicated, 2, 2, &[1.0, 2.0, 2.0, 0.0]);
        assert_eq!(frobenius_norm_sq(&m), 9.0);
    }

    #[test]
    fn test_column_norms() {
        let grid = ProcessGrid::local();
        let m = mat_from(&grid, Distribution::ColumnDist, 2, 2, &[3.0, 0.0, 4.0, 5.0]);
        let norms = column_norms_local(&m, m.full_view()).unwrap();
        assert_eq!(norms, vec![5.0, 5.0]);
    }
}
