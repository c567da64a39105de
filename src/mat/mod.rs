//! Block-distributed dense matrices.
//!
//! # How a `DistMat` is laid out
//!
//! A [`DistMat`] has a single *global* shape (`height × width`) that every
//! rank of the grid agrees on, and a *local* partition that this rank owns.
//! The partition is decided by the [`Distribution`]:
//!
//! - [`Distribution::Replicated`]: every rank owns the whole matrix. Used for
//!   weight-like matrices, which data-parallel training keeps in sync by
//!   construction (identical init streams, identical all-reduced gradients).
//! - [`Distribution::ColumnDist`]: columns are block-partitioned across the
//!   grid. Used for activation-like matrices whose columns are mini-batch
//!   samples.
//!
//! Local storage is always a dense row-major `height × local_width` block, so
//! every operation can run over plain slices.
//!
//! # Views
//!
//! A [`MatView`] is a pure row/column range descriptor — it owns no storage
//! and holds no reference. Operations in [`ops`] take `(matrix, view)` pairs;
//! the layer rebuilds its view descriptors whenever the current mini-batch
//! width changes, instead of keeping aliasing sub-matrices alive.

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, RwLock};

use num_traits::{Float, FromPrimitive, NumAssign, ToPrimitive};
use rand::Rng;
use rand_distr::{Distribution as RandDistribution, Normal, Uniform};
use thiserror::Error;

use crate::distributed::ProcessGrid;

pub mod ops;

pub use ops::Orientation;

/// Element trait for distributed matrices.
///
/// Everything the layer math needs: floating-point ops, assignment ops,
/// conversions for the f64 collective wire format, and thread-safety for
/// `rayon`.
pub trait MatElem:
    Float + NumAssign + FromPrimitive + ToPrimitive + fmt::Debug + Send + Sync + 'static
{
}

impl<T> MatElem for T where
    T: Float + NumAssign + FromPrimitive + ToPrimitive + fmt::Debug + Send + Sync + 'static
{
}

/// A matrix shared between neighboring layers (activation / error-signal
/// hand-off). The producing layer owns the handle; consumers clone the `Arc`.
pub type SharedMat<T> = Arc<RwLock<DistMat<T>>>;

/// Error type for distributed-matrix operations.
#[derive(Error, Debug)]
pub enum MatError {
    /// The shapes of the operands do not line up.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// Operands were created on different process grids.
    #[error("matrices belong to different process grids")]
    GridMismatch,
    /// A view does not fit inside its matrix.
    #[error("view {view:?} out of bounds for {height}x{width} matrix")]
    ViewOutOfBounds {
        view: MatView,
        height: usize,
        width: usize,
    },
    /// The distribution combination is not one the layer algebra needs.
    #[error("unsupported distribution combination for {op}")]
    UnsupportedDistribution { op: &'static str },
    /// Column partitions of the operands are not aligned.
    #[error("misaligned column partitions for {op}")]
    PartitionMismatch { op: &'static str },
}

pub type Result<T> = std::result::Result<T, MatError>;

/// How a matrix is spread over the process grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Every rank holds the full matrix.
    Replicated,
    /// Columns are block-partitioned across ranks.
    ColumnDist,
}

/// A non-owning sub-range of a matrix: half-open row and column ranges.
///
/// `MatView` is plain data (`Copy`); it never outlives or aliases storage.
/// Bounds are validated by the operation that consumes the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatView {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl MatView {
    pub fn new(rows: Range<usize>, cols: Range<usize>) -> Self {
        Self {
            row_start: rows.start,
            row_end: rows.end,
            col_start: cols.start,
            col_end: cols.end,
        }
    }

    pub fn rows(&self) -> Range<usize> {
        self.row_start..self.row_end
    }

    pub fn cols(&self) -> Range<usize> {
        self.col_start..self.col_end
    }

    pub fn height(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn width(&self) -> usize {
        self.col_end - self.col_start
    }

    fn fits(&self, height: usize, width: usize) -> bool {
        self.row_start <= self.row_end
            && self.col_start <= self.col_end
            && self.row_end <= height
            && self.col_end <= width
    }
}

/// Block partition of `width` columns over `size` ranks: the first
/// `width % size` ranks get one extra column.
fn col_partition(width: usize, rank: usize, size: usize) -> (usize, usize) {
    let base = width / size;
    let rem = width % size;
    let start = rank * base + rank.min(rem);
    let len = base + usize::from(rank < rem);
    (start, len)
}

/// A dense 2-D matrix distributed over a process grid.
#[derive(Clone)]
pub struct DistMat<T: MatElem> {
    grid: Arc<ProcessGrid>,
    dist: Distribution,
    height: usize,
    width: usize,
    col_start: usize,
    local_width: usize,
    local: Vec<T>,
}

impl<T: MatElem> DistMat<T> {
    /// Creates a zero-filled matrix of the given global shape.
    pub fn zeros(grid: Arc<ProcessGrid>, dist: Distribution, height: usize, width: usize) -> Self {
        let (col_start, local_width) = match dist {
            Distribution::Replicated => (0, width),
            Distribution::ColumnDist => col_partition(width, grid.rank(), grid.size()),
        };
        Self {
            grid,
            dist,
            height,
            width,
            col_start,
            local_width,
            local: vec![T::zero(); height * local_width],
        }
    }

    /// Resets the matrix to a zero-filled `height × width` allocation,
    /// recomputing the local partition. This is the "allocate-or-re-zero"
    /// primitive layer setup is built on.
    pub fn resize_zeros(&mut self, height: usize, width: usize) {
        let (col_start, local_width) = match self.dist {
            Distribution::Replicated => (0, width),
            Distribution::ColumnDist => col_partition(width, self.grid.rank(), self.grid.size()),
        };
        self.height = height;
        self.width = width;
        self.col_start = col_start;
        self.local_width = local_width;
        self.local.clear();
        self.local.resize(height * local_width, T::zero());
    }

    pub fn grid(&self) -> &Arc<ProcessGrid> {
        &self.grid
    }

    pub fn dist(&self) -> Distribution {
        self.dist
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Global column index of the first locally owned column.
    pub fn col_start(&self) -> usize {
        self.col_start
    }

    /// Number of locally owned columns.
    pub fn local_width(&self) -> usize {
        self.local_width
    }

    /// The local partition, row-major with stride [`Self::local_width`].
    pub fn local(&self) -> &[T] {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut [T] {
        &mut self.local
    }

    pub fn same_grid(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.grid, &other.grid)
    }

    pub fn same_shape(&self, other: &Self) -> bool {
        self.height == other.height && self.width == other.width
    }

    /// Whether this rank owns global column `col`.
    pub fn owns_col(&self, col: usize) -> bool {
        col >= self.col_start && col < self.col_start + self.local_width
    }

    /// Whether global element `(row, col)` lives in the local partition.
    pub fn is_local(&self, row: usize, col: usize) -> bool {
        row < self.height && self.owns_col(col)
    }

    /// Maps a global column to its local index, if owned.
    pub fn local_col(&self, col: usize) -> Option<usize> {
        self.owns_col(col).then(|| col - self.col_start)
    }

    /// Maps a local column index back to its global column.
    pub fn global_col(&self, local_col: usize) -> usize {
        self.col_start + local_col
    }

    /// Local column indices covered by a global column range.
    pub fn local_col_range(&self, cols: Range<usize>) -> Range<usize> {
        let lo = cols.start.max(self.col_start);
        let hi = cols.end.min(self.col_start + self.local_width);
        if lo >= hi {
            0..0
        } else {
            (lo - self.col_start)..(hi - self.col_start)
        }
    }

    /// Reads element `(row, local_col)` from the local partition.
    pub fn at_local(&self, row: usize, local_col: usize) -> T {
        self.local[row * self.local_width + local_col]
    }

    pub fn set_local(&mut self, row: usize, local_col: usize, value: T) {
        self.local[row * self.local_width + local_col] = value;
    }

    /// Reads a global element; `None` if it lives on another rank.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        self.local_col(col).map(|lc| self.at_local(row, lc))
    }

    /// Writes a global element if this rank owns it; returns whether it did.
    /// Non-owning ranks are a no-op, mirroring locality-guarded writes in
    /// distributed linear algebra.
    pub fn set(&mut self, row: usize, col: usize, value: T) -> bool {
        match self.local_col(col) {
            Some(lc) => {
                self.set_local(row, lc, value);
                true
            }
            None => false,
        }
    }

    /// The view covering the whole matrix.
    pub fn full_view(&self) -> MatView {
        MatView::new(0..self.height, 0..self.width)
    }

    pub(crate) fn check_view(&self, view: MatView) -> Result<()> {
        if view.fits(self.height, self.width) {
            Ok(())
        } else {
            Err(MatError::ViewOutOfBounds {
                view,
                height: self.height,
                width: self.width,
            })
        }
    }

    /// Zeroes the elements covered by `view`.
    pub fn zero_view(&mut self, view: MatView) -> Result<()> {
        self.fill_with(view, || T::zero())
    }

    /// Fills `view` with i.i.d. samples from `U(low, high)`.
    ///
    /// Samples are drawn for *every* element of the view, owned or not, so
    /// the stream stays aligned across ranks: a replicated matrix filled from
    /// rank-identical seeds ends up identical everywhere without a broadcast.
    pub fn uniform_fill<R: Rng>(
        &mut self,
        view: MatView,
        rng: &mut R,
        low: f64,
        high: f64,
    ) -> Result<()> {
        let dist = Uniform::new(low, high);
        self.fill_with(view, || {
            T::from_f64(dist.sample(&mut *rng)).unwrap_or_else(T::zero)
        })
    }

    /// Fills `view` with i.i.d. samples from `N(mean, stddev²)`. Same
    /// rank-alignment rule as [`Self::uniform_fill`].
    pub fn gaussian_fill<R: Rng>(
        &mut self,
        view: MatView,
        rng: &mut R,
        mean: f64,
        stddev: f64,
    ) -> Result<()> {
        let dist = Normal::new(mean, stddev).expect("stddev must be finite and non-negative");
        self.fill_with(view, || {
            T::from_f64(dist.sample(&mut *rng)).unwrap_or_else(T::zero)
        })
    }

    fn fill_with<F: FnMut() -> T>(&mut self, view: MatView, mut sample: F) -> Result<()> {
        self.check_view(view)?;
        for row in view.rows() {
            for col in view.cols() {
                let value = sample();
                if let Some(lc) = self.local_col(col) {
                    self.set_local(row, lc, value);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zeros_shape_and_partition() {
        let grid = ProcessGrid::local();
        let m = DistMat::<f32>::zeros(grid, Distribution::ColumnDist, 3, 5);
        assert_eq!(m.height(), 3);
        assert_eq!(m.width(), 5);
        // Single-rank grid: the local partition is the whole matrix.
        assert_eq!(m.local_width(), 5);
        assert_eq!(m.local().len(), 15);
        assert!(m.local().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_col_partition_blocks() {
        // 5 columns over 2 ranks: 3 + 2.
        assert_eq!(col_partition(5, 0, 2), (0, 3));
        assert_eq!(col_partition(5, 1, 2), (3, 2));
        // 4 columns over 4 ranks: one each.
        for r in 0..4 {
            assert_eq!(col_partition(4, r, 4), (r, 1));
        }
        // More ranks than columns: trailing ranks own nothing.
        assert_eq!(col_partition(2, 3, 4), (2, 0));
    }

    #[test]
    fn test_set_get_locality() {
        let grid = ProcessGrid::local();
        let mut m = DistMat::<f64>::zeros(grid, Distribution::Replicated, 2, 2);
        assert!(m.is_local(1, 1));
        assert!(m.set(1, 1, 7.0));
        assert_eq!(m.get(1, 1), Some(7.0));
        assert_eq!(m.get(0, 1), Some(0.0));
    }

    #[test]
    fn test_view_bounds() {
        let grid = ProcessGrid::local();
        let m = DistMat::<f32>::zeros(grid, Distribution::Replicated, 2, 3);
        assert!(m.check_view(MatView::new(0..2, 0..3)).is_ok());
        assert!(m.check_view(MatView::new(0..3, 0..3)).is_err());
    }

    #[test]
    fn test_uniform_fill_respects_view() {
        let grid = ProcessGrid::local();
        let mut m = DistMat::<f64>::zeros(grid, Distribution::Replicated, 3, 3);
        let mut rng = StdRng::seed_from_u64(7);
        m.uniform_fill(MatView::new(0..2, 0..2), &mut rng, 0.5, 1.0)
            .unwrap();
        for row in 0..3 {
            for col in 0..3 {
                let v = m.get(row, col).unwrap();
                if row < 2 && col < 2 {
                    assert!((0.5..1.0).contains(&v));
                } else {
                    assert_eq!(v, 0.0);
                }
            }
        }
    }

    #[test]
    fn test_resize_zeros_clears_contents() {
        let grid = ProcessGrid::local();
        let mut m = DistMat::<f32>::zeros(grid, Distribution::Replicated, 2, 2);
        m.set(0, 0, 3.0);
        m.resize_zeros(4, 4);
        assert_eq!(m.height(), 4);
        assert_eq!(m.local().len(), 16);
        assert!(m.local().iter().all(|&v| v == 0.0));
    }
}
