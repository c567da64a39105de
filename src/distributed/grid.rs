use std::sync::Arc;

use super::backend::Collective;
use super::local::SelfComm;

/// The arrangement of cooperating processes matrices are distributed over.
///
/// `gridnet` uses a `1 × P` grid: replicated weight matrices plus
/// column-partitioned activation matrices make every layer GEMM either
/// rank-local or a single gradient All-Reduce, so a second grid dimension
/// would buy nothing but redistribution traffic.
///
/// Grid identity doubles as the consistency token for matrix operations:
/// two matrices interoperate only if they hold the *same* `Arc<ProcessGrid>`.
pub struct ProcessGrid {
    comm: Arc<dyn Collective>,
    height: usize,
    width: usize,
}

impl ProcessGrid {
    /// Wraps a collective backend in a `1 × size` grid.
    pub fn new(comm: Arc<dyn Collective>) -> Arc<Self> {
        let width = comm.size();
        Arc::new(Self {
            comm,
            height: 1,
            width,
        })
    }

    /// A single-process grid (the [`SelfComm`] backend).
    pub fn local() -> Arc<Self> {
        Self::new(Arc::new(SelfComm))
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Whether this rank is the grid root (rank 0), the rank that prints.
    pub fn is_root(&self) -> bool {
        self.comm.rank() == 0
    }

    /// In-place sum All-Reduce over the grid.
    pub fn all_reduce_sum(&self, buf: &mut [f64]) {
        self.comm.all_reduce_sum(buf);
    }

    /// Sum All-Reduce of a single scalar.
    pub fn all_reduce_sum_scalar(&self, value: f64) -> f64 {
        let mut buf = [value];
        self.comm.all_reduce_sum(&mut buf);
        buf[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_grid() {
        let grid = ProcessGrid::local();
        assert_eq!(grid.rank(), 0);
        assert_eq!(grid.size(), 1);
        assert_eq!(grid.height(), 1);
        assert_eq!(grid.width(), 1);
        assert!(grid.is_root());
        assert_eq!(grid.all_reduce_sum_scalar(2.5), 2.5);
    }
}
