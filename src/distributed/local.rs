use super::backend::Collective;

/// The trivial single-process backend: rank 0 of a world of 1.
///
/// Reductions are the identity, which makes single-process training and unit
/// tests exercise the exact same code paths as a multi-rank run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl Collective for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buf: &mut [f64]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_comm_identity() {
        let comm = SelfComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);
        let mut buf = vec![1.0, 2.0];
        comm.all_reduce_sum(&mut buf);
        assert_eq!(buf, vec![1.0, 2.0]);
    }
}
