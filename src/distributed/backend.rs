/// Abstraction for a collective-communication backend.
///
/// The trait is object safe on purpose: matrices hold their grid behind an
/// `Arc<dyn Collective>` and stay agnostic of the transport. Payloads are
/// `f64` buffers; element types convert at the matrix boundary.
pub trait Collective: Send + Sync {
    /// Rank of the calling process within the group.
    fn rank(&self) -> usize;

    /// Total number of cooperating processes.
    fn size(&self) -> usize;

    /// In-place sum All-Reduce: after the call, every rank's `buf` holds the
    /// element-wise sum of all ranks' inputs. Blocking collective; every rank
    /// must call it with a buffer of the same length.
    fn all_reduce_sum(&self, buf: &mut [f64]);
}
