//! # Process grids and collective communication
//!
//! The layer core never talks to another rank directly: all cross-rank
//! synchronization happens inside matrix operations, through the
//! [`Collective`] backend owned by the [`ProcessGrid`].
//!
//! Two backends are provided:
//!
//! - [`SelfComm`]: a single-process grid. Every reduce is the identity; this
//!   is what unit tests and single-machine training run on.
//! - [`RingComm`]: a **Ring All-Reduce** over `crossbeam` channels, one
//!   worker thread per rank. This is the same data movement NCCL performs on
//!   GPUs, in miniature: a scatter-reduce pass followed by an all-gather
//!   pass, each moving `(world_size - 1)` chunks around the ring.
//!
//! All collectives are blocking: a rank that enters `all_reduce_sum` does not
//! leave until every chunk exchange completes, so a stalled peer stalls the
//! group. Cancellation is deliberately out of scope at this level.

pub mod backend;
pub mod grid;
pub mod local;
pub mod ring;

pub use backend::Collective;
pub use grid::ProcessGrid;
pub use local::SelfComm;
pub use ring::RingComm;
