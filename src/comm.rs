//! Communicator abstraction used for bootstrapping.
//!
//! The communication engine only needs a handful of collectives at setup
//! time (node splitting, master discovery, roster negotiation, maxima). They
//! are expressed as a trait so the same engine runs over MPI processes
//! ([`MpiComm`](crate::MpiComm), feature `mpi`) or over threads of one
//! process ([`ThreadComm`](crate::ThreadComm)).

use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::segment::{self, SegmentBackend, SegmentKind, SharedMapping};
use crate::ReduceOp;

/// A group of ranks able to run collective and point-to-point operations.
///
/// Cloning yields another handle to the same group.
pub trait Communicator: Clone {
    /// Rank of the calling process in this communicator.
    fn rank(&self) -> i32;

    /// Number of ranks in this communicator.
    fn size(&self) -> i32;

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Block until every rank entered the barrier.
    fn barrier(&self) -> Result<()>;

    // ========================================================================
    // Collectives
    // ========================================================================

    /// Broadcast `data` from `root` to all ranks.
    fn broadcast<T: Datatype>(&self, data: &mut [T], root: i32) -> Result<()>;

    /// Gather `send` from every rank into `recv`, ordered by rank.
    ///
    /// `recv.len()` must be `size() * send.len()`.
    fn allgather<T: Datatype>(&self, send: &[T], recv: &mut [T]) -> Result<()>;

    /// Gather variable-length contributions: rank `r` places `counts[r]`
    /// elements at `recv[displs[r]..]`.
    fn allgatherv<T: Datatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[i32],
        displs: &[i32],
    ) -> Result<()>;

    /// Element-wise reduction over all ranks, result on every rank.
    fn allreduce_inplace<T: Datatype>(&self, data: &mut [T], op: ReduceOp) -> Result<()>;

    // ========================================================================
    // Point-to-Point Communication
    // ========================================================================

    /// Send `data` to `dest`.
    fn send<T: Datatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()>;

    /// Receive exactly `data.len()` elements from `source`.
    fn recv<T: Datatype>(&self, data: &mut [T], source: i32, tag: i32) -> Result<()>;

    // ========================================================================
    // Topology and shared memory
    // ========================================================================

    /// Split into communicators of ranks sharing memory, ordered by rank in
    /// `self`.
    fn split_shared(&self) -> Result<Self>;

    /// Map a node-wide shared region where local rank `r` owns
    /// `local_sizes[r]` bytes. Collective over a node-local communicator.
    fn map_shared(
        &self,
        kind: SegmentKind,
        id: i32,
        local_sizes: &[usize],
        backend: SegmentBackend,
    ) -> Result<Box<dyn SharedMapping>> {
        match backend {
            SegmentBackend::Posix => segment::map_posix(self, kind, id, local_sizes),
            other => Err(Error::NotSupported(format!(
                "{other:?} segments on this communicator"
            ))),
        }
    }

    /// Swap equally sized buffers with `partner`.
    ///
    /// The lower rank sends first, so two ranks exchanging with each other
    /// never both block in `recv`.
    fn exchange<T: Datatype>(&self, send: &[T], recv: &mut [T], partner: i32, tag: i32) -> Result<()> {
        let me = self.rank();
        if partner == me || partner < 0 || partner >= self.size() {
            return Err(Error::InvalidRank(partner));
        }
        if me < partner {
            self.send(send, partner, tag)?;
            self.recv(recv, partner, tag)
        } else {
            self.recv(recv, partner, tag)?;
            self.send(send, partner, tag)
        }
    }

    /// Gather variable-length contributions, returning per-rank counts and
    /// the concatenation in rank order.
    fn allgather_varcount<T: Datatype>(&self, send: &[T]) -> Result<(Vec<i32>, Vec<T>)> {
        let size = self.size() as usize;
        let mut counts = vec![0i32; size];
        self.allgather(&[send.len() as i32], &mut counts)?;
        let displs: Vec<i32> = counts
            .iter()
            .scan(0i32, |acc, &n| {
                let d = *acc;
                *acc += n;
                Some(d)
            })
            .collect();
        let total = counts.iter().map(|&n| n as usize).sum();
        let mut recv = vec![T::zeroed(); total];
        self.allgatherv(send, &mut recv, &counts, &displs)?;
        Ok((counts, recv))
    }
}
