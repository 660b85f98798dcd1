//! One-sided transport between nodes.
//!
//! [`Fabric`] captures the operations the remote path needs from an RDMA
//! fabric with notified writes: bind a private segment, make it addressable
//! by partners, write a byte range into a partner's segment while setting a
//! notification there, and poll/reset notifications on the own segment.

use thiserror::Error;

use crate::region::Region;
use crate::wait::{Backoff, BackoffPolicy};

/// Identifier of a bound segment.
pub type SegmentId = u32;

/// Index of a notification within a bound segment.
pub type NotificationId = u32;

/// Failures reported by a fabric.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    /// The transmit queue cannot take more requests until drained.
    #[error("queue full")]
    QueueFull,

    /// The target segment is not bound or not registered with this rank.
    #[error("segment {segment} is not reachable on rank {rank}")]
    Unreachable {
        /// Segment id.
        segment: SegmentId,
        /// Target rank.
        rank: i32,
    },

    /// An offset, size or notification id is out of range.
    #[error("{0}")]
    OutOfBounds(String),

    /// Backend-specific failure.
    #[error("{0}")]
    Failed(String),
}

/// Operations of a one-sided fabric with notified writes.
pub trait Fabric {
    /// Global rank of the calling process on the fabric.
    fn rank(&self) -> i32;

    /// Number of segments that can be bound at once.
    fn segment_max(&self) -> u32;

    /// Number of notifications available per segment.
    fn notification_num(&self) -> u32;

    /// Ids of the segments currently bound by this rank.
    fn segment_list(&self) -> Vec<SegmentId>;

    /// Bind `region` as segment `id` so partners can write into it.
    ///
    /// # Safety
    ///
    /// The fabric keeps the address range past the borrow: the memory behind
    /// `region` must stay valid until [`delete`](Self::delete) of `id`
    /// returned, on every path including errors.
    unsafe fn bind(&self, id: SegmentId, region: Region<'_>) -> Result<(), FabricError>;

    /// Establish a connection to `rank`.
    fn connect(&self, rank: i32) -> Result<(), FabricError>;

    /// Make this rank's segment `id` writable by `rank`.
    fn register(&self, id: SegmentId, rank: i32) -> Result<(), FabricError>;

    /// Copy `size` bytes from `local_offset` of the own segment `id` to
    /// `remote_offset` of `rank`'s segment `id`, then set notification
    /// `nid` there to `value`.
    #[allow(clippy::too_many_arguments)]
    fn write_notify(
        &self,
        id: SegmentId,
        local_offset: usize,
        rank: i32,
        remote_offset: usize,
        size: usize,
        nid: NotificationId,
        value: u32,
        queue: u32,
    ) -> Result<(), FabricError>;

    /// Block until every request posted on `queue` completed locally.
    fn wait(&self, queue: u32) -> Result<(), FabricError>;

    /// True when notification `nid` of the own segment `id` is set.
    fn notify_test(&self, id: SegmentId, nid: NotificationId) -> Result<bool, FabricError>;

    /// Clear notification `nid`, returning its previous value.
    fn notify_reset(&self, id: SegmentId, nid: NotificationId) -> Result<u32, FabricError>;

    /// Unbind segment `id`.
    fn delete(&self, id: SegmentId) -> Result<(), FabricError>;
}

/// Id of the notification for `(generation, type_id, idx)` in a segment laid
/// out for `num_types` types and `num_neighbors` partners.
#[inline]
pub fn notification_id(
    generation: usize,
    num_types: usize,
    type_id: usize,
    num_neighbors: usize,
    idx: usize,
) -> NotificationId {
    (generation * (num_types * num_neighbors) + type_id * num_neighbors + idx) as NotificationId
}

/// Post a notified write, draining the queue and retrying while it is full,
/// then wait for local completion.
#[allow(clippy::too_many_arguments)]
pub fn write_notify_and_wait<F: Fabric + ?Sized>(
    fabric: &F,
    id: SegmentId,
    local_offset: usize,
    rank: i32,
    remote_offset: usize,
    size: usize,
    nid: NotificationId,
    value: u32,
    queue: u32,
    policy: BackoffPolicy,
) -> Result<(), FabricError> {
    let mut backoff = Backoff::new(policy);
    loop {
        match fabric.write_notify(
            id,
            local_offset,
            rank,
            remote_offset,
            size,
            nid,
            value,
            queue,
        ) {
            Ok(()) => break,
            Err(FabricError::QueueFull) => {
                fabric.wait(queue)?;
                backoff.snooze();
            }
            Err(err) => return Err(err),
        }
    }
    fabric.wait(queue)
}
