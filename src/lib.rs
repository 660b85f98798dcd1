//! # shan
//!
//! Shared notifications: asynchronous per-partner data exchange for SPMD
//! programs, over node-local shared memory and one-sided notified writes.
//!
//! This crate provides:
//! - Shared segments spanning the ranks of one node ([`Segment`])
//! - Cache-line strided notification counters ([`Notifications`])
//! - A deterministic slot geometry for many message types ([`Layout`])
//! - Neighborhoods that send to any partner with one call and detect
//!   completion by polling ([`Neighborhood`])
//! - An in-process backend where threads play ranks ([`ThreadWorld`])
//! - MPI bootstrap, native shared windows and an MPI-RMA fabric (with the
//!   `mpi` feature)
//!
//! ## Quick Start
//!
//! ```
//! use shan::{Communicator, Neighborhood, Segment, SegmentBackend, SegmentKind,
//!            ShanConfig, ThreadWorld, TypeBounds};
//!
//! fn main() -> Result<(), shan::Error> {
//!     let config = ShanConfig::default().with_segment_backend(SegmentBackend::ProcessHeap);
//!     // 4 ranks, 2 per node: partners 0-1 and 2-3 share memory, 1-2 and 3-0 do not
//!     let sums = ThreadWorld::new(4, 2).run(|rank| -> shan::Result<f64> {
//!         let world = &rank.world;
//!         let node = world.split_shared()?;
//!         let (me, n) = (world.rank(), world.size());
//!         let partners = [(me + n - 1) % n, (me + 1) % n];
//!         let bounds = [TypeBounds { max_send_bytes: 8, max_recv_bytes: 8,
//!                                    max_nelem_send: 1, max_nelem_recv: 1 }];
//!         let mut nh = Neighborhood::init(0, &partners, &bounds, &node, world,
//!                                         rank.fabric.clone(), config.clone())?;
//!         let data = Segment::alloc(0, SegmentKind::Data, 24, &node, config.segment_backend)?;
//!         data.write(0, &[f64::from(me)]);
//!         for idx in 0..2 {
//!             let meta = nh.type_offset(0);
//!             meta.set_send(idx, 8, &[0])?;
//!             meta.set_recv(idx, 8, &[8 + 8 * idx as i64])?;
//!             nh.notify_or_write(&data, 0, idx);
//!         }
//!         nh.wait_all(&data, 0);
//!         let mut got = [0.0f64; 2];
//!         data.read(8, &mut got);
//!         node.barrier()?;
//!         nh.free()?;
//!         data.free()?;
//!         Ok(got[0] + got[1])
//!     })?;
//!     assert_eq!(sums.into_iter().collect::<shan::Result<Vec<_>>>()?, vec![4.0, 2.0, 4.0, 2.0]);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `mpi`   | MPI bootstrap ([`Mpi`], `MpiComm`), native shared windows, MPI-RMA fabric | system MPI |
//!
//! ## Error model
//!
//! Setup and teardown return [`Result`]. The send/receive paths return
//! nothing or a readiness flag and panic on protocol violations.
//!
//! ## Environment
//!
//! [`ShanConfig::from_env`] reads the `SHAN_*` variables listed in the
//! [`ShanConfig`] docs.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::similar_names)]

mod channel;
mod comm;
mod compat;
mod config;
mod datatype;
mod error;
mod fabric;
#[cfg(feature = "mpi")]
mod ffi;
mod layout;
mod meta;
#[cfg(feature = "mpi")]
mod mpi;
mod neighborhood;
mod notification;
mod region;
mod segment;
mod threads;
mod topology;
mod transport;
mod wait;

pub use channel::{ChannelCounters, Generation};
pub use comm::Communicator;
pub use compat::{HandleTable, MAX_NEIGHBORHOODS, MAX_SEGMENTS};
pub use config::{Negotiation, ShanConfig};
pub use datatype::{Datatype, DatatypeTag};
pub use error::{Error, Result};
pub use fabric::{
    notification_id, write_notify_and_wait, Fabric, FabricError, NotificationId, SegmentId,
};
pub use layout::{align_up, Layout, SlotHeader, TypeBounds, TypeElement, HEADER_LEN};
pub use meta::{Descriptor, TypeMeta};
#[cfg(feature = "mpi")]
pub use mpi::{Mpi, MpiComm, RmaFabric, ThreadLevel};
pub use neighborhood::{Neighborhood, Partner, Phase, Route};
pub use notification::{Notifications, NOTIFICATION_STRIDE};
pub use region::{HeapRegion, Region};
pub use segment::{page_size, Segment, SegmentBackend, SegmentKind, SharedMapping};
pub use threads::{ThreadComm, ThreadFabric, ThreadRank, ThreadWorld};
pub use topology::NodeMap;
pub use wait::{spin_until, Backoff, BackoffPolicy};

/// Reduction operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReduceOp {
    /// Sum of values
    Sum = 0,
    /// Maximum value
    Max = 1,
    /// Minimum value
    Min = 2,
    /// Product of values
    Prod = 3,
}
