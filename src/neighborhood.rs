//! Neighborhoods: the partner roster and everything needed to talk to it.
//!
//! A [`Neighborhood`] is created collectively by [`Neighborhood::init`] over
//! the embedding (global) communicator and moves through
//! [`Phase::Uninitialized`] → [`Phase::Negotiating`] → [`Phase::Ready`]. It is
//! released collectively by [`Neighborhood::free`]. Dropping a neighborhood
//! without freeing it only releases the calling rank's resources.
//!
//! ```
//! use shan::{Communicator, Neighborhood, SegmentBackend, SegmentKind, Segment,
//!            ShanConfig, ThreadWorld, TypeBounds};
//!
//! let config = ShanConfig::default().with_segment_backend(SegmentBackend::ProcessHeap);
//! let got = ThreadWorld::new(2, 1).run(|rank| {
//!     let node = rank.world.split_shared().unwrap();
//!     let me = rank.world.rank();
//!     let bounds = [TypeBounds { max_send_bytes: 8, max_recv_bytes: 8,
//!                                max_nelem_send: 1, max_nelem_recv: 1 }];
//!     let mut nh = Neighborhood::init(0, &[1 - me], &bounds, &node, &rank.world,
//!                                     rank.fabric.clone(), config.clone()).unwrap();
//!     let data = Segment::alloc(1, SegmentKind::Data, 16, &node, config.segment_backend)
//!         .unwrap();
//!     data.write(0, &[f64::from(me) + 0.5]);
//!     let meta = nh.type_offset(0);
//!     meta.set_send(0, 8, &[0]).unwrap();
//!     meta.set_recv(0, 8, &[8]).unwrap();
//!     nh.notify_or_write(&data, 0, 0);
//!     nh.wait_all(&data, 0);
//!     let mut v = [0.0f64];
//!     data.read(8, &mut v);
//!     nh.free().unwrap();
//!     data.free().unwrap();
//!     v[0]
//! }).unwrap();
//! assert_eq!(got, vec![1.5, 0.5]);
//! ```

use tracing::{debug, info, warn};

use crate::channel::ChannelCounters;
use crate::comm::Communicator;
use crate::config::{Negotiation, ShanConfig};
use crate::error::{Error, Result};
use crate::fabric::{Fabric, SegmentId};
use crate::layout::{Layout, TypeBounds};
use crate::meta::{TypeMeta, TypeView};
use crate::region::HeapRegion;
use crate::segment::{page_size, Segment, SegmentKind};
use crate::topology::{validate_partners, NodeMap, Rosters};
use crate::ReduceOp;

/// Message tag of the reciprocal index exchange.
const NEGOTIATION_TAG: i32 = 4710;

/// Lifecycle of a neighborhood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Roster accepted, nothing negotiated yet.
    Uninitialized,
    /// Exchanging indices, sizing and binding segments.
    Negotiating,
    /// Sends and receives are allowed.
    Ready,
    /// All resources released.
    Freed,
}

/// How a partner is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Same node: shared segments, at the given node-local rank.
    Local {
        /// Partner's rank in the node communicator.
        local_rank: usize,
    },
    /// Other node: notified writes over the fabric.
    Remote,
}

/// One entry of the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partner {
    /// Rank in the embedding communicator.
    pub rank: i32,
    /// Local or remote.
    pub route: Route,
    /// Index of this rank in the partner's roster.
    pub remote_comm_index: usize,
    /// Length of the partner's roster.
    pub remote_num_neighbors: usize,
}

impl Partner {
    /// True for partners on the same node.
    pub fn is_local(&self) -> bool {
        matches!(self.route, Route::Local { .. })
    }
}

/// Communication state for one roster of partners.
pub struct Neighborhood<C: Communicator, F: Fabric> {
    pub(crate) id: i32,
    pub(crate) node: C,
    pub(crate) global: C,
    pub(crate) fabric: F,
    pub(crate) config: ShanConfig,
    pub(crate) topology: NodeMap,
    pub(crate) partners: Vec<Partner>,
    pub(crate) layout: Layout,
    pub(crate) counters: Vec<Vec<ChannelCounters>>,
    pub(crate) done: Vec<bool>,
    pub(crate) shared: Option<Segment<C>>,
    pub(crate) remote: HeapRegion,
    phase: Phase,
}

impl<C: Communicator, F: Fabric> Neighborhood<C, F> {
    /// Build a neighborhood. Collective over `global`.
    ///
    /// `partners` lists global ranks; the position of a rank in the list is
    /// its partner index in every later call. `bounds` has one entry per
    /// message type. `node` must be `global.split_shared()` (or an
    /// equivalent node-local communicator).
    pub fn init(
        id: i32,
        partners: &[i32],
        bounds: &[TypeBounds],
        node: &C,
        global: &C,
        fabric: F,
        config: ShanConfig,
    ) -> Result<Self> {
        let me = global.rank();
        validate_partners(partners, me, global.size())?;
        if bounds.is_empty() {
            return Err(Error::InvalidCount(0));
        }
        for b in bounds {
            b.validate()?;
        }
        if fabric.rank() != me {
            return Err(Error::InvalidRank(fabric.rank()));
        }
        let mut phase = Phase::Uninitialized;
        info!(id, rank = me, num_neighbors = partners.len(), num_types = bounds.len(), ?phase, "neighborhood");

        let topology = NodeMap::discover(node, global)?;
        phase = Phase::Negotiating;
        info!(id, rank = me, ?phase, "neighborhood");

        let reciprocal = negotiate(global, partners, &config)?;
        let partners: Vec<Partner> = partners
            .iter()
            .zip(reciprocal)
            .map(|(&rank, (remote_comm_index, remote_num_neighbors))| Partner {
                rank,
                route: match topology.local_rank_of(rank) {
                    Some(local_rank) => Route::Local { local_rank },
                    None => Route::Remote,
                },
                remote_comm_index,
                remote_num_neighbors,
            })
            .collect();
        let num_local = partners.iter().filter(|p| p.is_local()).count();
        debug!(id, rank = me, num_local, num_remote = partners.len() - num_local, ?partners, "classified partners");

        let bounds = global_maxima(global, bounds)?;
        let layout = Layout::compute(&bounds, partners.len(), config.alignment, page_size())?;
        debug!(
            id,
            remote_size = layout.remote_size,
            shared_size = layout.shared_size,
            "computed layout"
        );

        let remote = bind_remote(id, &fabric, global, &partners, &layout)?;

        let shared = match Segment::alloc(
            id,
            SegmentKind::Type,
            layout.shared_size,
            node,
            config.segment_backend,
        ) {
            Ok(shared) => shared,
            Err(err) => {
                unbind(&fabric, id as SegmentId);
                return Err(err);
            }
        };
        for elem in &layout.types {
            TypeView::new(shared.local_region(), elem, partners.len()).clear();
        }

        let mut neighborhood = Neighborhood {
            id,
            node: node.clone(),
            global: global.clone(),
            fabric,
            counters: vec![vec![ChannelCounters::default(); partners.len()]; bounds.len()],
            done: Vec::with_capacity(partners.len()),
            config,
            topology,
            partners,
            layout,
            shared: Some(shared),
            remote,
            phase,
        };
        global.barrier()?;
        neighborhood.phase = Phase::Ready;
        info!(id, rank = me, phase = ?neighborhood.phase, "neighborhood");
        Ok(neighborhood)
    }

    /// Release every resource. Collective over the embedding communicator.
    ///
    /// All sends must have completed; outstanding writes are not cancelled.
    pub fn free(mut self) -> Result<()> {
        if let Some(shared) = self.shared.take() {
            shared.free()?;
        }
        self.fabric.wait(self.config.queue)?;
        self.global.barrier()?;
        self.fabric.delete(self.segment_id())?;
        self.phase = Phase::Freed;
        info!(id = self.id, rank = self.global.rank(), phase = ?self.phase, "neighborhood");
        Ok(())
    }

    pub(crate) fn segment_id(&self) -> SegmentId {
        self.id as SegmentId
    }

    pub(crate) fn shared(&self) -> &Segment<C> {
        match &self.shared {
            Some(shared) => shared,
            None => unreachable!("shared segment released"),
        }
    }

    /// Own metadata block of `type_id`.
    pub(crate) fn own_view(&self, type_id: usize) -> TypeView<'_> {
        TypeView::new(
            self.shared().local_region(),
            &self.layout.types[type_id],
            self.partners.len(),
        )
    }

    /// A co-located partner's metadata block of `type_id`.
    pub(crate) fn peer_view(&self, type_id: usize, partner: &Partner, local_rank: usize) -> TypeView<'_> {
        TypeView::new(
            self.shared().region(local_rank),
            &self.layout.types[type_id],
            partner.remote_num_neighbors,
        )
    }

    #[track_caller]
    pub(crate) fn check_channel(&self, type_id: usize, idx: usize) {
        assert!(
            type_id < self.layout.types.len(),
            "type id {type_id} out of range ({} types)",
            self.layout.types.len()
        );
        assert!(
            idx < self.partners.len(),
            "partner index {idx} out of range ({} partners)",
            self.partners.len()
        );
    }

    /// Packing descriptors of `type_id`, to be filled before sending.
    #[track_caller]
    pub fn type_offset(&self, type_id: usize) -> TypeMeta<'_> {
        assert!(
            type_id < self.layout.types.len(),
            "type id {type_id} out of range ({} types)",
            self.layout.types.len()
        );
        TypeMeta::new(self.own_view(type_id))
    }

    /// Barrier over the ranks of this node.
    pub fn shmem_barrier(&self) -> Result<()> {
        self.node.barrier()
    }

    /// Neighborhood id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of partners.
    pub fn num_neighbors(&self) -> usize {
        self.partners.len()
    }

    /// Number of message types.
    pub fn num_types(&self) -> usize {
        self.layout.types.len()
    }

    /// Partner `idx`.
    #[track_caller]
    pub fn partner(&self, idx: usize) -> &Partner {
        &self.partners[idx]
    }

    /// All partners in roster order.
    pub fn partners(&self) -> &[Partner] {
        &self.partners
    }

    /// Computed geometry.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Configuration in use.
    pub fn config(&self) -> &ShanConfig {
        &self.config
    }

    /// Progress counters of the `(type_id, idx)` channel.
    #[track_caller]
    pub fn counters(&self, type_id: usize, idx: usize) -> ChannelCounters {
        self.check_channel(type_id, idx);
        self.counters[type_id][idx]
    }

    /// Node-local rank of global `rank`, if it shares this rank's node.
    pub fn local_rank_of(&self, rank: i32) -> Option<usize> {
        self.topology.local_rank_of(rank)
    }

    /// Node membership of the embedding communicator.
    pub fn node_map(&self) -> &NodeMap {
        &self.topology
    }
}

impl<C: Communicator, F: Fabric> Drop for Neighborhood<C, F> {
    fn drop(&mut self) {
        if self.phase != Phase::Freed {
            if let Err(err) = self.fabric.delete(self.segment_id()) {
                warn!(id = self.id, %err, "releasing fabric segment failed");
            }
        }
    }
}

/// Learn, for every partner, this rank's index in its roster and its roster
/// length.
fn negotiate<C: Communicator>(
    global: &C,
    partners: &[i32],
    config: &ShanConfig,
) -> Result<Vec<(usize, usize)>> {
    let me = global.rank();
    let rosters = if config.validate_roster || config.negotiation == Negotiation::AllGather {
        let rosters = Rosters::gather(global, partners)?;
        // Every rank checks every roster, so all ranks fail together.
        for rank in 0..global.size() {
            rosters.check_symmetric(rank)?;
        }
        Some(rosters)
    } else {
        None
    };

    let mut reciprocal = vec![(0usize, 0usize); partners.len()];
    match (config.negotiation, rosters) {
        (Negotiation::AllGather, Some(rosters)) => {
            for (slot, &p) in reciprocal.iter_mut().zip(partners) {
                let index = rosters
                    .index_of(p, me)
                    .ok_or(Error::AsymmetricRoster { rank: me, partner: p })?;
                *slot = (index, rosters.of(p).len());
            }
        }
        _ => {
            // Ascending partner order keeps pairwise exchanges acyclic.
            let mut order: Vec<usize> = (0..partners.len()).collect();
            order.sort_by_key(|&i| partners[i]);
            for i in order {
                let mut theirs = [0i32; 2];
                global.exchange(
                    &[i as i32, partners.len() as i32],
                    &mut theirs,
                    partners[i],
                    NEGOTIATION_TAG,
                )?;
                if theirs[0] < 0 || theirs[1] <= theirs[0] {
                    return Err(Error::InvalidRoster(format!(
                        "rank {} answered index {} of {}",
                        partners[i], theirs[0], theirs[1]
                    )));
                }
                reciprocal[i] = (theirs[0] as usize, theirs[1] as usize);
            }
        }
    }
    Ok(reciprocal)
}

/// Maximise every bound over the embedding communicator.
fn global_maxima<C: Communicator>(global: &C, bounds: &[TypeBounds]) -> Result<Vec<TypeBounds>> {
    let mut send: Vec<i64> = bounds.iter().map(|b| b.max_send_bytes).collect();
    let mut recv: Vec<i64> = bounds.iter().map(|b| b.max_recv_bytes).collect();
    let mut nsend: Vec<i32> = bounds.iter().map(|b| b.max_nelem_send).collect();
    let mut nrecv: Vec<i32> = bounds.iter().map(|b| b.max_nelem_recv).collect();
    global.allreduce_inplace(&mut send, ReduceOp::Max)?;
    global.allreduce_inplace(&mut recv, ReduceOp::Max)?;
    global.allreduce_inplace(&mut nsend, ReduceOp::Max)?;
    global.allreduce_inplace(&mut nrecv, ReduceOp::Max)?;
    Ok((0..bounds.len())
        .map(|t| TypeBounds {
            max_send_bytes: send[t],
            max_recv_bytes: recv[t],
            max_nelem_send: nsend[t],
            max_nelem_recv: nrecv[t],
        })
        .collect())
}

/// Allocate the private remote segment, bind it and open it to every remote
/// partner.
fn bind_remote<C: Communicator, F: Fabric>(
    id: i32,
    fabric: &F,
    global: &C,
    partners: &[Partner],
    layout: &Layout,
) -> Result<HeapRegion> {
    let max = fabric.segment_max();
    let segment = SegmentId::try_from(id)
        .ok()
        .filter(|&s| s < max)
        .ok_or(Error::SegmentLimit { id, max })?;
    if fabric.segment_list().contains(&segment) {
        return Err(Error::SegmentInUse(id));
    }
    let required = layout.required_notifications();
    if required > u64::from(fabric.notification_num()) {
        return Err(Error::NotificationLimit {
            required,
            available: fabric.notification_num(),
        });
    }

    let remote = HeapRegion::new_zeroed(layout.remote_size, page_size())?;
    // SAFETY: the segment is deleted before `remote` is dropped, either
    // below on failure or by the neighborhood's `free`/`Drop`.
    unsafe { fabric.bind(segment, remote.region()) }?;
    if let Err(err) = open_remote(segment, fabric, global, partners, required) {
        unbind(fabric, segment);
        return Err(err);
    }
    debug!(id, size = remote.len(), "bound remote segment");
    Ok(remote)
}

fn open_remote<C: Communicator, F: Fabric>(
    segment: SegmentId,
    fabric: &F,
    global: &C,
    partners: &[Partner],
    required: u64,
) -> Result<()> {
    global.barrier()?;
    for p in partners.iter().filter(|p| !p.is_local()) {
        fabric.connect(p.rank)?;
        fabric.register(segment, p.rank)?;
    }
    global.barrier()?;
    for nid in 0..required as u32 {
        fabric.notify_reset(segment, nid)?;
    }
    Ok(())
}

/// Delete a segment bound by a setup that failed later on.
fn unbind<F: Fabric>(fabric: &F, segment: SegmentId) {
    if let Err(err) = fabric.delete(segment) {
        warn!(segment, %err, "releasing fabric segment failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentBackend;
    use crate::threads::ThreadWorld;

    fn bounds() -> Vec<TypeBounds> {
        vec![TypeBounds {
            max_send_bytes: 24,
            max_recv_bytes: 24,
            max_nelem_send: 3,
            max_nelem_recv: 3,
        }]
    }

    fn heap() -> ShanConfig {
        ShanConfig::default().with_segment_backend(SegmentBackend::ProcessHeap)
    }

    #[test]
    fn partners_learn_reciprocal_indices() {
        for negotiation in [Negotiation::PointToPoint, Negotiation::AllGather] {
            let out = ThreadWorld::new(3, 3)
                .run(|rank| {
                    let me = rank.world.rank();
                    let node = rank.world.split_shared().unwrap();
                    // 0: [2, 1], 1: [0, 2], 2: [1, 0]
                    let roster = match me {
                        0 => vec![2, 1],
                        1 => vec![0, 2],
                        _ => vec![1, 0],
                    };
                    let nh = Neighborhood::init(
                        2,
                        &roster,
                        &bounds(),
                        &node,
                        &rank.world,
                        rank.fabric.clone(),
                        heap().with_negotiation(negotiation),
                    )
                    .unwrap();
                    let reciprocal: Vec<_> = nh
                        .partners()
                        .iter()
                        .map(|p| (p.remote_comm_index, p.remote_num_neighbors, p.is_local()))
                        .collect();
                    assert_eq!(nh.phase(), Phase::Ready);
                    nh.free().unwrap();
                    reciprocal
                })
                .unwrap();
            assert_eq!(out[0], vec![(1, 2, true), (0, 2, true)]);
            assert_eq!(out[1], vec![(1, 2, true), (0, 2, true)]);
            assert_eq!(out[2], vec![(1, 2, true), (0, 2, true)]);
        }
    }

    #[test]
    fn asymmetric_rosters_fail_on_every_rank() {
        let out = ThreadWorld::new(3, 1)
            .run(|rank| {
                let me = rank.world.rank();
                let node = rank.world.split_shared().unwrap();
                let roster = match me {
                    0 => vec![1, 2],
                    1 => vec![0],
                    _ => vec![1],
                };
                Neighborhood::init(0, &roster, &bounds(), &node, &rank.world, rank.fabric.clone(), heap())
                    .err()
                    .map(|e| matches!(e, Error::AsymmetricRoster { .. }))
            })
            .unwrap();
        assert_eq!(out, vec![Some(true); 3]);
    }

    #[test]
    fn fabric_limits_are_enforced() {
        let out = ThreadWorld::new(2, 1)
            .segment_max(4)
            .run(|rank| {
                let me = rank.world.rank();
                let node = rank.world.split_shared().unwrap();
                let limit = Neighborhood::init(4, &[1 - me], &bounds(), &node, &rank.world, rank.fabric.clone(), heap())
                    .err()
                    .map(|e| matches!(e, Error::SegmentLimit { id: 4, max: 4 }));
                rank.world.barrier().unwrap();
                let first = Neighborhood::init(1, &[1 - me], &bounds(), &node, &rank.world, rank.fabric.clone(), heap())
                    .unwrap();
                let in_use = Neighborhood::init(1, &[1 - me], &bounds(), &node, &rank.world, rank.fabric.clone(), heap())
                    .err()
                    .map(|e| matches!(e, Error::SegmentInUse(1)));
                rank.world.barrier().unwrap();
                first.free().unwrap();
                (limit, in_use)
            })
            .unwrap();
        assert_eq!(out, vec![(Some(true), Some(true)); 2]);
    }

    #[test]
    fn notification_budget_is_checked() {
        let out = ThreadWorld::new(2, 1)
            .notification_num(1)
            .run(|rank| {
                let me = rank.world.rank();
                let node = rank.world.split_shared().unwrap();
                Neighborhood::init(0, &[1 - me], &bounds(), &node, &rank.world, rank.fabric.clone(), heap())
                    .err()
                    .map(|e| matches!(e, Error::NotificationLimit { required: 2, available: 1 }))
            })
            .unwrap();
        assert_eq!(out, vec![Some(true); 2]);
    }

    #[test]
    fn invalid_partner_lists_are_rejected_locally() {
        let out = ThreadWorld::new(2, 2)
            .run(|rank| {
                let node = rank.world.split_shared().unwrap();
                let me = rank.world.rank();
                Neighborhood::init(0, &[me], &bounds(), &node, &rank.world, rank.fabric.clone(), heap())
                    .is_err()
            })
            .unwrap();
        assert_eq!(out, vec![true, true]);
    }
}
