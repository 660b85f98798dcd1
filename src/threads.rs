//! In-process backend: threads acting as ranks.
//!
//! A [`ThreadWorld`] runs one thread per rank and groups ranks into simulated
//! nodes. Ranks on the same node share memory through
//! [`SegmentBackend::ProcessHeap`] (or POSIX segments), ranks on different
//! nodes can only reach each other through the [`ThreadFabric`], exactly like
//! processes on different hosts. Collectives are rendezvous rounds guarded by
//! a mutex and condition variable.
//!
//! ```
//! use shan::{Communicator, ReduceOp, ThreadWorld};
//!
//! let maxima = ThreadWorld::new(4, 2)
//!     .run(|rank| {
//!         let mut v = [rank.world.rank()];
//!         rank.world.allreduce_inplace(&mut v, ReduceOp::Max).unwrap();
//!         v[0]
//!     })
//!     .unwrap();
//! assert_eq!(maxima, vec![3; 4]);
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::comm::Communicator;
use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, FabricError, NotificationId, SegmentId};
use crate::region::{self, HeapRegion, Region};
use crate::segment::{self, page_size, prefix_offsets, SegmentBackend, SegmentKind, SharedMapping};
use crate::ReduceOp;

/// Default number of notifications per bound segment.
pub const DEFAULT_NOTIFICATION_NUM: u32 = 65536;

/// Default number of segments a rank can bind.
pub const DEFAULT_SEGMENT_MAX: u32 = 32;

/// Default number of writes a queue accepts before it must be drained.
pub const DEFAULT_QUEUE_DEPTH: u32 = 1024;

// ============================================================================
// World
// ============================================================================

/// Layout of a simulated job: how many ranks, and which node each sits on.
#[derive(Debug, Clone)]
pub struct ThreadWorld {
    nodes: Vec<usize>,
    notification_num: u32,
    segment_max: u32,
    queue_depth: u32,
}

/// Handles given to each rank's thread.
pub struct ThreadRank {
    /// Communicator spanning all ranks.
    pub world: ThreadComm,
    /// The rank's endpoint on the in-process fabric.
    pub fabric: ThreadFabric,
}

impl ThreadWorld {
    /// `num_ranks` ranks, packed `ranks_per_node` to a node in rank order.
    pub fn new(num_ranks: usize, ranks_per_node: usize) -> Self {
        let per_node = ranks_per_node.max(1);
        Self::with_nodes((0..num_ranks).map(|r| r / per_node).collect())
    }

    /// Explicit node assignment: rank `r` sits on node `nodes[r]`.
    pub fn with_nodes(nodes: Vec<usize>) -> Self {
        Self {
            nodes,
            notification_num: DEFAULT_NOTIFICATION_NUM,
            segment_max: DEFAULT_SEGMENT_MAX,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Notifications per bound fabric segment.
    pub fn notification_num(mut self, n: u32) -> Self {
        self.notification_num = n;
        self
    }

    /// Segments each rank may bind on the fabric.
    pub fn segment_max(mut self, n: u32) -> Self {
        self.segment_max = n;
        self
    }

    /// Writes a fabric queue accepts before reporting it full.
    pub fn queue_depth(mut self, n: u32) -> Self {
        self.queue_depth = n.max(1);
        self
    }

    /// Number of ranks.
    pub fn num_ranks(&self) -> usize {
        self.nodes.len()
    }

    /// Run `f` once per rank, each on its own thread, and collect the
    /// results in rank order. A panic on any rank is re-raised here after
    /// all threads finished.
    pub fn run<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        F: Fn(ThreadRank) -> R + Sync,
        R: Send,
    {
        let shared = Arc::new(WorldShared::new(&self.nodes));
        let hub = Arc::new(Hub {
            state: Mutex::new(HubState::default()),
            notification_num: self.notification_num,
            segment_max: self.segment_max,
            queue_depth: self.queue_depth,
        });

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.nodes.len());
            for rank in 0..self.nodes.len() {
                let handle = ThreadRank {
                    world: ThreadComm {
                        shared: Arc::clone(&shared),
                        group: Arc::clone(&shared.world),
                        rank,
                    },
                    fabric: ThreadFabric {
                        hub: Arc::clone(&hub),
                        rank: rank as i32,
                        local: Arc::new(Mutex::new(LocalQueues::default())),
                    },
                };
                let f = &f;
                handles.push(
                    std::thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(scope, move || f(handle))?,
                );
            }

            let mut results = Vec::with_capacity(handles.len());
            let mut panic = None;
            for handle in handles {
                match handle.join() {
                    Ok(value) => results.push(value),
                    Err(payload) => {
                        panic.get_or_insert(payload);
                    }
                }
            }
            if let Some(payload) = panic {
                std::panic::resume_unwind(payload);
            }
            Ok(results)
        })
    }
}

struct WorldShared {
    node_of: Vec<usize>,
    world: Arc<Group>,
    nodes: HashMap<usize, Arc<Group>>,
    mailbox: Mailbox,
}

impl WorldShared {
    fn new(node_of: &[usize]) -> Self {
        let world = Arc::new(Group::new(0, (0..node_of.len()).collect()));
        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (rank, &node) in node_of.iter().enumerate() {
            members.entry(node).or_default().push(rank);
        }
        let nodes = members
            .into_iter()
            .enumerate()
            .map(|(i, (node, ranks))| (node, Arc::new(Group::new(i + 1, ranks))))
            .collect();
        Self {
            node_of: node_of.to_vec(),
            world,
            nodes,
            mailbox: Mailbox::default(),
        }
    }
}

// ============================================================================
// Collectives
// ============================================================================

struct Round {
    epoch: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    result: Arc<Vec<Vec<u8>>>,
}

struct Group {
    id: usize,
    /// World ranks of the members, ascending.
    members: Vec<usize>,
    round: Mutex<Round>,
    turn: Condvar,
}

impl Group {
    fn new(id: usize, members: Vec<usize>) -> Self {
        let n = members.len();
        Self {
            id,
            members,
            round: Mutex::new(Round {
                epoch: 0,
                arrived: 0,
                slots: vec![None; n],
                result: Arc::new(Vec::new()),
            }),
            turn: Condvar::new(),
        }
    }

    /// Contribute `data` and wait for every member's contribution.
    fn rendezvous(&self, rank: usize, data: Vec<u8>) -> Arc<Vec<Vec<u8>>> {
        let mut round = self.round.lock();
        round.slots[rank] = Some(data);
        round.arrived += 1;
        if round.arrived == self.members.len() {
            let gathered = round
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            round.result = Arc::new(gathered);
            round.arrived = 0;
            round.epoch += 1;
            self.turn.notify_all();
        } else {
            let epoch = round.epoch;
            while round.epoch == epoch {
                self.turn.wait(&mut round);
            }
        }
        Arc::clone(&round.result)
    }
}

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<(usize, usize, usize, i32), VecDeque<Vec<u8>>>>,
    delivered: Condvar,
}

fn decode<T: Datatype>(bytes: &[u8]) -> Vec<T> {
    let mut values = vec![T::zeroed(); bytes.len() / size_of::<T>()];
    bytemuck::cast_slice_mut(&mut values).copy_from_slice(bytes);
    values
}

/// Communicator over thread-ranks of a [`ThreadWorld`].
#[derive(Clone)]
pub struct ThreadComm {
    shared: Arc<WorldShared>,
    group: Arc<Group>,
    rank: usize,
}

impl ThreadComm {
    /// Rank of the calling thread in the whole world.
    pub fn world_rank(&self) -> usize {
        self.group.members[self.rank]
    }

    fn check_rank(&self, rank: i32) -> Result<usize> {
        if rank < 0 || rank as usize >= self.group.members.len() {
            Err(Error::InvalidRank(rank))
        } else {
            Ok(rank as usize)
        }
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> i32 {
        self.rank as i32
    }

    fn size(&self) -> i32 {
        self.group.members.len() as i32
    }

    fn barrier(&self) -> Result<()> {
        self.group.rendezvous(self.rank, Vec::new());
        Ok(())
    }

    fn broadcast<T: Datatype>(&self, data: &mut [T], root: i32) -> Result<()> {
        let root = self.check_rank(root)?;
        let mine = if self.rank == root {
            bytemuck::cast_slice(data).to_vec()
        } else {
            Vec::new()
        };
        let gathered = self.group.rendezvous(self.rank, mine);
        let out: &mut [u8] = bytemuck::cast_slice_mut(data);
        if gathered[root].len() != out.len() {
            return Err(Error::InvalidBuffer);
        }
        out.copy_from_slice(&gathered[root]);
        Ok(())
    }

    fn allgather<T: Datatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        let gathered = self
            .group
            .rendezvous(self.rank, bytemuck::cast_slice(send).to_vec());
        let chunk = send.len() * size_of::<T>();
        let out: &mut [u8] = bytemuck::cast_slice_mut(recv);
        if out.len() != chunk * gathered.len() {
            return Err(Error::InvalidBuffer);
        }
        for (r, bytes) in gathered.iter().enumerate() {
            if bytes.len() != chunk {
                return Err(Error::InvalidBuffer);
            }
            out[r * chunk..(r + 1) * chunk].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn allgatherv<T: Datatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[i32],
        displs: &[i32],
    ) -> Result<()> {
        let gathered = self
            .group
            .rendezvous(self.rank, bytemuck::cast_slice(send).to_vec());
        if counts.len() != gathered.len() || displs.len() != gathered.len() {
            return Err(Error::InvalidBuffer);
        }
        for (r, bytes) in gathered.iter().enumerate() {
            let count = counts[r] as usize;
            let start = displs[r] as usize;
            if bytes.len() != count * size_of::<T>() || start + count > recv.len() {
                return Err(Error::InvalidBuffer);
            }
            recv[start..start + count].copy_from_slice(&decode::<T>(bytes));
        }
        Ok(())
    }

    fn allreduce_inplace<T: Datatype>(&self, data: &mut [T], op: ReduceOp) -> Result<()> {
        let gathered = self
            .group
            .rendezvous(self.rank, bytemuck::cast_slice(data).to_vec());
        let mut acc: Vec<T> = decode(&gathered[0]);
        for bytes in &gathered[1..] {
            let values: Vec<T> = decode(bytes);
            if values.len() != acc.len() {
                return Err(Error::InvalidBuffer);
            }
            for (a, v) in acc.iter_mut().zip(values) {
                *a = T::reduce(*a, v, op);
            }
        }
        if acc.len() != data.len() {
            return Err(Error::InvalidBuffer);
        }
        data.copy_from_slice(&acc);
        Ok(())
    }

    fn send<T: Datatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        let dest = self.check_rank(dest)?;
        let mailbox = &self.shared.mailbox;
        mailbox
            .queues
            .lock()
            .entry((self.group.id, self.rank, dest, tag))
            .or_default()
            .push_back(bytemuck::cast_slice(data).to_vec());
        mailbox.delivered.notify_all();
        Ok(())
    }

    fn recv<T: Datatype>(&self, data: &mut [T], source: i32, tag: i32) -> Result<()> {
        let source = self.check_rank(source)?;
        let mailbox = &self.shared.mailbox;
        let key = (self.group.id, source, self.rank, tag);
        let mut queues = mailbox.queues.lock();
        let message = loop {
            if let Some(message) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
                break message;
            }
            mailbox.delivered.wait(&mut queues);
        };
        drop(queues);
        let out: &mut [u8] = bytemuck::cast_slice_mut(data);
        if message.len() != out.len() {
            return Err(Error::InvalidBuffer);
        }
        out.copy_from_slice(&message);
        Ok(())
    }

    fn split_shared(&self) -> Result<Self> {
        let world_rank = self.world_rank();
        let node = self.shared.node_of[world_rank];
        let group = self
            .shared
            .nodes
            .get(&node)
            .ok_or_else(|| Error::Internal(format!("node {node} has no group")))?;
        let rank = group
            .members
            .iter()
            .position(|&m| m == world_rank)
            .ok_or_else(|| Error::Internal(format!("rank {world_rank} missing from node {node}")))?;
        Ok(ThreadComm {
            shared: Arc::clone(&self.shared),
            group: Arc::clone(group),
            rank,
        })
    }

    fn map_shared(
        &self,
        kind: SegmentKind,
        id: i32,
        local_sizes: &[usize],
        backend: SegmentBackend,
    ) -> Result<Box<dyn SharedMapping>> {
        match backend {
            SegmentBackend::ProcessHeap => map_heap(self, local_sizes),
            SegmentBackend::Posix => segment::map_posix(self, kind, id, local_sizes),
            SegmentBackend::NativeWindow => Err(Error::NotSupported(
                "native shared windows need the `mpi` feature".into(),
            )),
        }
    }
}

// ============================================================================
// Process-heap segments
// ============================================================================

static HEAP_BLOCKS: Mutex<BTreeMap<i64, Arc<HeapRegion>>> = parking_lot::const_mutex(BTreeMap::new());
static NEXT_HEAP_BLOCK: AtomicI64 = AtomicI64::new(1);

struct HeapMapping {
    block: Option<Arc<HeapRegion>>,
    offsets: Vec<usize>,
}

impl SharedMapping for HeapMapping {
    fn base(&self, local_rank: usize) -> NonNull<u8> {
        match &self.block {
            Some(block) => {
                let region = block.region();
                NonNull::new(region.span(self.offsets[local_rank], 0))
                    .unwrap_or_else(|| unreachable!("heap blocks are non-null"))
            }
            None => panic!("segment used after detach"),
        }
    }

    fn detach(&mut self) -> Result<()> {
        self.block = None;
        Ok(())
    }
}

fn map_heap(comm: &ThreadComm, local_sizes: &[usize]) -> Result<Box<dyn SharedMapping>> {
    let mut token = [0i64];
    if comm.rank() == 0 {
        let block = Arc::new(HeapRegion::new_zeroed(local_sizes.iter().sum(), page_size())?);
        token[0] = NEXT_HEAP_BLOCK.fetch_add(1, Ordering::Relaxed);
        HEAP_BLOCKS.lock().insert(token[0], block);
    }
    comm.broadcast(&mut token, 0)?;
    let block = HEAP_BLOCKS
        .lock()
        .get(&token[0])
        .cloned()
        .ok_or_else(|| Error::Internal(format!("heap block {} vanished", token[0])))?;
    comm.barrier()?;
    if comm.rank() == 0 {
        HEAP_BLOCKS.lock().remove(&token[0]);
    }
    Ok(Box::new(HeapMapping {
        block: Some(block),
        offsets: prefix_offsets(local_sizes),
    }))
}

// ============================================================================
// Fabric
// ============================================================================

struct Bound {
    region: Region<'static>,
    notifications: Box<[AtomicU32]>,
}

#[derive(Default)]
struct HubState {
    bound: HashMap<(i32, SegmentId), Arc<Bound>>,
    connected: HashSet<(i32, i32)>,
    /// (owner, segment, peer allowed to write)
    registered: HashSet<(i32, SegmentId, i32)>,
}

struct Hub {
    state: Mutex<HubState>,
    notification_num: u32,
    segment_max: u32,
    queue_depth: u32,
}

#[derive(Default)]
struct LocalQueues {
    posted: HashMap<u32, u32>,
    bound: HashMap<SegmentId, Arc<Bound>>,
}

/// A rank's endpoint on the in-process fabric.
///
/// Writes copy directly into the target rank's bound region and then store
/// the notification value with release ordering.
#[derive(Clone)]
pub struct ThreadFabric {
    hub: Arc<Hub>,
    rank: i32,
    local: Arc<Mutex<LocalQueues>>,
}

impl ThreadFabric {
    fn own(&self, id: SegmentId) -> std::result::Result<Arc<Bound>, FabricError> {
        self.local
            .lock()
            .bound
            .get(&id)
            .cloned()
            .ok_or(FabricError::Unreachable {
                segment: id,
                rank: self.rank,
            })
    }

    fn check_nid(&self, nid: NotificationId) -> std::result::Result<usize, FabricError> {
        if nid < self.hub.notification_num {
            Ok(nid as usize)
        } else {
            Err(FabricError::OutOfBounds(format!(
                "notification {nid} >= {}",
                self.hub.notification_num
            )))
        }
    }
}

impl Fabric for ThreadFabric {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn segment_max(&self) -> u32 {
        self.hub.segment_max
    }

    fn notification_num(&self) -> u32 {
        self.hub.notification_num
    }

    fn segment_list(&self) -> Vec<SegmentId> {
        let mut ids: Vec<_> = self.local.lock().bound.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    unsafe fn bind(&self, id: SegmentId, region: Region<'_>) -> std::result::Result<(), FabricError> {
        if id >= self.hub.segment_max {
            return Err(FabricError::OutOfBounds(format!(
                "segment {id} >= {}",
                self.hub.segment_max
            )));
        }
        let bound = Arc::new(Bound {
            // SAFETY: the caller keeps the memory valid until `delete`.
            region: unsafe { region.extend() },
            notifications: (0..self.hub.notification_num)
                .map(|_| AtomicU32::new(0))
                .collect(),
        });
        let mut state = self.hub.state.lock();
        if state.bound.contains_key(&(self.rank, id)) {
            return Err(FabricError::Failed(format!("segment {id} already bound")));
        }
        state.bound.insert((self.rank, id), Arc::clone(&bound));
        self.local.lock().bound.insert(id, bound);
        Ok(())
    }

    fn connect(&self, rank: i32) -> std::result::Result<(), FabricError> {
        self.hub.state.lock().connected.insert((self.rank, rank));
        Ok(())
    }

    fn register(&self, id: SegmentId, rank: i32) -> std::result::Result<(), FabricError> {
        let mut state = self.hub.state.lock();
        if !state.bound.contains_key(&(self.rank, id)) {
            return Err(FabricError::Unreachable {
                segment: id,
                rank: self.rank,
            });
        }
        state.registered.insert((self.rank, id, rank));
        Ok(())
    }

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
    ) -> std::result::Result<(), FabricError> {
        let nid = self.check_nid(nid)?;
        {
            let local = self.local.lock();
            if local.posted.get(&queue).copied().unwrap_or(0) >= self.hub.queue_depth {
                return Err(FabricError::QueueFull);
            }
        }
        let source = self.own(id)?;
        let target = {
            let state = self.hub.state.lock();
            let connected = state.connected.contains(&(self.rank, rank))
                || state.connected.contains(&(rank, self.rank));
            if !connected || !state.registered.contains(&(rank, id, self.rank)) {
                return Err(FabricError::Unreachable { segment: id, rank });
            }
            state
                .bound
                .get(&(rank, id))
                .cloned()
                .ok_or(FabricError::Unreachable { segment: id, rank })?
        };
        if local_offset + size > source.region.len() || remote_offset + size > target.region.len()
        {
            return Err(FabricError::OutOfBounds(format!(
                "write of {size} bytes from {local_offset} to {remote_offset}"
            )));
        }

        region::copy(&source.region, local_offset, &target.region, remote_offset, size);
        target.notifications[nid].store(value, Ordering::Release);
        trace!(from = self.rank, to = rank, segment = id, nid, size, "notified write");

        *self.local.lock().posted.entry(queue).or_insert(0) += 1;
        Ok(())
    }

    fn wait(&self, queue: u32) -> std::result::Result<(), FabricError> {
        self.local.lock().posted.insert(queue, 0);
        Ok(())
    }

    fn notify_test(&self, id: SegmentId, nid: NotificationId) -> std::result::Result<bool, FabricError> {
        let nid = self.check_nid(nid)?;
        Ok(self.own(id)?.notifications[nid].load(Ordering::Acquire) != 0)
    }

    fn notify_reset(&self, id: SegmentId, nid: NotificationId) -> std::result::Result<u32, FabricError> {
        let nid = self.check_nid(nid)?;
        Ok(self.own(id)?.notifications[nid].swap(0, Ordering::AcqRel))
    }

    fn delete(&self, id: SegmentId) -> std::result::Result<(), FabricError> {
        let removed = self.local.lock().bound.remove(&id);
        let mut state = self.hub.state.lock();
        state.bound.remove(&(self.rank, id));
        let rank = self.rank;
        state
            .registered
            .retain(|&(owner, segment, _)| !(owner == rank && segment == id));
        match removed {
            Some(_) => Ok(()),
            None => Err(FabricError::Unreachable { segment: id, rank }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::write_notify_and_wait;
    use crate::wait::BackoffPolicy;

    #[test]
    fn collectives_agree_across_ranks() {
        let out = ThreadWorld::new(3, 3)
            .run(|rank| {
                let w = &rank.world;
                let mut root = [0i64; 2];
                if w.rank() == 1 {
                    root = [7, 8];
                }
                w.broadcast(&mut root, 1).unwrap();

                let mut all = [0.0f64; 3];
                w.allgather(&[f64::from(w.rank()) * 0.5], &mut all).unwrap();

                let (counts, flat) = w
                    .allgather_varcount(&vec![w.rank() as u8; w.rank() as usize])
                    .unwrap();

                let mut sum = [w.rank() + 1];
                w.allreduce_inplace(&mut sum, ReduceOp::Sum).unwrap();
                (root, all, counts, flat, sum[0])
            })
            .unwrap();
        for (root, all, counts, flat, sum) in out {
            assert_eq!(root, [7, 8]);
            assert_eq!(all, [0.0, 0.5, 1.0]);
            assert_eq!(counts, vec![0, 1, 2]);
            assert_eq!(flat, vec![1, 2, 2]);
            assert_eq!(sum, 6);
        }
    }

    #[test]
    fn exchange_swaps_between_pairs() {
        let out = ThreadWorld::new(4, 1)
            .run(|rank| {
                let w = &rank.world;
                let partner = w.rank() ^ 1;
                let mut got = [0i32; 2];
                w.exchange(&[w.rank(), 10 * w.rank()], &mut got, partner, 4710)
                    .unwrap();
                got
            })
            .unwrap();
        assert_eq!(out, vec![[1, 10], [0, 0], [3, 30], [2, 20]]);
    }

    #[test]
    fn split_shared_follows_node_assignment() {
        let out = ThreadWorld::with_nodes(vec![1, 0, 1, 0, 1])
            .run(|rank| {
                let node = rank.world.split_shared().unwrap();
                let me = node.world_rank() as u64;
                let mut members = vec![0u64; node.size() as usize];
                node.allgather(&[me], &mut members).unwrap();
                (node.rank(), members)
            })
            .unwrap();
        assert_eq!(out[0], (0, vec![0, 2, 4]));
        assert_eq!(out[3], (1, vec![1, 3]));
        assert_eq!(out[4], (2, vec![0, 2, 4]));
    }

    #[test]
    fn writes_need_registration() {
        ThreadWorld::new(2, 1)
            .run(|rank| {
                let heap = HeapRegion::new_zeroed(256, 64).unwrap();
                let fabric = &rank.fabric;
                let peer = 1 - fabric.rank();
                // SAFETY: heap outlives the delete at the end of the closure.
                unsafe { fabric.bind(3, heap.region()) }.unwrap();
                fabric.connect(peer).unwrap();
                rank.world.barrier().unwrap();
                assert_eq!(
                    fabric.write_notify(3, 0, peer, 0, 8, 0, 1, 0),
                    Err(FabricError::Unreachable {
                        segment: 3,
                        rank: peer
                    })
                );
                rank.world.barrier().unwrap();
                fabric.delete(3).unwrap();
            })
            .unwrap();
    }

    #[test]
    fn notified_write_lands_and_full_queue_is_drained() {
        ThreadWorld::new(2, 1)
            .queue_depth(1)
            .run(|rank| {
                let heap = HeapRegion::new_zeroed(256, 64).unwrap();
                let fabric = &rank.fabric;
                let peer = 1 - fabric.rank();
                // SAFETY: heap outlives the delete at the end of the closure.
                unsafe { fabric.bind(0, heap.region()) }.unwrap();
                rank.world.barrier().unwrap();
                fabric.connect(peer).unwrap();
                fabric.register(0, peer).unwrap();
                rank.world.barrier().unwrap();

                if fabric.rank() == 0 {
                    heap.region().write_bytes(0, b"one-sided");
                    fabric.write_notify(0, 0, 1, 64, 9, 5, 1, 0).unwrap();
                    assert_eq!(
                        fabric.write_notify(0, 0, 1, 128, 9, 6, 1, 0),
                        Err(FabricError::QueueFull)
                    );
                    write_notify_and_wait(fabric, 0, 0, 1, 128, 9, 6, 1, 0, BackoffPolicy::Pause)
                        .unwrap();
                } else {
                    while !fabric.notify_test(0, 6).unwrap() {
                        std::thread::yield_now();
                    }
                    assert!(fabric.notify_test(0, 5).unwrap());
                    assert_eq!(fabric.notify_reset(0, 6).unwrap(), 1);
                    assert!(!fabric.notify_test(0, 6).unwrap());
                    let mut buf = [0u8; 9];
                    heap.region().read_bytes(128, &mut buf);
                    assert_eq!(&buf, b"one-sided");
                }
                rank.world.barrier().unwrap();
                assert_eq!(fabric.segment_list(), vec![0]);
                fabric.delete(0).unwrap();
                assert!(fabric.segment_list().is_empty());
            })
            .unwrap();
    }

    #[test]
    fn panics_propagate_from_ranks() {
        let result = std::panic::catch_unwind(|| {
            ThreadWorld::new(2, 2).run(|rank| {
                if rank.world.rank() == 1 {
                    panic!("rank 1 failed");
                }
            })
        });
        assert!(result.is_err());
    }
}
