//! MPI backend (feature `mpi`).
//!
//! - [`Mpi`] owns the MPI environment.
//! - [`MpiComm`] implements [`Communicator`] over the C shim and maps
//!   [`SegmentBackend::NativeWindow`] segments with `MPI_Win_allocate_shared`.
//! - [`RmaFabric`] implements [`Fabric`] with one data window and one
//!   notification window per bound segment, both kept in a passive-target
//!   epoch for their whole lifetime.
//!
//! ```no_run
//! use shan::{Communicator, Mpi, RmaFabric};
//!
//! let mpi = Mpi::init().unwrap();
//! let world = mpi.world();
//! let node = world.split_shared().unwrap();
//! let fabric = RmaFabric::new(&world);
//! println!("rank {} of {}, {} on this node", world.rank(), world.size(), node.size());
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::comm::Communicator;
use crate::datatype::Datatype;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, FabricError, NotificationId, SegmentId};
use crate::ffi;
use crate::region::Region;
use crate::segment::{self, SegmentBackend, SegmentKind, SharedMapping};
use crate::ReduceOp;

/// Global flag tracking whether MPI has been initialized
static MPI_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// MPI thread support levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ThreadLevel {
    /// Only single-threaded execution
    Single = 0,
    /// Multi-threaded, but MPI calls only from main thread
    Funneled = 1,
    /// Multi-threaded, but MPI calls serialized by user
    Serialized = 2,
    /// Full multi-threaded support
    Multiple = 3,
}

/// MPI environment handle.
///
/// Only one instance can exist at a time. Dropping it finalizes MPI, so
/// every communicator, segment, fabric and neighborhood must be released
/// first.
pub struct Mpi {
    thread_level: ThreadLevel,
    _marker: PhantomData<*const ()>,
}

impl Mpi {
    /// Initialize MPI with single-threaded support.
    pub fn init() -> Result<Self> {
        Self::init_thread(ThreadLevel::Single)
    }

    /// Initialize MPI requesting `required` thread support.
    pub fn init_thread(required: ThreadLevel) -> Result<Self> {
        if MPI_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }
        let mut provided = 0;
        // SAFETY: out-pointer is valid for the duration of the call.
        let ret = unsafe { ffi::shan_mpi_init_thread(required as i32, &mut provided) };
        if ret != 0 {
            MPI_INITIALIZED.store(false, Ordering::SeqCst);
            return Err(Error::MpiError(ret));
        }
        let thread_level = match provided {
            0 => ThreadLevel::Single,
            1 => ThreadLevel::Funneled,
            2 => ThreadLevel::Serialized,
            _ => ThreadLevel::Multiple,
        };
        debug!(?required, ?thread_level, "initialized MPI");
        Ok(Mpi {
            thread_level,
            _marker: PhantomData,
        })
    }

    /// Thread support level provided by the library.
    pub fn thread_level(&self) -> ThreadLevel {
        self.thread_level
    }

    /// `MPI_COMM_WORLD`.
    pub fn world(&self) -> MpiComm {
        // SAFETY: the world handle is always valid after init.
        MpiComm::from_handle(unsafe { ffi::shan_mpi_comm_world() }, false)
    }

    /// Wall-clock time in seconds.
    pub fn wtime() -> f64 {
        // SAFETY: no preconditions.
        unsafe { ffi::shan_mpi_wtime() }
    }

    /// Check if MPI has been initialized.
    pub fn is_initialized() -> bool {
        let mut flag = 0;
        // SAFETY: out-pointer is valid.
        unsafe { ffi::shan_mpi_initialized(&mut flag) };
        flag != 0
    }

    /// Check if MPI has been finalized.
    pub fn is_finalized() -> bool {
        let mut flag = 0;
        // SAFETY: out-pointer is valid.
        unsafe { ffi::shan_mpi_finalized(&mut flag) };
        flag != 0
    }
}

impl Drop for Mpi {
    fn drop(&mut self) {
        if MPI_INITIALIZED.swap(false, Ordering::SeqCst) {
            // SAFETY: initialized by this instance and not finalized yet.
            unsafe { ffi::shan_mpi_finalize() };
        }
    }
}

// ============================================================================
// Communicators
// ============================================================================

struct CommHandle {
    handle: i32,
    owned: bool,
}

impl Drop for CommHandle {
    fn drop(&mut self) {
        if self.owned && !Mpi::is_finalized() {
            // SAFETY: the handle came from split_shared and is freed once,
            // when the last clone goes away.
            unsafe { ffi::shan_mpi_comm_free(self.handle) };
        }
    }
}

/// An MPI communicator.
///
/// Clones share the underlying handle, which is freed with the last clone.
#[derive(Clone)]
pub struct MpiComm {
    inner: Rc<CommHandle>,
}

impl MpiComm {
    fn from_handle(handle: i32, owned: bool) -> Self {
        MpiComm {
            inner: Rc::new(CommHandle { handle, owned }),
        }
    }

    /// Raw handle into the C layer's communicator table.
    pub fn raw_handle(&self) -> i32 {
        self.inner.handle
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> i32 {
        let mut rank = 0;
        // SAFETY: valid handle and out-pointer.
        unsafe { ffi::shan_mpi_comm_rank(self.raw_handle(), &mut rank) };
        rank
    }

    fn size(&self) -> i32 {
        let mut size = 0;
        // SAFETY: valid handle and out-pointer.
        unsafe { ffi::shan_mpi_comm_size(self.raw_handle(), &mut size) };
        size
    }

    fn barrier(&self) -> Result<()> {
        // SAFETY: valid handle.
        Error::check(unsafe { ffi::shan_mpi_barrier(self.raw_handle()) })
    }

    fn broadcast<T: Datatype>(&self, data: &mut [T], root: i32) -> Result<()> {
        // SAFETY: buffer is valid for data.len() elements of T::TAG.
        Error::check(unsafe {
            ffi::shan_mpi_bcast(
                data.as_mut_ptr().cast(),
                data.len() as i64,
                T::TAG as i32,
                root,
                self.raw_handle(),
            )
        })
    }

    fn allgather<T: Datatype>(&self, send: &[T], recv: &mut [T]) -> Result<()> {
        if recv.len() != send.len() * self.size() as usize {
            return Err(Error::InvalidBuffer);
        }
        // SAFETY: recv holds size * send.len() elements.
        Error::check(unsafe {
            ffi::shan_mpi_allgather(
                send.as_ptr().cast(),
                send.len() as i64,
                recv.as_mut_ptr().cast(),
                T::TAG as i32,
                self.raw_handle(),
            )
        })
    }

    fn allgatherv<T: Datatype>(
        &self,
        send: &[T],
        recv: &mut [T],
        counts: &[i32],
        displs: &[i32],
    ) -> Result<()> {
        let size = self.size() as usize;
        if counts.len() != size || displs.len() != size {
            return Err(Error::InvalidBuffer);
        }
        let fits = counts
            .iter()
            .zip(displs)
            .all(|(&c, &d)| c >= 0 && d >= 0 && (c + d) as usize <= recv.len());
        if !fits {
            return Err(Error::InvalidBuffer);
        }
        // SAFETY: every (count, displ) range lies inside recv.
        Error::check(unsafe {
            ffi::shan_mpi_allgatherv(
                send.as_ptr().cast(),
                send.len() as i64,
                recv.as_mut_ptr().cast(),
                counts.as_ptr(),
                displs.as_ptr(),
                T::TAG as i32,
                self.raw_handle(),
            )
        })
    }

    fn allreduce_inplace<T: Datatype>(&self, data: &mut [T], op: ReduceOp) -> Result<()> {
        // SAFETY: buffer is valid for data.len() elements.
        Error::check(unsafe {
            ffi::shan_mpi_allreduce_inplace(
                data.as_mut_ptr().cast(),
                data.len() as i64,
                T::TAG as i32,
                op as i32,
                self.raw_handle(),
            )
        })
    }

    fn send<T: Datatype>(&self, data: &[T], dest: i32, tag: i32) -> Result<()> {
        // SAFETY: buffer is valid for data.len() elements.
        Error::check(unsafe {
            ffi::shan_mpi_send(
                data.as_ptr().cast(),
                data.len() as i64,
                T::TAG as i32,
                dest,
                tag,
                self.raw_handle(),
            )
        })
    }

    fn recv<T: Datatype>(&self, data: &mut [T], source: i32, tag: i32) -> Result<()> {
        // SAFETY: buffer is valid for data.len() elements.
        Error::check(unsafe {
            ffi::shan_mpi_recv(
                data.as_mut_ptr().cast(),
                data.len() as i64,
                T::TAG as i32,
                source,
                tag,
                self.raw_handle(),
            )
        })
    }

    fn split_shared(&self) -> Result<Self> {
        let mut handle = 0;
        // SAFETY: valid handle and out-pointer.
        Error::check(unsafe { ffi::shan_mpi_comm_split_shared(self.raw_handle(), &mut handle) })?;
        Ok(MpiComm::from_handle(handle, true))
    }

    fn map_shared(
        &self,
        kind: SegmentKind,
        id: i32,
        local_sizes: &[usize],
        backend: SegmentBackend,
    ) -> Result<Box<dyn SharedMapping>> {
        match backend {
            SegmentBackend::NativeWindow => map_window(self, local_sizes),
            SegmentBackend::Posix => segment::map_posix(self, kind, id, local_sizes),
            SegmentBackend::ProcessHeap => Err(Error::NotSupported(
                "process-heap segments between MPI processes".into(),
            )),
        }
    }
}

// ============================================================================
// Native shared windows
// ============================================================================

struct WindowMapping {
    win: Option<i32>,
    bases: Vec<NonNull<u8>>,
}

fn map_window(comm: &MpiComm, local_sizes: &[usize]) -> Result<Box<dyn SharedMapping>> {
    let me = comm.rank() as usize;
    let mut base: *mut std::ffi::c_void = ptr::null_mut();
    let mut win = 0;
    // SAFETY: out-pointers are valid; the window is owned by the mapping
    // built right below.
    Error::check(unsafe {
        ffi::shan_mpi_win_allocate_shared(local_sizes[me] as i64, comm.raw_handle(), &mut base, &mut win)
    })?;
    let mut mapping = WindowMapping {
        win: Some(win),
        bases: Vec::with_capacity(local_sizes.len()),
    };
    for rank in 0..local_sizes.len() {
        let mut size = 0i64;
        let mut peer: *mut std::ffi::c_void = ptr::null_mut();
        // SAFETY: window is live; out-pointers are valid.
        Error::check(unsafe { ffi::shan_mpi_win_shared_query(win, rank as i32, &mut size, &mut peer) })?;
        if (size as usize) < local_sizes[rank] {
            return Err(Error::Internal(format!(
                "shared window part of rank {rank} has {size} bytes, expected {}",
                local_sizes[rank]
            )));
        }
        // Zero-sized parts may report a null base.
        mapping
            .bases
            .push(NonNull::new(peer.cast::<u8>()).unwrap_or(NonNull::dangling()));
    }
    Ok(Box::new(mapping))
}

impl SharedMapping for WindowMapping {
    fn base(&self, local_rank: usize) -> NonNull<u8> {
        assert!(self.win.is_some(), "segment used after detach");
        self.bases[local_rank]
    }

    fn detach(&mut self) -> Result<()> {
        match self.win.take() {
            // SAFETY: collective free of a live window, once.
            Some(win) => Error::check(unsafe { ffi::shan_mpi_win_free(win) }),
            None => Ok(()),
        }
    }
}

impl Drop for WindowMapping {
    fn drop(&mut self) {
        // MPI_Win_free is collective: every rank must drop the segment.
        if let Err(err) = self.detach() {
            warn!(%err, "freeing shared window failed");
        }
    }
}

// ============================================================================
// MPI-RMA fabric
// ============================================================================

/// Default number of notifications per bound segment.
const RMA_NOTIFICATION_NUM: u32 = 65536;
/// Default number of simultaneously bound segments.
const RMA_SEGMENT_MAX: u32 = 32;
/// Default number of writes a queue holds before reporting full.
const RMA_QUEUE_DEPTH: u32 = 1024;

struct RmaSegment {
    region: Region<'static>,
    data_win: i32,
    notify_win: i32,
    sizes: Vec<i64>,
}

#[derive(Default)]
struct RmaState {
    segments: BTreeMap<SegmentId, RmaSegment>,
    posted: HashMap<u32, u32>,
}

fn rma(code: i32) -> std::result::Result<(), FabricError> {
    if code == 0 {
        Ok(())
    } else {
        Err(FabricError::Failed(format!("MPI error code {code}")))
    }
}

/// [`Fabric`] over MPI one-sided communication.
///
/// `bind` and `delete` are collective over the communicator the fabric was
/// created with, and fabric ranks are ranks of that communicator.
#[derive(Clone)]
pub struct RmaFabric {
    comm: MpiComm,
    rank: i32,
    size: i32,
    notification_num: u32,
    segment_max: u32,
    queue_depth: u32,
    state: Rc<RefCell<RmaState>>,
}

impl RmaFabric {
    /// A fabric spanning `comm`.
    pub fn new(comm: &MpiComm) -> Self {
        RmaFabric {
            comm: comm.clone(),
            rank: comm.rank(),
            size: comm.size(),
            notification_num: RMA_NOTIFICATION_NUM,
            segment_max: RMA_SEGMENT_MAX,
            queue_depth: RMA_QUEUE_DEPTH,
            state: Rc::new(RefCell::new(RmaState::default())),
        }
    }

    /// Set the notifications allocated per segment.
    pub fn with_notification_num(mut self, n: u32) -> Self {
        self.notification_num = n;
        self
    }

    /// Set the segment limit.
    pub fn with_segment_max(mut self, n: u32) -> Self {
        self.segment_max = n;
        self
    }

    /// Set the queue depth.
    pub fn with_queue_depth(mut self, n: u32) -> Self {
        self.queue_depth = n;
        self
    }

    fn windows(&self, id: SegmentId) -> std::result::Result<(i32, i32), FabricError> {
        self.state
            .borrow()
            .segments
            .get(&id)
            .map(|s| (s.data_win, s.notify_win))
            .ok_or(FabricError::Unreachable {
                segment: id,
                rank: self.rank,
            })
    }

    fn check_nid(&self, nid: NotificationId) -> std::result::Result<(), FabricError> {
        if nid < self.notification_num {
            Ok(())
        } else {
            Err(FabricError::OutOfBounds(format!(
                "notification {nid} of {}",
                self.notification_num
            )))
        }
    }
}

impl Fabric for RmaFabric {
    fn rank(&self) -> i32 {
        self.rank
    }

    fn segment_max(&self) -> u32 {
        self.segment_max
    }

    fn notification_num(&self) -> u32 {
        self.notification_num
    }

    fn segment_list(&self) -> Vec<SegmentId> {
        self.state.borrow().segments.keys().copied().collect()
    }

    unsafe fn bind(&self, id: SegmentId, region: Region<'_>) -> std::result::Result<(), FabricError> {
        if self.state.borrow().segments.contains_key(&id) {
            return Err(FabricError::Failed(format!("segment {id} already bound")));
        }
        let handle = self.comm.raw_handle();
        let mut data_win = 0;
        // SAFETY: the region stays valid until delete, per the trait contract.
        rma(unsafe {
            ffi::shan_mpi_win_create(region.as_ptr().cast(), region.len() as i64, handle, &mut data_win)
        })?;
        let mut base: *mut std::ffi::c_void = ptr::null_mut();
        let mut notify_win = 0;
        // SAFETY: out-pointers are valid.
        rma(unsafe {
            ffi::shan_mpi_win_allocate_u32(i64::from(self.notification_num), handle, &mut base, &mut notify_win)
        })?;
        let mut sizes = vec![0i64; self.size as usize];
        self.comm
            .allgather(&[region.len() as i64], &mut sizes)
            .map_err(|e| FabricError::Failed(e.to_string()))?;
        self.state.borrow_mut().segments.insert(
            id,
            RmaSegment {
                // SAFETY: the caller keeps the memory valid until `delete`.
                region: unsafe { region.extend() },
                data_win,
                notify_win,
                sizes,
            },
        );
        debug!(id, len = region.len(), "bound RMA segment");
        Ok(())
    }

    fn connect(&self, rank: i32) -> std::result::Result<(), FabricError> {
        if (0..self.size).contains(&rank) {
            Ok(())
        } else {
            Err(FabricError::Unreachable { segment: 0, rank })
        }
    }

    fn register(&self, id: SegmentId, rank: i32) -> std::result::Result<(), FabricError> {
        // Every rank of the communicator can reach a bound window.
        self.connect(rank)?;
        self.windows(id).map(|_| ())
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
        self.check_nid(nid)?;
        self.connect(rank)?;
        let mut state = self.state.borrow_mut();
        if state.posted.get(&queue).copied().unwrap_or(0) >= self.queue_depth {
            return Err(FabricError::QueueFull);
        }
        let segment = state.segments.get(&id).ok_or(FabricError::Unreachable {
            segment: id,
            rank: self.rank,
        })?;
        let remote_len = segment.sizes[rank as usize];
        if (remote_offset + size) as i64 > remote_len || local_offset + size > segment.region.len() {
            return Err(FabricError::OutOfBounds(format!(
                "{size} bytes from {local_offset} to {remote_offset} of rank {rank} ({remote_len} bytes)"
            )));
        }
        let origin = segment.region.span(local_offset, size);
        let (data_win, notify_win) = (segment.data_win, segment.notify_win);
        // SAFETY: origin covers size bytes of the bound region; the target
        // range was checked against the partner's window size.
        unsafe {
            rma(ffi::shan_mpi_put(origin.cast(), size as i64, rank, remote_offset as i64, data_win))?;
            rma(ffi::shan_mpi_win_flush(rank, data_win))?;
            rma(ffi::shan_mpi_notify(value, rank, i64::from(nid), notify_win))?;
        }
        *state.posted.entry(queue).or_insert(0) += 1;
        Ok(())
    }

    fn wait(&self, queue: u32) -> std::result::Result<(), FabricError> {
        let mut state = self.state.borrow_mut();
        if state.posted.remove(&queue).is_some() {
            for segment in state.segments.values() {
                // SAFETY: live window.
                rma(unsafe { ffi::shan_mpi_win_flush_all(segment.notify_win) })?;
            }
        }
        Ok(())
    }

    fn notify_test(&self, id: SegmentId, nid: NotificationId) -> std::result::Result<bool, FabricError> {
        self.check_nid(nid)?;
        let (data_win, notify_win) = self.windows(id)?;
        let mut value = 0u32;
        // SAFETY: live windows, own rank, checked index.
        unsafe {
            rma(ffi::shan_mpi_notify_fetch(notify_win, self.rank, i64::from(nid), &mut value))?;
            if value != 0 {
                rma(ffi::shan_mpi_win_sync(data_win))?;
            }
        }
        Ok(value != 0)
    }

    fn notify_reset(&self, id: SegmentId, nid: NotificationId) -> std::result::Result<u32, FabricError> {
        self.check_nid(nid)?;
        let (data_win, notify_win) = self.windows(id)?;
        let mut old = 0u32;
        // SAFETY: live windows, own rank, checked index.
        unsafe {
            rma(ffi::shan_mpi_notify_swap(notify_win, self.rank, i64::from(nid), 0, &mut old))?;
            rma(ffi::shan_mpi_win_sync(data_win))?;
        }
        Ok(old)
    }

    fn delete(&self, id: SegmentId) -> std::result::Result<(), FabricError> {
        let segment = self
            .state
            .borrow_mut()
            .segments
            .remove(&id)
            .ok_or(FabricError::Unreachable {
                segment: id,
                rank: self.rank,
            })?;
        // SAFETY: collective free of live windows, once.
        unsafe {
            rma(ffi::shan_mpi_win_free(segment.data_win))?;
            rma(ffi::shan_mpi_win_free(segment.notify_win))?;
        }
        Ok(())
    }
}
