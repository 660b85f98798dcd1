//! Node-local shared segments.
//!
//! A [`Segment`] is one contiguous mapping visible to every rank of a
//! node-local communicator. Rank `r` owns `local_size(r)` bytes (its
//! requested size rounded up to a page) starting at `get_ptr(r)`; all ranks
//! agree on the whole layout because the sizes are exchanged collectively
//! before mapping.
//!
//! The backing facility is pluggable through [`SharedMapping`]:
//!
//! - [`SegmentBackend::Posix`]: a POSIX shared-memory object created and
//!   truncated by local rank 0, then opened and mapped by everyone.
//! - [`SegmentBackend::NativeWindow`]: an MPI shared window (feature `mpi`).
//! - [`SegmentBackend::ProcessHeap`]: one heap block shared by threads acting
//!   as ranks ([`ThreadComm`](crate::ThreadComm) only).

use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI64, Ordering};

use bytemuck::Pod;
use tracing::{debug, info, warn};

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::layout::align_up;
use crate::region::Region;
use crate::ReduceOp;

/// What a segment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SegmentKind {
    /// User data exchanged between partners.
    Data = 0,
    /// Per-type metadata of a neighborhood.
    Type = 1,
}

/// Facility used to share memory between the ranks of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentBackend {
    /// POSIX shared-memory object plus `mmap`.
    Posix,
    /// Native MPI shared window.
    NativeWindow,
    /// Heap block shared by threads of one process.
    ProcessHeap,
}

/// A node-wide mapping produced by [`Communicator::map_shared`].
pub trait SharedMapping {
    /// Base address of local rank `local_rank`'s part.
    fn base(&self, local_rank: usize) -> NonNull<u8>;

    /// Release this rank's view. Called once on every rank, between barriers.
    fn detach(&mut self) -> Result<()>;

    /// Remove the node-wide backing object. Called on local rank 0 after
    /// every rank detached.
    fn unlink(&mut self) -> Result<()> {
        Ok(())
    }
}

/// System page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Start offsets of each local rank's part.
pub(crate) fn prefix_offsets(local_sizes: &[usize]) -> Vec<usize> {
    local_sizes
        .iter()
        .scan(0usize, |acc, &len| {
            let start = *acc;
            *acc += len;
            Some(start)
        })
        .collect()
}

// ============================================================================
// POSIX shared memory
// ============================================================================

static POSIX_SEQUENCE: AtomicI64 = AtomicI64::new(0);

struct PosixMapping {
    name: CString,
    base: NonNull<u8>,
    len: usize,
    offsets: Vec<usize>,
    owner: bool,
    mapped: bool,
    linked: bool,
}

impl SharedMapping for PosixMapping {
    fn base(&self, local_rank: usize) -> NonNull<u8> {
        assert!(self.mapped, "segment used after detach");
        // SAFETY: offsets are within the mapping of len bytes.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.offsets[local_rank])) }
    }

    fn detach(&mut self) -> Result<()> {
        if self.mapped {
            self.mapped = false;
            // SAFETY: base/len describe a live mapping created by mmap.
            let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    fn unlink(&mut self) -> Result<()> {
        if self.linked {
            self.linked = false;
            // SAFETY: name is a valid C string.
            if unsafe { libc::shm_unlink(self.name.as_ptr()) } != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

impl Drop for PosixMapping {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            warn!(name = ?self.name, %err, "munmap failed");
        }
        if self.owner {
            if let Err(err) = self.unlink() {
                warn!(name = ?self.name, %err, "shm_unlink failed");
            }
        }
    }
}

fn shm_open(name: &CString, flags: libc::c_int) -> Result<libc::c_int> {
    // SAFETY: name is a valid C string.
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::mode_t) };
    if fd < 0 {
        Err(std::io::Error::last_os_error().into())
    } else {
        Ok(fd)
    }
}

/// Create and size the object. Only local rank 0 calls this.
fn create_posix(name: &CString, len: usize) -> Result<()> {
    let size = libc::off_t::try_from(len).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{len} bytes exceed the shared-memory object limit"),
        )
    })?;
    let fd = shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;
    // SAFETY: fd is an open shared-memory object.
    let failed = (unsafe { libc::ftruncate(fd, size) } != 0).then(std::io::Error::last_os_error);
    // SAFETY: fd is open.
    unsafe { libc::close(fd) };
    if let Some(err) = failed {
        // SAFETY: name was created above.
        unsafe { libc::shm_unlink(name.as_ptr()) };
        return Err(err.into());
    }
    Ok(())
}

fn open_and_map(name: &CString, len: usize) -> Result<NonNull<u8>> {
    let fd = shm_open(name, libc::O_RDWR)?;
    // SAFETY: fd refers to an object of at least len bytes.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // The mapping keeps the object alive.
    // SAFETY: fd is open.
    unsafe { libc::close(fd) };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error().into());
    }
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::Internal("mmap returned null".into()))
}

/// Map a POSIX shared-memory object holding every local rank's part.
///
/// Every step that can fail on one rank is followed by a collective that
/// tells the others, so a failure is returned on all ranks of the node.
pub(crate) fn map_posix<C: Communicator>(
    comm: &C,
    kind: SegmentKind,
    id: i32,
    local_sizes: &[usize],
) -> Result<Box<dyn SharedMapping>> {
    let len = local_sizes
        .iter()
        .try_fold(0usize, |acc, &size| acc.checked_add(size))
        .ok_or_else(|| Error::NotSupported("segment size overflows the address space".into()))?;
    let owner = comm.rank() == 0;

    // Local rank 0 picks a name unique to this allocation.
    let mut token = [0i64; 2];
    if owner {
        token = [
            i64::from(std::process::id()),
            POSIX_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        ];
    }
    comm.broadcast(&mut token, 0)?;
    let name = CString::new(format!(
        "/shan_{}_{}_{}_{}",
        kind as i32, id, token[0], token[1]
    ))
    .map_err(|e| Error::Internal(e.to_string()))?;

    let created = if owner { create_posix(&name, len) } else { Ok(()) };
    let mut status = [i32::from(created.is_ok())];
    comm.broadcast(&mut status, 0)?;
    created?;
    if status[0] == 0 {
        return Err(Error::PeerFailure(format!("local rank 0 could not create {name:?}")));
    }

    let mapped = open_and_map(&name, len).map(|base| PosixMapping {
        name: name.clone(),
        base,
        len,
        offsets: prefix_offsets(local_sizes),
        owner,
        mapped: true,
        linked: owner,
    });
    let mut everyone = [i32::from(mapped.is_ok())];
    comm.allreduce_inplace(&mut everyone, ReduceOp::Min)?;
    match mapped {
        Ok(mapping) if everyone[0] == 1 => {
            debug!(name = ?name, len, "mapped POSIX shared segment");
            Ok(Box::new(mapping))
        }
        // Dropping the mapping unmaps it and, on the owner, unlinks the object.
        Ok(_mapping) => Err(Error::PeerFailure(format!("a local rank could not map {name:?}"))),
        Err(err) => {
            if owner {
                // SAFETY: name was created by this rank.
                unsafe { libc::shm_unlink(name.as_ptr()) };
            }
            Err(err)
        }
    }
}

// ============================================================================
// Segment
// ============================================================================

/// Shared memory region spanning all ranks of a node.
///
/// Created collectively by [`Segment::alloc`] and released collectively by
/// [`Segment::free`]. Dropping a segment without freeing it only detaches
/// the calling rank.
///
/// # Example
///
/// ```
/// use shan::{Communicator, Segment, SegmentBackend, SegmentKind, ThreadWorld};
///
/// let sums = ThreadWorld::new(2, 2).run(|rank| {
///     let node = rank.world.split_shared().unwrap();
///     let seg = Segment::alloc(7, SegmentKind::Data, 64, &node, SegmentBackend::ProcessHeap)
///         .unwrap();
///     seg.write(0, &[node.rank() as u64 + 1]);
///     node.barrier().unwrap();
///     let peer = 1 - seg.local_rank();
///     let mut value = [0u64];
///     seg.region(peer).read_bytes(0, bytemuck::cast_slice_mut(&mut value));
///     seg.free().unwrap();
///     value[0]
/// }).unwrap();
/// assert_eq!(sums, vec![2, 1]);
/// ```
pub struct Segment<C: Communicator> {
    id: i32,
    kind: SegmentKind,
    comm: C,
    local_rank: usize,
    local_sizes: Vec<usize>,
    mapping: Box<dyn SharedMapping>,
}

impl<C: Communicator> Segment<C> {
    /// Allocate a shared segment on the node-local communicator `comm`.
    ///
    /// Each rank requests `size` bytes; sizes may differ between ranks. The
    /// calling rank's part is zeroed before any rank returns.
    pub fn alloc(
        id: i32,
        kind: SegmentKind,
        size: usize,
        comm: &C,
        backend: SegmentBackend,
    ) -> Result<Self> {
        let page = page_size();
        let mine = align_up(size, page) as i64;
        let mut sizes = vec![0i64; comm.size() as usize];
        comm.allgather(&[mine], &mut sizes)?;
        let local_sizes: Vec<usize> = sizes.iter().map(|&s| s as usize).collect();
        if local_sizes.iter().all(|&s| s == 0) {
            return Err(Error::InvalidCount(0));
        }

        let mapping = comm.map_shared(kind, id, &local_sizes, backend)?;
        let segment = Segment {
            id,
            kind,
            comm: comm.clone(),
            local_rank: comm.rank() as usize,
            local_sizes,
            mapping,
        };

        comm.barrier()?;
        let own = segment.local_region();
        own.zero(0, own.len());
        fence(Ordering::SeqCst);
        comm.barrier()?;

        info!(
            id,
            ?kind,
            ?backend,
            local_size = segment.local_size(segment.local_rank),
            total = segment.local_sizes.iter().sum::<usize>(),
            "allocated shared segment"
        );
        Ok(segment)
    }

    /// Segment id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Segment kind.
    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// The node-local communicator the segment spans.
    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Local rank of the calling process.
    pub fn local_rank(&self) -> usize {
        self.local_rank
    }

    /// Number of local ranks sharing the segment.
    pub fn num_local(&self) -> usize {
        self.local_sizes.len()
    }

    /// Page-rounded size owned by `local_rank`.
    #[track_caller]
    pub fn local_size(&self, local_rank: usize) -> usize {
        self.local_sizes[local_rank]
    }

    /// Base address of `local_rank`'s part.
    ///
    /// Panics if `local_rank` is not a rank of the node communicator.
    #[track_caller]
    pub fn get_ptr(&self, local_rank: usize) -> NonNull<u8> {
        assert!(
            local_rank < self.local_sizes.len(),
            "local rank {local_rank} out of range ({} local ranks)",
            self.local_sizes.len()
        );
        self.mapping.base(local_rank)
    }

    /// Bounds-checked view of `local_rank`'s part.
    #[track_caller]
    ///
    /// The view borrows the segment, so it cannot outlive [`Segment::free`]:
    ///
    /// ```compile_fail
    /// use shan::{Communicator, Segment, SegmentBackend, SegmentKind, ThreadWorld};
    ///
    /// ThreadWorld::new(1, 1).run(|rank| {
    ///     let node = rank.world.split_shared().unwrap();
    ///     let seg = Segment::alloc(1, SegmentKind::Data, 8, &node, SegmentBackend::ProcessHeap)
    ///         .unwrap();
    ///     let view = seg.local_region();
    ///     seg.free().unwrap();
    ///     view.zero(0, 8);
    /// }).unwrap();
    /// ```
    pub fn region(&self, local_rank: usize) -> Region<'_> {
        let base = self.get_ptr(local_rank);
        // SAFETY: the mapping covers local_size bytes from base and lives as
        // long as self.
        unsafe { Region::from_raw(base, self.local_sizes[local_rank]) }
    }

    /// View of the calling rank's part.
    pub fn local_region(&self) -> Region<'_> {
        self.region(self.local_rank)
    }

    /// Copy `values` into the calling rank's part at byte offset `off`.
    #[track_caller]
    pub fn write<T: Pod>(&self, off: usize, values: &[T]) {
        self.local_region()
            .write_bytes(off, bytemuck::cast_slice(values));
    }

    /// Copy values at byte offset `off` of the calling rank's part.
    #[track_caller]
    pub fn read<T: Pod>(&self, off: usize, values: &mut [T]) {
        self.local_region()
            .read_bytes(off, bytemuck::cast_slice_mut(values));
    }

    /// Release the segment. Collective over the node communicator.
    pub fn free(mut self) -> Result<()> {
        self.comm.barrier()?;
        self.mapping.detach()?;
        self.comm.barrier()?;
        if self.local_rank == 0 {
            self.mapping.unlink()?;
        }
        self.comm.barrier()?;
        info!(id = self.id, kind = ?self.kind, "freed shared segment");
        Ok(())
    }
}

impl<C: Communicator> std::fmt::Debug for Segment<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("local_rank", &self.local_rank)
            .field("local_sizes", &self.local_sizes)
            .finish()
    }
}
