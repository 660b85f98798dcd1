//! Per-type metadata living in the shared segment.
//!
//! The owning rank writes its packing descriptors (element counts, element
//! sizes, per-element byte offsets into its data segment) here, and
//! co-located peers read them when copying directly out of the owner's data
//! segment. The two notification arrays of the block are the only words
//! written by both parties, and only through [`Notifications`].

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::error::{Error, Result};
use crate::layout::{TypeElement, SHARED_NOTIFICATIONS};
use crate::notification::{Notifications, NOTIFICATION_STRIDE};
use crate::region::Region;

const I32: usize = std::mem::size_of::<i32>();
const I64: usize = std::mem::size_of::<i64>();

/// Metadata block of one type, as laid out for a rank with `num_neighbors`.
#[derive(Clone, Copy)]
pub(crate) struct TypeView<'a> {
    region: Region<'a>,
    base: usize,
    num_neighbors: usize,
    max_nelem_send: usize,
    max_nelem_recv: usize,
}

impl<'a> TypeView<'a> {
    /// `region` is the owning rank's shared region.
    #[track_caller]
    pub(crate) fn new(region: Region<'a>, elem: &TypeElement, num_neighbors: usize) -> Self {
        let base = elem.meta_base(num_neighbors);
        region.span(base, num_neighbors * elem.meta_stride());
        Self {
            region,
            base,
            num_neighbors,
            max_nelem_send: elem.max_nelem_send,
            max_nelem_recv: elem.max_nelem_recv,
        }
    }

    /// Data-ready counters at `[0, nn)`, have-read counters at `[nn, 2nn)`.
    pub(crate) fn notifications(&self) -> Notifications<'a> {
        Notifications::new(
            &self.region,
            self.base,
            SHARED_NOTIFICATIONS * self.num_neighbors,
        )
    }

    fn ints(&self, array: usize) -> &'a [AtomicI32] {
        let off = self.base
            + SHARED_NOTIFICATIONS * self.num_neighbors * NOTIFICATION_STRIDE
            + array * self.num_neighbors * I32;
        self.region.atomic_i32_slice(off, self.num_neighbors)
    }

    fn longs_base(&self) -> usize {
        self.base
            + SHARED_NOTIFICATIONS * self.num_neighbors * NOTIFICATION_STRIDE
            + 4 * self.num_neighbors * I32
    }

    pub(crate) fn nelem_send(&self) -> &'a [AtomicI32] {
        self.ints(0)
    }

    pub(crate) fn nelem_recv(&self) -> &'a [AtomicI32] {
        self.ints(1)
    }

    pub(crate) fn send_sz(&self) -> &'a [AtomicI32] {
        self.ints(2)
    }

    pub(crate) fn recv_sz(&self) -> &'a [AtomicI32] {
        self.ints(3)
    }

    #[track_caller]
    pub(crate) fn send_offsets(&self, idx: usize) -> &'a [AtomicI64] {
        assert!(idx < self.num_neighbors, "partner index {idx} out of range");
        let off = self.longs_base() + idx * self.max_nelem_send * I64;
        self.region.atomic_i64_slice(off, self.max_nelem_send)
    }

    #[track_caller]
    pub(crate) fn recv_offsets(&self, idx: usize) -> &'a [AtomicI64] {
        assert!(idx < self.num_neighbors, "partner index {idx} out of range");
        let off = self.longs_base()
            + self.num_neighbors * self.max_nelem_send * I64
            + idx * self.max_nelem_recv * I64;
        self.region.atomic_i64_slice(off, self.max_nelem_recv)
    }

    /// Zero counters and descriptors.
    pub(crate) fn clear(&self) {
        let notes = self.notifications();
        notes.init();
        for array in 0..4 {
            for v in self.ints(array) {
                v.store(0, Ordering::Relaxed);
            }
        }
        for idx in 0..self.num_neighbors {
            for v in self.send_offsets(idx).iter().chain(self.recv_offsets(idx)) {
                v.store(0, Ordering::Relaxed);
            }
        }
    }
}

/// One side of a packing descriptor, copied out of the shared metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Number of elements.
    pub nelem: i32,
    /// Byte size of each element.
    pub elem_size: i32,
    /// Byte offset of each element in the data segment.
    pub offsets: Vec<i64>,
}

/// Caller-facing access to a type's packing descriptors.
///
/// Returned by [`Neighborhood::type_offset`](crate::Neighborhood::type_offset).
/// Descriptors must be written before the corresponding send or receive is
/// issued; a co-located partner reads the send side directly.
pub struct TypeMeta<'a> {
    view: TypeView<'a>,
}

/// Store one side of a descriptor after checking it fits.
fn store(
    offsets: &[i64],
    slots: &[AtomicI64],
    elem_size: usize,
    size: &AtomicI32,
    nelem: &AtomicI32,
) -> Result<()> {
    if offsets.len() > slots.len() {
        return Err(Error::ExceedsCapacity {
            count: offsets.len(),
            capacity: slots.len(),
        });
    }
    let elem_size = i32::try_from(elem_size)
        .map_err(|_| Error::InvalidCount(i64::try_from(elem_size).unwrap_or(i64::MAX)))?;
    let count = i32::try_from(offsets.len()).map_err(|_| Error::InvalidCount(offsets.len() as i64))?;
    for (slot, off) in slots.iter().zip(offsets) {
        slot.store(*off, Ordering::Relaxed);
    }
    size.store(elem_size, Ordering::Relaxed);
    nelem.store(count, Ordering::Relaxed);
    Ok(())
}

/// Read one side of a descriptor back, rejecting counts the slots cannot hold.
fn load(nelem: &AtomicI32, size: &AtomicI32, slots: &[AtomicI64]) -> Result<Descriptor> {
    let raw = nelem.load(Ordering::Relaxed);
    let count = usize::try_from(raw)
        .ok()
        .filter(|&n| n <= slots.len())
        .ok_or(Error::InvalidCount(i64::from(raw)))?;
    Ok(Descriptor {
        nelem: raw,
        elem_size: size.load(Ordering::Relaxed),
        offsets: slots[..count]
            .iter()
            .map(|o| o.load(Ordering::Relaxed))
            .collect(),
    })
}

impl<'a> TypeMeta<'a> {
    pub(crate) fn new(view: TypeView<'a>) -> Self {
        Self { view }
    }

    /// Number of partners.
    pub fn num_neighbors(&self) -> usize {
        self.view.num_neighbors
    }

    /// Element capacity of one send.
    pub fn max_nelem_send(&self) -> usize {
        self.view.max_nelem_send
    }

    /// Element capacity of one receive.
    pub fn max_nelem_recv(&self) -> usize {
        self.view.max_nelem_recv
    }

    /// Describe what the next sends to partner `idx` gather.
    ///
    /// Fails when `offsets` exceeds the element capacity or `elem_size` does
    /// not fit the shared 32-bit field.
    #[track_caller]
    pub fn set_send(&self, idx: usize, elem_size: usize, offsets: &[i64]) -> Result<()> {
        store(
            offsets,
            self.view.send_offsets(idx),
            elem_size,
            &self.view.send_sz()[idx],
            &self.view.nelem_send()[idx],
        )
    }

    /// Describe where receives from partner `idx` scatter to.
    ///
    /// Fails like [`set_send`](Self::set_send).
    #[track_caller]
    pub fn set_recv(&self, idx: usize, elem_size: usize, offsets: &[i64]) -> Result<()> {
        store(
            offsets,
            self.view.recv_offsets(idx),
            elem_size,
            &self.view.recv_sz()[idx],
            &self.view.nelem_recv()[idx],
        )
    }

    /// Current send descriptor for partner `idx`.
    #[track_caller]
    pub fn send(&self, idx: usize) -> Result<Descriptor> {
        load(
            &self.view.nelem_send()[idx],
            &self.view.send_sz()[idx],
            self.view.send_offsets(idx),
        )
    }

    /// Current receive descriptor for partner `idx`.
    ///
    /// In variable-length mode the element count and size reflect the last
    /// message received.
    #[track_caller]
    pub fn recv(&self, idx: usize) -> Result<Descriptor> {
        load(
            &self.view.nelem_recv()[idx],
            &self.view.recv_sz()[idx],
            self.view.recv_offsets(idx),
        )
    }

    /// Raw send element counts, one per partner.
    pub fn nelem_send(&self) -> &[AtomicI32] {
        self.view.nelem_send()
    }

    /// Raw receive element counts, one per partner.
    pub fn nelem_recv(&self) -> &[AtomicI32] {
        self.view.nelem_recv()
    }

    /// Raw send element sizes, one per partner.
    pub fn send_sz(&self) -> &[AtomicI32] {
        self.view.send_sz()
    }

    /// Raw receive element sizes, one per partner.
    pub fn recv_sz(&self) -> &[AtomicI32] {
        self.view.recv_sz()
    }

    /// Raw send offsets of partner `idx` (`max_nelem_send` entries).
    pub fn send_offsets(&self, idx: usize) -> &[AtomicI64] {
        self.view.send_offsets(idx)
    }

    /// Raw receive offsets of partner `idx` (`max_nelem_recv` entries).
    pub fn recv_offsets(&self, idx: usize) -> &[AtomicI64] {
        self.view.recv_offsets(idx)
    }
}
