//! Per-type geometry of the remote and shared segments.
//!
//! Given the per-type bounds (after they have been maximised over every rank)
//! the functions here compute the byte offsets of every slot. The formulas
//! must produce identical results on all ranks: a sender computes the target
//! offset of a remote write in the *receiver's* addressing scheme.
//!
//! # Remote segment
//!
//! For each type, in order, two send generations then (after all types) two
//! receive generations, each `num_neighbors` slots wide:
//!
//! ```text
//! slot(t)   = align_up(max_bytes(t) + HEADER_LEN, alignment)
//! send[g]   = base_send(t) + g * slot(t)        (per neighbor stride slot(t))
//! total     = align_up(num_neighbors * sum(2 * slot_send + 2 * slot_recv), page)
//! ```
//!
//! # Shared metadata
//!
//! For each type, `num_neighbors` copies of:
//!
//! ```text
//! notifications  2 * nn * 64 bytes   (data-ready [0, nn), have-read [nn, 2nn))
//! nelem_send     nn * i32
//! nelem_recv     nn * i32
//! send_sz        nn * i32
//! recv_sz        nn * i32
//! send_offset    nn * max_nelem_send * i64
//! recv_offset    nn * max_nelem_recv * i64
//! ```

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::notification::NOTIFICATION_STRIDE;

/// Bytes of the slot header preceding every remote payload.
pub const HEADER_LEN: usize = std::mem::size_of::<SlotHeader>();

/// Notifications per (type, partner) pair in the shared segment.
pub const SHARED_NOTIFICATIONS: usize = 2;

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Header written in front of every remote payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SlotHeader {
    /// Number of elements in the payload.
    pub nelem: i32,
    /// Byte size of each element.
    pub elem_size: i32,
    /// Sequence number of the send (1-based, per channel).
    pub seq: i32,
}

/// Capacity bounds of one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeBounds {
    /// Largest payload a rank sends to one partner, in bytes.
    pub max_send_bytes: i64,
    /// Largest payload a rank receives from one partner, in bytes.
    pub max_recv_bytes: i64,
    /// Largest number of elements gathered into one send.
    pub max_nelem_send: i32,
    /// Largest number of elements scattered out of one receive.
    pub max_nelem_recv: i32,
}

impl TypeBounds {
    /// Build bounds from the four parallel arrays of the flat interface.
    pub fn from_arrays(
        max_send_bytes: &[i64],
        max_recv_bytes: &[i64],
        max_nelem_send: &[i32],
        max_nelem_recv: &[i32],
    ) -> Result<Vec<Self>> {
        let n = max_send_bytes.len();
        if max_recv_bytes.len() != n || max_nelem_send.len() != n || max_nelem_recv.len() != n {
            return Err(Error::InvalidBuffer);
        }
        let bounds: Vec<_> = (0..n)
            .map(|t| TypeBounds {
                max_send_bytes: max_send_bytes[t],
                max_recv_bytes: max_recv_bytes[t],
                max_nelem_send: max_nelem_send[t],
                max_nelem_recv: max_nelem_recv[t],
            })
            .collect();
        for b in &bounds {
            b.validate()?;
        }
        Ok(bounds)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for bytes in [self.max_send_bytes, self.max_recv_bytes] {
            if bytes < 0 || bytes > i64::from(i32::MAX) {
                return Err(Error::InvalidCount(bytes));
            }
        }
        for nelem in [self.max_nelem_send, self.max_nelem_recv] {
            if nelem < 0 {
                return Err(Error::InvalidCount(i64::from(nelem)));
            }
        }
        Ok(())
    }
}

/// Placement of one message type in both segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeElement {
    /// Send slot size including header, aligned.
    pub max_send_sz: usize,
    /// Receive slot size including header, aligned.
    pub max_recv_sz: usize,
    /// Element capacity of one send.
    pub max_nelem_send: usize,
    /// Element capacity of one receive.
    pub max_nelem_recv: usize,
    /// Per-neighbor base of each send generation in the remote segment.
    pub send_offset: [usize; 2],
    /// Per-neighbor base of each receive generation in the remote segment.
    pub recv_offset: [usize; 2],
    /// Per-neighbor base of this type's metadata in the shared segment.
    pub elem_offset: usize,
}

impl TypeElement {
    /// Offset of this rank's send slot for `(idx, generation)` in its own
    /// remote segment.
    #[inline]
    pub fn send_slot(&self, num_neighbors: usize, idx: usize, generation: usize) -> usize {
        num_neighbors * self.send_offset[generation] + idx * self.max_send_sz
    }

    /// Offset of the receive slot `idx` in a remote segment laid out for
    /// `num_neighbors` partners.
    #[inline]
    pub fn recv_slot(&self, num_neighbors: usize, idx: usize, generation: usize) -> usize {
        num_neighbors * self.recv_offset[generation] + idx * self.max_recv_sz
    }

    /// Offset of this type's metadata block for a rank with `num_neighbors`.
    #[inline]
    pub fn meta_base(&self, num_neighbors: usize) -> usize {
        num_neighbors * self.elem_offset
    }

    /// Bytes of shared metadata per neighbor for this type.
    pub fn meta_stride(&self) -> usize {
        meta_stride(self.max_nelem_send, self.max_nelem_recv)
    }
}

fn meta_stride(max_nelem_send: usize, max_nelem_recv: usize) -> usize {
    SHARED_NOTIFICATIONS * NOTIFICATION_STRIDE
        + 4 * std::mem::size_of::<i32>()
        + (max_nelem_send + max_nelem_recv) * std::mem::size_of::<i64>()
}

/// Complete geometry of a neighborhood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// One entry per message type.
    pub types: Vec<TypeElement>,
    /// Page-aligned size of the private remote segment.
    pub remote_size: usize,
    /// Page-aligned size of this rank's shared metadata region.
    pub shared_size: usize,
    /// Number of partners the sizes were computed for.
    pub num_neighbors: usize,
}

impl Layout {
    /// Compute the geometry for `num_neighbors` partners.
    ///
    /// `bounds` must already be the global maxima so every rank derives the
    /// same per-neighbor offsets.
    pub fn compute(
        bounds: &[TypeBounds],
        num_neighbors: usize,
        alignment: usize,
        page_size: usize,
    ) -> Result<Self> {
        if !alignment.is_power_of_two() || alignment < 16 {
            return Err(Error::Config(format!(
                "slot alignment {alignment} must be a power of two >= 16"
            )));
        }
        for b in bounds {
            b.validate()?;
        }

        let mut types: Vec<TypeElement> = bounds
            .iter()
            .map(|b| TypeElement {
                max_send_sz: align_up(b.max_send_bytes as usize + HEADER_LEN, alignment),
                max_recv_sz: align_up(b.max_recv_bytes as usize + HEADER_LEN, alignment),
                max_nelem_send: b.max_nelem_send as usize,
                max_nelem_recv: b.max_nelem_recv as usize,
                send_offset: [0; 2],
                recv_offset: [0; 2],
                elem_offset: 0,
            })
            .collect();

        let mut acc = 0;
        for elem in &mut types {
            elem.send_offset = [acc, acc + elem.max_send_sz];
            acc += 2 * elem.max_send_sz;
        }
        for elem in &mut types {
            elem.recv_offset = [acc, acc + elem.max_recv_sz];
            acc += 2 * elem.max_recv_sz;
        }
        let remote_size = align_up(num_neighbors * acc, page_size);

        let mut meta = 0;
        for elem in &mut types {
            elem.elem_offset = meta;
            meta += elem.meta_stride();
        }
        let shared_size = align_up(num_neighbors * meta, page_size);

        Ok(Layout {
            types,
            remote_size,
            shared_size,
            num_neighbors,
        })
    }

    /// Notification ids the fabric must provide for this layout.
    pub fn required_notifications(&self) -> u64 {
        2 * self.num_neighbors as u64 * self.types.len() as u64
    }
}
