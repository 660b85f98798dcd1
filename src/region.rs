//! Bounds-checked views over raw segment memory.
//!
//! Every byte offset the layout engine produces is resolved through a
//! [`Region`], so an inconsistent geometry panics at the faulting access
//! instead of scribbling over a neighbor's slot.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI32, AtomicI64};

use bytemuck::Pod;

use crate::error::{Error, Result};

/// A contiguous region of memory addressed by byte offset.
///
/// The lifetime ties the view to whatever owns the memory (a [`Segment`],
/// a [`HeapRegion`]), so a region cannot be used after its mapping is gone.
///
/// [`Segment`]: crate::Segment
#[derive(Clone, Copy, Debug)]
pub struct Region<'a> {
    base: NonNull<u8>,
    len: usize,
    _memory: PhantomData<&'a [u8]>,
}

impl<'a> Region<'a> {
    /// Create a region from a base pointer and length.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for reads and writes of `len` bytes
    /// - the memory must stay mapped for all of `'a`
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self {
            base,
            len,
            _memory: PhantomData,
        }
    }

    /// Drop the borrow, keeping the address range.
    ///
    /// # Safety
    ///
    /// The caller must keep the memory mapped for as long as the returned
    /// region is used.
    pub unsafe fn extend<'b>(self) -> Region<'b> {
        Region::from_raw(self.base, self.len)
    }

    /// Returns the base pointer of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region has zero length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a pointer to `len` bytes starting at `off`.
    #[inline]
    #[track_caller]
    pub fn span(&self, off: usize, len: usize) -> *mut u8 {
        let end = off.checked_add(len);
        assert!(
            end.is_some_and(|end| end <= self.len),
            "span {off}+{len} out of bounds (len={})",
            self.len
        );
        // SAFETY: off + len <= self.len, checked above.
        unsafe { self.as_ptr().add(off) }
    }

    #[track_caller]
    fn aligned<T>(&self, off: usize, count: usize) -> *mut T {
        let bytes = count
            .checked_mul(size_of::<T>())
            .unwrap_or_else(|| panic!("element count {count} overflows"));
        let ptr = self.span(off, bytes);
        assert!(
            (ptr as usize) % align_of::<T>() == 0,
            "offset {off} is not aligned to {}",
            align_of::<T>()
        );
        ptr.cast()
    }

    /// Returns the 32-bit atomic at byte offset `off`.
    #[track_caller]
    pub fn atomic_i32(&self, off: usize) -> &'a AtomicI32 {
        // SAFETY: in bounds and aligned; shared memory is only ever accessed
        // atomically at counter offsets.
        unsafe { &*self.aligned::<AtomicI32>(off, 1) }
    }

    /// Returns `count` consecutive 32-bit atomics starting at byte offset `off`.
    #[track_caller]
    pub fn atomic_i32_slice(&self, off: usize, count: usize) -> &'a [AtomicI32] {
        // SAFETY: see `atomic_i32`.
        unsafe { std::slice::from_raw_parts(self.aligned::<AtomicI32>(off, count), count) }
    }

    /// Returns `count` consecutive 64-bit atomics starting at byte offset `off`.
    #[track_caller]
    pub fn atomic_i64_slice(&self, off: usize, count: usize) -> &'a [AtomicI64] {
        // SAFETY: see `atomic_i32`.
        unsafe { std::slice::from_raw_parts(self.aligned::<AtomicI64>(off, count), count) }
    }

    /// Copy `src` into the region at `off`.
    #[track_caller]
    pub fn write_bytes(&self, off: usize, src: &[u8]) {
        let dst = self.span(off, src.len());
        // SAFETY: dst is valid for src.len() bytes; src is a Rust slice and
        // cannot overlap segment memory handed out by this crate.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
    }

    /// Copy bytes at `off` out of the region into `dst`.
    #[track_caller]
    pub fn read_bytes(&self, off: usize, dst: &mut [u8]) {
        let src = self.span(off, dst.len());
        // SAFETY: src is valid for dst.len() bytes.
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
    }

    /// Read a plain-old-data value at `off` (no alignment requirement).
    #[track_caller]
    pub fn read_pod<T: Pod>(&self, off: usize) -> T {
        let src = self.span(off, size_of::<T>());
        // SAFETY: in bounds; any bit pattern is a valid T.
        unsafe { ptr::read_unaligned(src.cast::<T>()) }
    }

    /// Write a plain-old-data value at `off` (no alignment requirement).
    #[track_caller]
    pub fn write_pod<T: Pod>(&self, off: usize, value: &T) {
        self.write_bytes(off, bytemuck::bytes_of(value));
    }

    /// Zero `len` bytes starting at `off`.
    #[track_caller]
    pub fn zero(&self, off: usize, len: usize) {
        let dst = self.span(off, len);
        // SAFETY: dst is valid for len bytes.
        unsafe { ptr::write_bytes(dst, 0, len) };
    }
}

// Regions are plain address ranges; synchronisation is the caller's protocol.
unsafe impl Send for Region<'_> {}
unsafe impl Sync for Region<'_> {}

/// Copy `len` bytes between two regions, bounds-checking both sides.
#[track_caller]
pub fn copy(src: &Region<'_>, src_off: usize, dst: &Region<'_>, dst_off: usize, len: usize) {
    let from = src.span(src_off, len);
    let to = dst.span(dst_off, len);
    // SAFETY: both spans are in bounds; `copy` tolerates overlap.
    unsafe { ptr::copy(from, to, len) };
}

/// Zeroed heap allocation with a caller-chosen alignment.
///
/// Backs the private remote segment and the in-process shared segments.
pub struct HeapRegion {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl HeapRegion {
    /// Allocate `size` zeroed bytes aligned to `align`.
    pub fn new_zeroed(size: usize, align: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), align)
            .map_err(|e| Error::Internal(format!("invalid heap region layout: {e}")))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                format!("allocation of {size} bytes failed"),
            ))
        })?;
        Ok(Self {
            base,
            len: size,
            layout,
        })
    }

    /// Returns a Region view of this allocation.
    #[inline]
    pub fn region(&self) -> Region<'_> {
        // SAFETY: the allocation lives as long as the borrow of self.
        unsafe { Region::from_raw(self.base, self.len) }
    }

    /// Returns the allocation size.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the allocation is zero-length.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn heap_region_is_zeroed_and_aligned() {
        let heap = HeapRegion::new_zeroed(4096, 4096).unwrap();
        let region = heap.region();
        assert_eq!(region.as_ptr() as usize % 4096, 0);
        let mut buf = [0xffu8; 32];
        region.read_bytes(4064, &mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn pod_roundtrip_unaligned() {
        let heap = HeapRegion::new_zeroed(64, 64).unwrap();
        let region = heap.region();
        region.write_pod(3, &0x0102_0304_i32);
        assert_eq!(region.read_pod::<i32>(3), 0x0102_0304);
    }

    #[test]
    fn atomics_alias_the_same_bytes() {
        let heap = HeapRegion::new_zeroed(128, 64).unwrap();
        let region = heap.region();
        region.atomic_i32(8).store(7, Ordering::Relaxed);
        assert_eq!(region.atomic_i32_slice(4, 2)[1].load(Ordering::Relaxed), 7);
        region.atomic_i64_slice(64, 2)[1].store(-1, Ordering::Relaxed);
        assert_eq!(region.read_pod::<i64>(72), -1);
    }

    #[test]
    fn copy_between_regions() {
        let a = HeapRegion::new_zeroed(32, 8).unwrap();
        let b = HeapRegion::new_zeroed(32, 8).unwrap();
        a.region().write_bytes(0, b"neighbor");
        copy(&a.region(), 0, &b.region(), 24, 8);
        let mut out = [0u8; 8];
        b.region().read_bytes(24, &mut out);
        assert_eq!(&out, b"neighbor");
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn span_past_end_panics() {
        let heap = HeapRegion::new_zeroed(16, 8).unwrap();
        heap.region().span(12, 8);
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn misaligned_atomic_panics() {
        let heap = HeapRegion::new_zeroed(16, 8).unwrap();
        heap.region().atomic_i32(2);
    }
}
