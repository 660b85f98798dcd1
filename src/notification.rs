//! Cache-line strided notification counters.
//!
//! A notification counts completed hand-offs on one channel. Writers publish
//! with [`Notifications::increment`], which fences before the atomic add so
//! the payload is visible before the new count. Readers poll with
//! [`Notifications::test`]. Counters live in shared segments at a 64-byte
//! stride so two ranks polling neighboring counters never share a line.

use std::sync::atomic::{fence, AtomicI32, Ordering};

use crate::region::Region;

/// Byte distance between consecutive counters.
pub const NOTIFICATION_STRIDE: usize = 64;

/// A view of `len` counters laid out [`NOTIFICATION_STRIDE`] bytes apart.
#[derive(Clone, Copy)]
pub struct Notifications<'a> {
    region: Region<'a>,
    offset: usize,
    len: usize,
}

impl<'a> Notifications<'a> {
    /// View `len` counters starting at byte `offset` of `region`.
    #[track_caller]
    pub fn new(region: &Region<'a>, offset: usize, len: usize) -> Self {
        if len > 0 {
            // Validate the whole strided range up front.
            region.span(offset, (len - 1) * NOTIFICATION_STRIDE + 4);
        }
        Self {
            region: *region,
            offset,
            len,
        }
    }

    /// Number of counters in the view.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the view holds no counters.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[track_caller]
    fn slot(&self, idx: usize) -> &'a AtomicI32 {
        assert!(
            idx < self.len,
            "notification index {idx} out of range (len={})",
            self.len
        );
        self.region.atomic_i32(self.offset + idx * NOTIFICATION_STRIDE)
    }

    /// Set every counter to zero.
    pub fn init(&self) {
        for idx in 0..self.len {
            self.slot(idx).store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    /// Publish `amount` completed hand-offs; returns the new value.
    #[track_caller]
    pub fn increment(&self, idx: usize, amount: i32) -> i32 {
        let slot = self.slot(idx);
        fence(Ordering::SeqCst);
        let value = slot.fetch_add(amount, Ordering::SeqCst) + amount;
        assert!(value > 0, "notification {idx} overflowed");
        value
    }

    /// Acquiring read of the counter at `idx`.
    #[inline]
    #[track_caller]
    pub fn test(&self, idx: usize) -> i32 {
        let value = self.slot(idx).load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        value
    }

    /// Swap the counter to zero, returning the previous value.
    #[track_caller]
    pub fn reset(&self, idx: usize) -> i32 {
        self.slot(idx).swap(0, Ordering::AcqRel)
    }
}
