//! Integer-handle interface for foreign callers.
//!
//! Rust code should hold [`Segment`] and [`Neighborhood`] values directly.
//! Bindings for languages that pass small integers instead of objects keep a
//! [`HandleTable`] instead: segments and neighborhoods are stored under the
//! id they were created with, and every entry point takes ids.

use std::ptr::NonNull;

use tracing::debug;

use crate::comm::Communicator;
use crate::config::ShanConfig;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::layout::TypeBounds;
use crate::meta::TypeMeta;
use crate::neighborhood::Neighborhood;
use crate::segment::{Segment, SegmentKind};

/// Number of neighborhood handles.
pub const MAX_NEIGHBORHOODS: usize = 32;

/// Number of segment handles.
pub const MAX_SEGMENTS: usize = 32;

/// Segments and neighborhoods addressed by id.
pub struct HandleTable<C: Communicator, F: Fabric> {
    config: ShanConfig,
    segments: Vec<Option<Segment<C>>>,
    neighborhoods: Vec<Option<Neighborhood<C, F>>>,
}

fn slot(id: i32, capacity: usize) -> Result<usize> {
    usize::try_from(id)
        .ok()
        .filter(|&i| i < capacity)
        .ok_or(Error::InvalidHandle(id))
}

impl<C: Communicator, F: Fabric> HandleTable<C, F> {
    /// An empty table; neighborhoods are created with `config`.
    pub fn new(config: ShanConfig) -> Self {
        Self {
            config,
            segments: (0..MAX_SEGMENTS).map(|_| None).collect(),
            neighborhoods: (0..MAX_NEIGHBORHOODS).map(|_| None).collect(),
        }
    }

    /// Allocate a shared segment under handle `id`. Collective over `local`.
    pub fn alloc_shared(&mut self, id: i32, kind: SegmentKind, size: usize, local: &C) -> Result<()> {
        let i = slot(id, MAX_SEGMENTS)?;
        if self.segments[i].is_some() {
            return Err(Error::SegmentInUse(id));
        }
        self.segments[i] = Some(Segment::alloc(id, kind, size, local, self.config.segment_backend)?);
        Ok(())
    }

    /// Free the segment under handle `id`. Collective over its communicator.
    pub fn free_shared(&mut self, id: i32) -> Result<()> {
        let i = slot(id, MAX_SEGMENTS)?;
        self.segments[i].take().ok_or(Error::InvalidHandle(id))?.free()
    }

    /// Start of `local_rank`'s part of segment `id`.
    pub fn get_shared_ptr(&self, id: i32, local_rank: usize) -> Result<NonNull<u8>> {
        let segment = self.segment(id)?;
        if local_rank >= segment.num_local() {
            return Err(Error::InvalidRank(local_rank as i32));
        }
        Ok(segment.get_ptr(local_rank))
    }

    /// Segment under handle `id`.
    pub fn segment(&self, id: i32) -> Result<&Segment<C>> {
        self.segments[slot(id, MAX_SEGMENTS)?]
            .as_ref()
            .ok_or(Error::InvalidHandle(id))
    }

    /// Create neighborhood `id` from the parallel bound arrays of the flat
    /// interface. Collective over `global`.
    #[allow(clippy::too_many_arguments)]
    pub fn init_comm(
        &mut self,
        id: i32,
        partners: &[i32],
        max_send_bytes: &[i64],
        max_recv_bytes: &[i64],
        max_nelem_send: &[i32],
        max_nelem_recv: &[i32],
        local: &C,
        global: &C,
        fabric: F,
    ) -> Result<()> {
        let i = slot(id, MAX_NEIGHBORHOODS)?;
        if self.neighborhoods[i].is_some() {
            return Err(Error::SegmentInUse(id));
        }
        let bounds = TypeBounds::from_arrays(max_send_bytes, max_recv_bytes, max_nelem_send, max_nelem_recv)?;
        let nh = Neighborhood::init(id, partners, &bounds, local, global, fabric, self.config.clone())?;
        debug!(id, "registered neighborhood handle");
        self.neighborhoods[i] = Some(nh);
        Ok(())
    }

    /// Free neighborhood `id`. Collective over its global communicator.
    pub fn free_comm(&mut self, id: i32) -> Result<()> {
        let i = slot(id, MAX_NEIGHBORHOODS)?;
        self.neighborhoods[i].take().ok_or(Error::InvalidHandle(id))?.free()
    }

    /// Neighborhood under handle `id`.
    pub fn neighborhood(&self, id: i32) -> Result<&Neighborhood<C, F>> {
        self.neighborhoods[slot(id, MAX_NEIGHBORHOODS)?]
            .as_ref()
            .ok_or(Error::InvalidHandle(id))
    }

    fn parts(&mut self, nh: i32, seg: i32) -> Result<(&mut Neighborhood<C, F>, &Segment<C>)> {
        let n = slot(nh, MAX_NEIGHBORHOODS)?;
        let s = slot(seg, MAX_SEGMENTS)?;
        let neighborhood = self.neighborhoods[n].as_mut().ok_or(Error::InvalidHandle(nh))?;
        let segment = self.segments[s].as_ref().ok_or(Error::InvalidHandle(seg))?;
        Ok((neighborhood, segment))
    }

    fn neighborhood_mut(&mut self, id: i32) -> Result<&mut Neighborhood<C, F>> {
        self.neighborhoods[slot(id, MAX_NEIGHBORHOODS)?]
            .as_mut()
            .ok_or(Error::InvalidHandle(id))
    }

    /// Packing descriptors of `type_id` in neighborhood `nh`.
    pub fn type_offset(&self, nh: i32, type_id: usize) -> Result<TypeMeta<'_>> {
        Ok(self.neighborhood(nh)?.type_offset(type_id))
    }

    /// See [`Neighborhood::notify_or_write`].
    pub fn notify_or_write(&mut self, nh: i32, seg: i32, type_id: usize, idx: usize) -> Result<()> {
        let (neighborhood, segment) = self.parts(nh, seg)?;
        neighborhood.notify_or_write(segment, type_id, idx);
        Ok(())
    }

    /// See [`Neighborhood::wait_all`].
    pub fn wait4_all(&mut self, nh: i32, seg: i32, type_id: usize) -> Result<()> {
        let (neighborhood, segment) = self.parts(nh, seg)?;
        neighborhood.wait_all(segment, type_id);
        Ok(())
    }

    /// See [`Neighborhood::wait_all_recv`].
    pub fn wait4_all_recv(&mut self, nh: i32, seg: i32, type_id: usize) -> Result<()> {
        let (neighborhood, segment) = self.parts(nh, seg)?;
        neighborhood.wait_all_recv(segment, type_id);
        Ok(())
    }

    /// See [`Neighborhood::wait_all_send`].
    pub fn wait4_all_send(&mut self, nh: i32, type_id: usize) -> Result<()> {
        self.neighborhood_mut(nh)?.wait_all_send(type_id);
        Ok(())
    }

    /// See [`Neighborhood::wait_recv`].
    pub fn wait4_recv(&mut self, nh: i32, seg: i32, type_id: usize, idx: usize) -> Result<()> {
        let (neighborhood, segment) = self.parts(nh, seg)?;
        neighborhood.wait_recv(segment, type_id, idx);
        Ok(())
    }

    /// See [`Neighborhood::test_recv`].
    pub fn test4_recv(&mut self, nh: i32, seg: i32, type_id: usize, idx: usize) -> Result<bool> {
        let (neighborhood, segment) = self.parts(nh, seg)?;
        Ok(neighborhood.test_recv(segment, type_id, idx))
    }

    /// See [`Neighborhood::wait_send`].
    pub fn wait4_send(&mut self, nh: i32, type_id: usize, idx: usize) -> Result<()> {
        self.neighborhood_mut(nh)?.wait_send(type_id, idx);
        Ok(())
    }

    /// See [`Neighborhood::test_send`].
    pub fn test4_send(&mut self, nh: i32, type_id: usize, idx: usize) -> Result<bool> {
        Ok(self.neighborhood_mut(nh)?.test_send(type_id, idx))
    }
}
