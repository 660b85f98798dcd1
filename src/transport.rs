//! Sending and receiving on a [`Neighborhood`].
//!
//! Every `(type_id, idx)` pair is an independent channel. A co-located
//! partner reads straight out of the sender's data segment: a send only
//! publishes a data-ready count, and the receiver copies, then publishes a
//! have-read count. A remote partner is served by a notified fabric write of
//! a packed slot, double-buffered over two generations.
//!
//! Contract violations on these paths (sequence gaps, mismatched element
//! sizes, overflowing slots, out-of-range indices) panic.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::comm::Communicator;
use crate::error::OrDie;
use crate::fabric::{notification_id, write_notify_and_wait, Fabric};
use crate::layout::{SlotHeader, HEADER_LEN};
use crate::meta::TypeView;
use crate::neighborhood::{Neighborhood, Partner, Route};
use crate::region;
use crate::segment::Segment;
use crate::wait::{spin_until, Backoff};

impl<C: Communicator, F: Fabric> Neighborhood<C, F> {
    /// Send the current send descriptor of `type_id` to partner `idx`.
    ///
    /// To a co-located partner this blocks while the previous message on the
    /// channel is unread. To a remote partner it blocks until the fabric
    /// write completed locally.
    #[doc(alias = "shan_comm_notify_or_write")]
    #[track_caller]
    pub fn notify_or_write(&mut self, data: &Segment<C>, type_id: usize, idx: usize) {
        self.check_channel(type_id, idx);
        let partner = self.partners[idx];
        match partner.route {
            Route::Local { .. } => {
                if self.counters[type_id][idx].outstanding() > 0 {
                    let policy = self.config.backoff;
                    spin_until(policy, || self.test_send(type_id, idx));
                }
                self.own_view(type_id).notifications().increment(idx, 1);
                let seq = self.counters[type_id][idx].record_send();
                trace!(id = self.id, type_id, idx, to = partner.rank, seq, "notified");
            }
            Route::Remote => self.write_remote(data, type_id, idx, &partner),
        }
    }

    fn write_remote(&mut self, data: &Segment<C>, type_id: usize, idx: usize, partner: &Partner) {
        let nn = self.partners.len();
        let elem = &self.layout.types[type_id];
        let generation = self.counters[type_id][idx].send_generation().index();
        let own = self.own_view(type_id);
        let nelem = own.nelem_send()[idx].load(Ordering::Relaxed);
        let elem_size = own.send_sz()[idx].load(Ordering::Relaxed);
        assert!(nelem >= 0 && elem_size >= 0, "corrupt send descriptor for partner {idx}");
        let len = HEADER_LEN + nelem as usize * elem_size as usize;
        assert!(
            len <= elem.max_send_sz && len <= elem.max_recv_sz,
            "message of {len} bytes exceeds the slot of type {type_id}"
        );

        let remote = self.remote.region();
        let slot = elem.send_slot(nn, idx, generation);
        let src = data.local_region();
        let sz = elem_size as usize;
        for (i, off) in own.send_offsets(idx)[..nelem as usize].iter().enumerate() {
            let off = off.load(Ordering::Relaxed) as usize;
            region::copy(&src, off, &remote, slot + HEADER_LEN + i * sz, sz);
        }
        let seq = self.counters[type_id][idx].send + 1;
        remote.write_pod(slot, &SlotHeader { nelem, elem_size, seq });

        let target = elem.recv_slot(partner.remote_num_neighbors, partner.remote_comm_index, generation);
        let nid = notification_id(
            generation,
            self.layout.types.len(),
            type_id,
            partner.remote_num_neighbors,
            partner.remote_comm_index,
        );
        write_notify_and_wait(
            &self.fabric,
            self.segment_id(),
            slot,
            partner.rank,
            target,
            len,
            nid,
            (self.global.rank() + 1) as u32,
            self.config.queue,
            self.config.backoff,
        )
        .or_die("notified write");
        self.counters[type_id][idx].record_send();
        trace!(id = self.id, type_id, idx, to = partner.rank, seq, len, "wrote");
    }

    /// Consume the next message of `type_id` from partner `idx` if it has
    /// arrived, scattering it into `data` by the receive descriptor.
    #[doc(alias = "shan_comm_test4Recv")]
    #[track_caller]
    pub fn test_recv(&mut self, data: &Segment<C>, type_id: usize, idx: usize) -> bool {
        self.check_channel(type_id, idx);
        let partner = self.partners[idx];
        match partner.route {
            Route::Local { local_rank } => self.recv_local(data, type_id, idx, &partner, local_rank),
            Route::Remote => self.recv_remote(data, type_id, idx, &partner),
        }
    }

    fn recv_local(
        &mut self,
        data: &Segment<C>,
        type_id: usize,
        idx: usize,
        partner: &Partner,
        local_rank: usize,
    ) -> bool {
        let peer = self.peer_view(type_id, partner, local_rank);
        let ri = partner.remote_comm_index;
        let published = peer.notifications().test(ri);
        let recv = self.counters[type_id][idx].recv;
        if published <= recv {
            return false;
        }
        assert_eq!(
            published,
            recv + 1,
            "rank {} published {published} messages, {recv} received",
            partner.rank
        );

        let own = self.own_view(type_id);
        let nelem = peer.nelem_send()[ri].load(Ordering::Relaxed);
        let elem_size = peer.send_sz()[ri].load(Ordering::Relaxed);
        let nelem = self.accept(&own, type_id, idx, nelem, elem_size);

        let src = data.region(local_rank);
        let dst = data.local_region();
        let sz = elem_size as usize;
        let from = &peer.send_offsets(ri)[..nelem];
        let to = &own.recv_offsets(idx)[..nelem];
        for (s, d) in from.iter().zip(to) {
            region::copy(
                &src,
                s.load(Ordering::Relaxed) as usize,
                &dst,
                d.load(Ordering::Relaxed) as usize,
                sz,
            );
        }

        own.notifications().increment(self.partners.len() + idx, 1);
        self.counters[type_id][idx].record_recv(published);
        trace!(id = self.id, type_id, idx, from = partner.rank, seq = published, "copied");
        true
    }

    fn recv_remote(&mut self, data: &Segment<C>, type_id: usize, idx: usize, partner: &Partner) -> bool {
        let nn = self.partners.len();
        let segment = self.segment_id();
        let generation = self.counters[type_id][idx].recv_generation().index();
        let nid = notification_id(generation, self.layout.types.len(), type_id, nn, idx);
        if !self.fabric.notify_test(segment, nid).or_die("notification test") {
            return false;
        }
        let value = self.fabric.notify_reset(segment, nid).or_die("notification reset");
        assert_eq!(
            value as i64 - 1,
            i64::from(partner.rank),
            "notification {nid} set by an unexpected rank"
        );

        let elem = &self.layout.types[type_id];
        let remote = self.remote.region();
        let slot = elem.recv_slot(nn, idx, generation);
        let header: SlotHeader = remote.read_pod(slot);
        self.counters[type_id][idx].record_recv(header.seq);
        assert!(
            header.nelem >= 0
                && header.elem_size >= 0
                && HEADER_LEN + header.nelem as usize * header.elem_size as usize <= elem.max_recv_sz,
            "corrupt slot header {header:?}"
        );

        let own = self.own_view(type_id);
        let nelem = self.accept(&own, type_id, idx, header.nelem, header.elem_size);
        let dst = data.local_region();
        let sz = header.elem_size as usize;
        for (i, off) in own.recv_offsets(idx)[..nelem].iter().enumerate() {
            region::copy(
                &remote,
                slot + HEADER_LEN + i * sz,
                &dst,
                off.load(Ordering::Relaxed) as usize,
                sz,
            );
        }
        trace!(id = self.id, type_id, idx, from = partner.rank, seq = header.seq, "unpacked");
        true
    }

    /// Reconcile an incoming `(nelem, elem_size)` with the receive
    /// descriptor; returns the element count to scatter.
    #[track_caller]
    fn accept(&self, own: &TypeView<'_>, type_id: usize, idx: usize, nelem: i32, elem_size: i32) -> usize {
        if self.config.variable_message_len {
            assert!(
                nelem >= 0 && nelem as usize <= own.recv_offsets(idx).len(),
                "{nelem} elements exceed receive capacity of type {type_id}"
            );
            own.nelem_recv()[idx].store(nelem, Ordering::Relaxed);
            own.recv_sz()[idx].store(elem_size, Ordering::Relaxed);
        } else {
            let expected = own.recv_sz()[idx].load(Ordering::Relaxed);
            assert_eq!(
                elem_size, expected,
                "element size {elem_size} from partner {idx} differs from receive size {expected}"
            );
            let expected = own.nelem_recv()[idx].load(Ordering::Relaxed);
            assert_eq!(
                nelem, expected,
                "{nelem} elements from partner {idx}, receive descriptor expects {expected}"
            );
        }
        nelem as usize
    }

    /// True once the oldest unacknowledged send of `type_id` to partner `idx`
    /// is complete and its buffer may be reused.
    ///
    /// For a remote partner, complete means the notified write finished
    /// locally; it says nothing about whether the receiver consumed it.
    #[doc(alias = "shan_comm_test4Send")]
    #[track_caller]
    pub fn test_send(&mut self, type_id: usize, idx: usize) -> bool {
        self.check_channel(type_id, idx);
        let partner = self.partners[idx];
        match partner.route {
            Route::Local { local_rank } => {
                let peer = self.peer_view(type_id, &partner, local_rank);
                let have_read = peer
                    .notifications()
                    .test(partner.remote_num_neighbors + partner.remote_comm_index);
                self.counters[type_id][idx].observe_ack(have_read)
            }
            Route::Remote => self.counters[type_id][idx].complete_write(),
        }
    }

    /// Spin until [`test_recv`](Self::test_recv) succeeds.
    #[doc(alias = "shan_comm_wait4Recv")]
    #[track_caller]
    pub fn wait_recv(&mut self, data: &Segment<C>, type_id: usize, idx: usize) {
        let policy = self.config.backoff;
        spin_until(policy, || self.test_recv(data, type_id, idx));
    }

    /// Spin until [`test_send`](Self::test_send) succeeds.
    #[doc(alias = "shan_comm_wait4Send")]
    #[track_caller]
    pub fn wait_send(&mut self, type_id: usize, idx: usize) {
        let policy = self.config.backoff;
        spin_until(policy, || self.test_send(type_id, idx));
    }

    /// Receive one message of `type_id` from every partner, in arrival order.
    #[doc(alias = "shan_comm_wait4AllRecv")]
    #[track_caller]
    pub fn wait_all_recv(&mut self, data: &Segment<C>, type_id: usize) {
        self.poll_all(type_id, |nh, idx| nh.test_recv(data, type_id, idx));
    }

    /// Complete one send of `type_id` to every partner.
    #[doc(alias = "shan_comm_wait4AllSend")]
    #[track_caller]
    pub fn wait_all_send(&mut self, type_id: usize) {
        self.poll_all(type_id, |nh, idx| nh.test_send(type_id, idx));
    }

    /// [`wait_all_recv`](Self::wait_all_recv), then
    /// [`wait_all_send`](Self::wait_all_send).
    #[doc(alias = "shan_comm_wait4All")]
    #[track_caller]
    pub fn wait_all(&mut self, data: &Segment<C>, type_id: usize) {
        self.wait_all_recv(data, type_id);
        self.wait_all_send(type_id);
    }

    #[track_caller]
    fn poll_all(&mut self, type_id: usize, mut test: impl FnMut(&mut Self, usize) -> bool) {
        assert!(
            type_id < self.layout.types.len(),
            "type id {type_id} out of range ({} types)",
            self.layout.types.len()
        );
        let n = self.partners.len();
        let mut done = std::mem::take(&mut self.done);
        done.clear();
        done.resize(n, false);
        let mut remaining = n;
        let mut backoff = Backoff::new(self.config.backoff);
        while remaining > 0 {
            let mut progressed = false;
            for idx in 0..n {
                if !done[idx] && test(self, idx) {
                    done[idx] = true;
                    remaining -= 1;
                    progressed = true;
                }
            }
            if progressed {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
        self.done = done;
    }
}

#[cfg(test)]
mod tests {
    use crate::comm::Communicator;
    use crate::config::ShanConfig;
    use crate::layout::TypeBounds;
    use crate::neighborhood::Neighborhood;
    use crate::segment::{Segment, SegmentBackend, SegmentKind};
    use crate::threads::ThreadWorld;
    use crate::wait::BackoffPolicy;

    fn config() -> ShanConfig {
        ShanConfig::default()
            .with_segment_backend(SegmentBackend::ProcessHeap)
            .with_backoff(BackoffPolicy::Yield)
    }

    fn bounds(nelem: i32) -> Vec<TypeBounds> {
        vec![TypeBounds {
            max_send_bytes: 8 * i64::from(nelem),
            max_recv_bytes: 8 * i64::from(nelem),
            max_nelem_send: nelem,
            max_nelem_recv: nelem,
        }]
    }

    /// Two ranks, one per node when `per_node` is 1, both on one node when 2.
    /// Sends `[me, me+10, me+20]` from sparse offsets and returns what arrived.
    fn pair_exchange(per_node: usize, variable: bool) -> Vec<Vec<f64>> {
        ThreadWorld::new(2, per_node)
            .run(|rank| {
                let me = rank.world.rank();
                let node = rank.world.split_shared().unwrap();
                let config = config().with_variable_message_len(variable);
                let mut nh = Neighborhood::init(
                    0,
                    &[1 - me],
                    &bounds(3),
                    &node,
                    &rank.world,
                    rank.fabric.clone(),
                    config.clone(),
                )
                .unwrap();
                let data = Segment::alloc(0, SegmentKind::Data, 256, &node, config.segment_backend).unwrap();
                let base = f64::from(me);
                data.write(0, &[base]);
                data.write(40, &[base + 10.0]);
                data.write(16, &[base + 20.0]);
                let meta = nh.type_offset(0);
                meta.set_send(0, 8, &[0, 40, 16]).unwrap();
                meta.set_recv(0, 8, &[128, 136, 144]).unwrap();
                nh.notify_or_write(&data, 0, 0);
                nh.wait_all(&data, 0);
                let mut got = [0.0f64; 3];
                data.read(128, &mut got);
                assert_eq!(nh.counters(0, 0).recv, 1);
                node.barrier().unwrap();
                nh.free().unwrap();
                data.free().unwrap();
                got.to_vec()
            })
            .unwrap()
    }

    #[test]
    fn local_partners_copy_in_place() {
        let got = pair_exchange(2, false);
        assert_eq!(got[0], vec![1.0, 11.0, 21.0]);
        assert_eq!(got[1], vec![0.0, 10.0, 20.0]);
    }

    #[test]
    fn remote_partners_receive_packed_slots() {
        let got = pair_exchange(1, false);
        assert_eq!(got[0], vec![1.0, 11.0, 21.0]);
        assert_eq!(got[1], vec![0.0, 10.0, 20.0]);
    }

    #[test]
    fn variable_length_adopts_sender_count() {
        for per_node in [1, 2] {
            let counts = ThreadWorld::new(2, per_node)
                .run(|rank| {
                    let me = rank.world.rank();
                    let node = rank.world.split_shared().unwrap();
                    let config = config().with_variable_message_len(true);
                    let mut nh = Neighborhood::init(
                        3,
                        &[1 - me],
                        &bounds(4),
                        &node,
                        &rank.world,
                        rank.fabric.clone(),
                        config.clone(),
                    )
                    .unwrap();
                    let data = Segment::alloc(3, SegmentKind::Data, 128, &node, config.segment_backend).unwrap();
                    let meta = nh.type_offset(0);
                    let sent: Vec<i64> = (0..=me as i64).map(|i| i * 8).collect();
                    meta.set_send(0, 8, &sent).unwrap();
                    meta.set_recv(0, 8, &[64, 72, 80, 88]).unwrap();
                    nh.notify_or_write(&data, 0, 0);
                    nh.wait_all(&data, 0);
                    let received = nh.type_offset(0).recv(0).unwrap().nelem;
                    node.barrier().unwrap();
                    nh.free().unwrap();
                    data.free().unwrap();
                    received
                })
                .unwrap();
            assert_eq!(counts, vec![2, 1]);
        }
    }

    #[test]
    fn send_is_pending_until_local_partner_reads() {
        let out = ThreadWorld::new(2, 2)
            .run(|rank| {
                let me = rank.world.rank();
                let node = rank.world.split_shared().unwrap();
                let mut nh = Neighborhood::init(0, &[1 - me], &bounds(1), &node, &rank.world, rank.fabric.clone(), config())
                    .unwrap();
                let data = Segment::alloc(0, SegmentKind::Data, 64, &node, SegmentBackend::ProcessHeap).unwrap();
                let meta = nh.type_offset(0);
                meta.set_send(0, 8, &[0]).unwrap();
                meta.set_recv(0, 8, &[8]).unwrap();
                let mut before = None;
                if me == 0 {
                    nh.notify_or_write(&data, 0, 0);
                    before = Some(nh.test_send(0, 0));
                }
                rank.world.barrier().unwrap();
                if me == 1 {
                    nh.wait_recv(&data, 0, 0);
                }
                rank.world.barrier().unwrap();
                if me == 0 {
                    nh.wait_send(0, 0);
                    assert_eq!(nh.counters(0, 0).outstanding(), 0);
                }
                rank.world.barrier().unwrap();
                nh.free().unwrap();
                data.free().unwrap();
                before
            })
            .unwrap();
        assert_eq!(out, vec![Some(false), None]);
    }

    #[test]
    fn remote_send_completes_before_it_is_read() {
        let out = ThreadWorld::new(2, 1)
            .run(|rank| {
                let me = rank.world.rank();
                let node = rank.world.split_shared().unwrap();
                let mut nh = Neighborhood::init(0, &[1 - me], &bounds(1), &node, &rank.world, rank.fabric.clone(), config())
                    .unwrap();
                let data = Segment::alloc(0, SegmentKind::Data, 64, &node, SegmentBackend::ProcessHeap).unwrap();
                let meta = nh.type_offset(0);
                meta.set_send(0, 8, &[0]).unwrap();
                meta.set_recv(0, 8, &[8]).unwrap();
                let mut before = None;
                if me == 0 {
                    nh.notify_or_write(&data, 0, 0);
                    // The receiver has not polled yet.
                    before = Some(nh.test_send(0, 0));
                }
                rank.world.barrier().unwrap();
                if me == 1 {
                    nh.wait_recv(&data, 0, 0);
                }
                rank.world.barrier().unwrap();
                nh.free().unwrap();
                data.free().unwrap();
                before
            })
            .unwrap();
        assert_eq!(out, vec![Some(true), None]);
    }

    #[test]
    #[should_panic(expected = "differs from receive size")]
    fn mismatched_element_size_panics() {
        let _ = ThreadWorld::new(2, 2).run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            let mut nh = Neighborhood::init(0, &[1 - me], &bounds(1), &node, &rank.world, rank.fabric.clone(), config())
                .unwrap();
            let data = Segment::alloc(0, SegmentKind::Data, 64, &node, SegmentBackend::ProcessHeap).unwrap();
            let meta = nh.type_offset(0);
            meta.set_send(0, 8, &[0]).unwrap();
            meta.set_recv(0, 4, &[8]).unwrap();
            rank.world.barrier().unwrap();
            if me == 0 {
                nh.notify_or_write(&data, 0, 0);
            } else {
                nh.wait_recv(&data, 0, 0);
            }
        });
    }
}
