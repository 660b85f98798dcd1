//! Double buffering: no silent overwrite, no early completion.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use shan::{Communicator, Neighborhood, Segment, SegmentKind, ThreadWorld};

#[test]
fn second_local_send_waits_for_first_read() {
    let consumed = AtomicBool::new(false);
    let config = common::config();
    ThreadWorld::new(2, 2)
        .run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            let mut nh = Neighborhood::init(
                0,
                &[1 - me],
                &[common::doubles(1)],
                &node,
                &rank.world,
                rank.fabric.clone(),
                config.clone(),
            )
            .unwrap();
            let data = Segment::alloc(0, SegmentKind::Data, 64, &node, config.segment_backend).unwrap();
            let meta = nh.type_offset(0);
            meta.set_send(0, 8, &[0]).unwrap();
            meta.set_recv(0, 8, &[8]).unwrap();
            rank.world.barrier().unwrap();

            if me == 0 {
                data.write(0, &[1.0f64]);
                nh.notify_or_write(&data, 0, 0);
                nh.notify_or_write(&data, 0, 0);
                assert!(consumed.load(Ordering::SeqCst), "second send returned before the first read");
                nh.wait_send(0, 0);
            } else {
                thread::sleep(Duration::from_millis(50));
                consumed.store(true, Ordering::SeqCst);
                nh.wait_recv(&data, 0, 0);
                nh.wait_recv(&data, 0, 0);
                assert_eq!(nh.counters(0, 0).recv, 2);
            }
            rank.world.barrier().unwrap();
            nh.free().unwrap();
            data.free().unwrap();
        })
        .unwrap();
}

#[test]
fn acknowledgement_follows_consumption() {
    let config = common::config();
    ThreadWorld::new(2, 2)
        .run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            let mut nh = Neighborhood::init(
                1,
                &[1 - me],
                &[common::doubles(2)],
                &node,
                &rank.world,
                rank.fabric.clone(),
                config.clone(),
            )
            .unwrap();
            let data = Segment::alloc(1, SegmentKind::Data, 64, &node, config.segment_backend).unwrap();
            let meta = nh.type_offset(0);
            meta.set_send(0, 8, &[0, 8]).unwrap();
            meta.set_recv(0, 8, &[16, 24]).unwrap();

            if me == 0 {
                nh.notify_or_write(&data, 0, 0);
                for _ in 0..100 {
                    assert!(!nh.test_send(0, 0));
                }
                assert_eq!(nh.counters(0, 0).ack, 0);
            }
            rank.world.barrier().unwrap();
            if me == 1 {
                assert!(nh.test_recv(&data, 0, 0));
                assert!(!nh.test_recv(&data, 0, 0));
            }
            rank.world.barrier().unwrap();
            if me == 0 {
                assert!(nh.test_send(0, 0));
                assert!(!nh.test_send(0, 0));
                assert_eq!(nh.counters(0, 0).outstanding(), 0);
            }
            rank.world.barrier().unwrap();
            nh.free().unwrap();
            data.free().unwrap();
        })
        .unwrap();
}

#[test]
fn remote_sends_alternate_generations() {
    let config = common::config();
    ThreadWorld::new(2, 1)
        .run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            let mut nh = Neighborhood::init(
                2,
                &[1 - me],
                &[common::doubles(1)],
                &node,
                &rank.world,
                rank.fabric.clone(),
                config.clone(),
            )
            .unwrap();
            let data = Segment::alloc(2, SegmentKind::Data, 64, &node, config.segment_backend).unwrap();
            let meta = nh.type_offset(0);
            meta.set_send(0, 8, &[0]).unwrap();
            meta.set_recv(0, 8, &[8]).unwrap();

            // two messages in flight fit the two generations
            if me == 0 {
                data.write(0, &[10.0f64]);
                nh.notify_or_write(&data, 0, 0);
                data.write(0, &[20.0f64]);
                nh.notify_or_write(&data, 0, 0);
                assert_eq!(nh.counters(0, 0).send, 2);
            }
            rank.world.barrier().unwrap();
            if me == 1 {
                let mut got = [0.0f64];
                nh.wait_recv(&data, 0, 0);
                data.read(8, &mut got);
                assert_eq!(got, [10.0]);
                nh.wait_recv(&data, 0, 0);
                data.read(8, &mut got);
                assert_eq!(got, [20.0]);
            }
            rank.world.barrier().unwrap();
            nh.free().unwrap();
            data.free().unwrap();
        })
        .unwrap();
}

#[test]
#[should_panic(expected = "sequence 3 received while expecting 1")]
fn remote_overwrite_is_detected() {
    let config = common::config();
    let _ = ThreadWorld::new(2, 1).run(|rank| {
        let me = rank.world.rank();
        let node = rank.world.split_shared().unwrap();
        let mut nh = Neighborhood::init(
            3,
            &[1 - me],
            &[common::doubles(1)],
            &node,
            &rank.world,
            rank.fabric.clone(),
            config.clone(),
        )
        .unwrap();
        let data = Segment::alloc(3, SegmentKind::Data, 64, &node, config.segment_backend).unwrap();
        let meta = nh.type_offset(0);
        meta.set_send(0, 8, &[0]).unwrap();
        meta.set_recv(0, 8, &[8]).unwrap();
        if me == 0 {
            for _ in 0..3 {
                nh.notify_or_write(&data, 0, 0);
            }
        }
        rank.world.barrier().unwrap();
        if me == 1 {
            nh.test_recv(&data, 0, 0);
        }
    });
}
