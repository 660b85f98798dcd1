//! Sent bytes arrive exactly, for local and remote partners and several types.

mod common;

use shan::{
    Communicator, Negotiation, Neighborhood, Segment, SegmentBackend, SegmentKind, ShanConfig,
    ThreadWorld, TypeBounds,
};

/// Layout of the data segment: per partner, a 64-byte send area and a 64-byte
/// receive area for each of the two types.
fn area(kind: usize, type_id: usize, idx: usize) -> usize {
    ((idx * 2 + type_id) * 2 + kind) * 64
}

fn pattern(from: i32, to: i32, type_id: usize, i: usize) -> u32 {
    (from as u32) << 24 | (to as u32) << 16 | (type_id as u32) << 8 | i as u32
}

fn exchange(config: ShanConfig) {
    let bounds = [
        common::doubles(3),
        TypeBounds {
            max_send_bytes: 20,
            max_recv_bytes: 20,
            max_nelem_send: 5,
            max_nelem_recv: 5,
        },
    ];
    ThreadWorld::with_nodes(vec![0, 0, 1])
        .run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            let partners: Vec<i32> = (0..3).filter(|&r| r != me).collect();
            let mut nh = Neighborhood::init(
                9,
                &partners,
                &bounds,
                &node,
                &rank.world,
                rank.fabric.clone(),
                config.clone(),
            )
            .unwrap();
            let data = Segment::alloc(9, SegmentKind::Data, 1024, &node, config.segment_backend).unwrap();

            for (idx, &p) in partners.iter().enumerate() {
                // type 0: three doubles, gathered in reverse order
                let doubles: Vec<f64> = (0..3).map(|i| f64::from(pattern(me, p, 0, i))).collect();
                data.write(area(0, 0, idx), &doubles);
                let send: Vec<i64> = (0..3).rev().map(|i| (area(0, 0, idx) + 8 * i) as i64).collect();
                let recv: Vec<i64> = (0..3).map(|i| (area(1, 0, idx) + 8 * i) as i64).collect();
                nh.type_offset(0).set_send(idx, 8, &send).unwrap();
                nh.type_offset(0).set_recv(idx, 8, &recv).unwrap();

                // type 1: five u32 scattered with a stride of 12 bytes
                let words: Vec<u32> = (0..5).map(|i| pattern(me, p, 1, i)).collect();
                data.write(area(0, 1, idx), &words);
                let send: Vec<i64> = (0..5).map(|i| (area(0, 1, idx) + 4 * i) as i64).collect();
                let recv: Vec<i64> = (0..5).map(|i| (area(1, 1, idx) + 12 * i) as i64).collect();
                nh.type_offset(1).set_send(idx, 4, &send).unwrap();
                nh.type_offset(1).set_recv(idx, 4, &recv).unwrap();
            }

            for type_id in 0..2 {
                for idx in 0..partners.len() {
                    nh.notify_or_write(&data, type_id, idx);
                }
            }
            nh.wait_all(&data, 1);
            nh.wait_all(&data, 0);

            for (idx, &p) in partners.iter().enumerate() {
                let mut doubles = [0.0f64; 3];
                data.read(area(1, 0, idx), &mut doubles);
                let expected: Vec<f64> = (0..3).rev().map(|i| f64::from(pattern(p, me, 0, i))).collect();
                assert_eq!(doubles.to_vec(), expected, "type 0 from {p}");

                for i in 0..5 {
                    let mut word = [0u32];
                    data.read(area(1, 1, idx) + 12 * i, &mut word);
                    assert_eq!(word[0], pattern(p, me, 1, i), "type 1 element {i} from {p}");
                }
            }
            node.barrier().unwrap();
            nh.free().unwrap();
            data.free().unwrap();
        })
        .unwrap();
}

#[test]
fn heap_segments_point_to_point_negotiation() {
    common::init_tracing();
    exchange(common::config());
}

#[test]
fn posix_segments_allgather_negotiation() {
    exchange(
        common::config()
            .with_segment_backend(SegmentBackend::Posix)
            .with_negotiation(Negotiation::AllGather),
    );
}

#[test]
fn unvalidated_rosters_with_large_alignment() {
    exchange(common::config().with_validate_roster(false).with_alignment(256));
}
