//! A setup that fails part way is reported on every rank and leaves nothing
//! behind that a later attempt would trip over.

mod common;

use shan::{
    Communicator, Error, Fabric, FabricError, Neighborhood, Segment, SegmentBackend, SegmentKind, ThreadWorld,
};

#[test]
fn failed_init_releases_the_fabric_segment() {
    common::init_tracing();
    let out = ThreadWorld::new(2, 1)
        .run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            // The remote segment binds, then the Type segment cannot be created.
            let native = common::config().with_segment_backend(SegmentBackend::NativeWindow);
            let failed = Neighborhood::init(3, &[1 - me], &[common::doubles(2)], &node, &rank.world, rank.fabric.clone(), native);
            let unsupported = matches!(failed, Err(Error::NotSupported(_)));
            let left_bound = rank.fabric.segment_list();
            rank.world.barrier().unwrap();

            let nh = Neighborhood::init(
                3,
                &[1 - me],
                &[common::doubles(2)],
                &node,
                &rank.world,
                rank.fabric.clone(),
                common::config(),
            )
            .unwrap();
            let bound = rank.fabric.segment_list();
            nh.free().unwrap();
            (unsupported, left_bound, bound, rank.fabric.segment_list())
        })
        .unwrap();
    for (unsupported, left_bound, bound, after_free) in out {
        assert!(unsupported);
        assert!(left_bound.is_empty());
        assert_eq!(bound, vec![3]);
        assert!(after_free.is_empty());
    }
}

#[test]
fn dropped_neighborhood_stops_accepting_writes() {
    common::init_tracing();
    let out = ThreadWorld::new(2, 1)
        .run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            let nh = Neighborhood::init(
                0,
                &[1 - me],
                &[common::doubles(1)],
                &node,
                &rank.world,
                rank.fabric.clone(),
                common::config(),
            )
            .unwrap();
            rank.world.barrier().unwrap();
            if me == 1 {
                drop(nh);
                rank.world.barrier().unwrap();
                return true;
            }
            rank.world.barrier().unwrap();
            // Rank 1's remote memory is gone; the fabric must not reach it.
            let write = rank.fabric.write_notify(0, 0, 1, 0, 8, 0, 1, 0);
            drop(nh);
            matches!(write, Err(FabricError::Unreachable { segment: 0, rank: 1 }))
        })
        .unwrap();
    assert_eq!(out, vec![true, true]);
}

#[test]
fn owner_side_posix_failure_reaches_every_rank() {
    common::init_tracing();
    let out = ThreadWorld::new(2, 2)
        .run(|rank| {
            let node = rank.world.split_shared().unwrap();
            // Two parts of 2^62 bytes do not fit in an off_t, so only local
            // rank 0 fails, while creating the object.
            let huge = Segment::alloc(9, SegmentKind::Data, 1usize << 62, &node, SegmentBackend::Posix);
            let reported = match (node.rank(), huge) {
                (0, Err(Error::Io(_))) => true,
                (_, Err(Error::PeerFailure(_))) => true,
                _ => false,
            };
            // The node is still usable afterwards.
            let seg = Segment::alloc(9, SegmentKind::Data, 64, &node, SegmentBackend::Posix).unwrap();
            seg.free().unwrap();
            reported
        })
        .unwrap();
    assert_eq!(out, vec![true, true]);
}
