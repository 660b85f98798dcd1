//! Slot geometry is a pure function of the global bounds.

mod common;

use proptest::prelude::*;
use shan::{page_size, Communicator, Layout, Neighborhood, ThreadWorld, TypeBounds, HEADER_LEN};

#[test]
fn independent_neighborhoods_share_geometry() {
    let config = common::config();
    let layouts = ThreadWorld::new(3, 3)
        .run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            let partners: Vec<i32> = (0..3).filter(|&r| r != me).collect();
            let bounds = [common::doubles(4), common::doubles(1)];
            let a = Neighborhood::init(0, &partners, &bounds, &node, &rank.world, rank.fabric.clone(), config.clone())
                .unwrap();
            let b = Neighborhood::init(1, &partners, &bounds, &node, &rank.world, rank.fabric.clone(), config.clone())
                .unwrap();
            assert_eq!(a.layout(), b.layout());
            let layout = a.layout().clone();
            a.free().unwrap();
            b.free().unwrap();
            layout
        })
        .unwrap();
    assert!(layouts.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn bounds_are_maximised_across_ranks() {
    let config = common::config();
    let layouts = ThreadWorld::new(2, 1)
        .run(|rank| {
            let me = rank.world.rank();
            let node = rank.world.split_shared().unwrap();
            // only rank 1 asks for a large receive
            let bounds = [TypeBounds {
                max_send_bytes: 16,
                max_recv_bytes: if me == 1 { 4096 } else { 16 },
                max_nelem_send: 2,
                max_nelem_recv: 2 + me,
            }];
            let nh = Neighborhood::init(4, &[1 - me], &bounds, &node, &rank.world, rank.fabric.clone(), config.clone())
                .unwrap();
            let elem = nh.layout().types[0].clone();
            nh.free().unwrap();
            elem
        })
        .unwrap();
    assert_eq!(layouts[0], layouts[1]);
    assert_eq!(layouts[0].max_nelem_recv, 3);
    assert!(layouts[0].max_recv_sz >= 4096 + HEADER_LEN);
}

fn bounds_strategy() -> impl Strategy<Value = TypeBounds> {
    (0i64..5000, 0i64..5000, 0i32..64, 0i32..64).prop_map(|(s, r, ns, nr)| TypeBounds {
        max_send_bytes: s,
        max_recv_bytes: r,
        max_nelem_send: ns,
        max_nelem_recv: nr,
    })
}

proptest! {
    #[test]
    fn slots_are_aligned_disjoint_and_inside_the_segment(
        bounds in prop::collection::vec(bounds_strategy(), 1..5),
        nn in 1usize..9,
        shift in 4u32..9,
    ) {
        let alignment = 1usize << shift;
        let layout = Layout::compute(&bounds, nn, alignment, page_size()).unwrap();
        prop_assert_eq!(&layout, &Layout::compute(&bounds, nn, alignment, page_size()).unwrap());
        prop_assert_eq!(layout.remote_size % page_size(), 0);

        let mut spans = Vec::new();
        for elem in &layout.types {
            prop_assert_eq!(elem.max_send_sz % alignment, 0);
            prop_assert_eq!(elem.max_recv_sz % alignment, 0);
            for idx in 0..nn {
                for generation in 0..2 {
                    spans.push((elem.send_slot(nn, idx, generation), elem.max_send_sz));
                    spans.push((elem.recv_slot(nn, idx, generation), elem.max_recv_sz));
                }
            }
        }
        spans.sort_unstable();
        for pair in spans.windows(2) {
            prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlap {:?}", pair);
        }
        let (last, len) = spans[spans.len() - 1];
        prop_assert!(last + len <= layout.remote_size);
    }
}
