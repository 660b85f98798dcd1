//! Ring exchange over a neighborhood.
//!
//! Every rank exchanges three doubles with both ring neighbors for a number
//! of iterations and checks what arrives.
//!
//! Run with: cargo build --features mpi --example ring_exchange && mpiexec -n 4 ./target/debug/examples/ring_exchange

use shan::{Communicator, Mpi, Neighborhood, RmaFabric, Segment, SegmentKind, ShanConfig, TypeBounds};

const ITERATIONS: usize = 100;

fn main() -> Result<(), shan::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mpi = Mpi::init()?;
    let world = mpi.world();
    let node = world.split_shared()?;
    let (me, n) = (world.rank(), world.size());
    if n < 2 {
        eprintln!("ring_exchange needs at least 2 ranks");
        return Ok(());
    }
    let partners: Vec<i32> = if n == 2 {
        vec![1 - me]
    } else {
        vec![(me + n - 1) % n, (me + 1) % n]
    };

    let config = ShanConfig::from_env()?;
    let bounds = [TypeBounds {
        max_send_bytes: 24,
        max_recv_bytes: 24,
        max_nelem_send: 3,
        max_nelem_recv: 3,
    }];
    let mut nh = Neighborhood::init(0, &partners, &bounds, &node, &world, RmaFabric::new(&world), config.clone())?;
    let data = Segment::alloc(0, SegmentKind::Data, 256, &node, config.segment_backend)?;

    let meta = nh.type_offset(0);
    for idx in 0..partners.len() {
        let send = idx as i64 * 24;
        let recv = 128 + idx as i64 * 24;
        meta.set_send(idx, 8, &[send, send + 8, send + 16])?;
        meta.set_recv(idx, 8, &[recv, recv + 8, recv + 16])?;
    }

    let start = Mpi::wtime();
    let mut checksum = 0.0;
    for k in 1..=ITERATIONS {
        for idx in 0..partners.len() {
            data.write(idx * 24, &[k as f64; 3]);
            nh.notify_or_write(&data, 0, idx);
        }
        nh.wait_all(&data, 0);
        for idx in 0..partners.len() {
            let mut got = [0.0f64; 3];
            data.read(128 + idx * 24, &mut got);
            assert_eq!(got, [k as f64; 3]);
            checksum += got.iter().sum::<f64>();
        }
    }
    let elapsed = Mpi::wtime() - start;

    let expected = (partners.len() * 3 * ITERATIONS * (ITERATIONS + 1) / 2) as f64;
    println!(
        "rank {me}: checksum {checksum} (expected {expected}), {:.2} us/iteration, {} local partner(s)",
        elapsed * 1e6 / ITERATIONS as f64,
        nh.partners().iter().filter(|p| p.is_local()).count()
    );

    node.barrier()?;
    nh.free()?;
    data.free()?;
    Ok(())
}
