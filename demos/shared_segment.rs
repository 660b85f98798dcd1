//! Node-local shared segment.
//!
//! Every rank writes its rank into its own part of a shared segment, then
//! reads the parts of all other ranks on the node directly.
//!
//! Run with: cargo build --features mpi --example shared_segment && mpiexec -n 4 ./target/debug/examples/shared_segment

use shan::{Communicator, Mpi, Segment, SegmentBackend, SegmentKind};

fn main() -> Result<(), shan::Error> {
    let mpi = Mpi::init()?;
    let world = mpi.world();
    let node = world.split_shared()?;

    for backend in [SegmentBackend::Posix, SegmentBackend::NativeWindow] {
        let segment = Segment::alloc(0, SegmentKind::Data, 64, &node, backend)?;
        segment.write(0, &[world.rank()]);
        node.barrier()?;

        let mut seen = Vec::with_capacity(segment.num_local());
        for local in 0..segment.num_local() {
            let mut v = [0i32];
            segment.region(local).read_bytes(0, bytemuck::cast_slice_mut(&mut v));
            seen.push(v[0]);
        }
        println!(
            "{backend:?}: world rank {} (local {}) sees {seen:?}",
            world.rank(),
            node.rank()
        );
        segment.free()?;
    }
    Ok(())
}
