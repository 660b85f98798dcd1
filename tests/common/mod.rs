#![allow(dead_code)]

use shan::{BackoffPolicy, SegmentBackend, ShanConfig, TypeBounds};
use tracing_subscriber::EnvFilter;

/// Install a test-friendly subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Heap-backed segments and yielding waits: many thread-ranks share few cores.
pub fn config() -> ShanConfig {
    ShanConfig::default()
        .with_segment_backend(SegmentBackend::ProcessHeap)
        .with_backoff(BackoffPolicy::Yield)
}

/// One type carrying up to `nelem` doubles each way.
pub fn doubles(nelem: i32) -> TypeBounds {
    TypeBounds {
        max_send_bytes: 8 * i64::from(nelem),
        max_recv_bytes: 8 * i64::from(nelem),
        max_nelem_send: nelem,
        max_nelem_recv: nelem,
    }
}
