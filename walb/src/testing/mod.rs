//! Test-only helpers: an in-memory formatted-and-attached engine, and a
//! tracing subscriber installed once per process.

use std::sync::{Arc, Once};

use crate::control::{format_log, random_salt, random_uuid, Engine, StartParams};
use crate::device::{BlockDevice, MemDevice};
use crate::geometry::Geometry;

static TRACING_INIT: Once = Once::new();

/// Install a tracing subscriber reading `RUST_LOG`, defaulting to `info`.
/// Safe to call from every test; only the first call takes effect.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .with_test_writer()
            .try_init();
    });
}

/// Format and attach a fresh in-memory engine with `ring_buffer_size` `pb` of
/// log and `data_pb` `pb` of data, each call getting a distinct random uuid
/// and checksum salt.
pub fn new_test_engine(ring_buffer_size: u64, data_pb: u64) -> Arc<Engine> {
    init_tracing();
    let geometry = Geometry::new(512, 4096, 0, ring_buffer_size).unwrap();
    let log: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096, ring_buffer_size + 16));
    let data: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(512, data_pb));

    format_log(log.as_ref(), &geometry, random_uuid(), "walb_test".to_string(), random_salt()).unwrap();
    let (engine, _handle) = Engine::attach(log, data, &StartParams::default(), false).unwrap();
    engine
}
