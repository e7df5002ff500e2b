#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
// Life of a write:
// 1. A caller submits an offset/payload/flush/fua request to the pipeline.
// 2. The single-threaded build stage packs it into a logpack, inserting
//    padding at ring wraps and closing on FLUSH/FUA/capacity.
// 3. The pack's header and payload are written to the log device.
// 4. Once log-durable, the payload is submitted to the data device,
//    withheld behind any overlapping predecessor still in flight.
// 5. Once data-durable, the caller is replied to.
// 6. Periodically (or on FUA), the log device is flushed and permanent_lsid
//    advances.
// 7. Periodically, a checkpoint persists written_lsid into both super
//    sectors so a future attach knows where to resume redo.
//
// Crash recovery (redo) replays logpacks from the last checkpointed
// written_lsid forward into the data device before the pipeline starts.

pub mod checkpoint;
pub mod checksum;
pub mod control;
pub mod device;
pub mod error;
pub mod format;
pub mod freeze;
pub mod geometry;
pub mod lsid;
pub mod overlap;
pub mod pack;
pub mod pending;
pub mod pipeline;
pub mod redo;
pub mod sector;
#[cfg(test)]
pub mod testing;
pub mod wlog;

pub use control::{AttachHandle, Engine, StartParams};
pub use error::WalbError;
