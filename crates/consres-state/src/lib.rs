//! consres-state — checkpoint and restore of the job table.
//!
//! The blob is a flat little-endian byte stream: a header naming the
//! format, its versions and the granularity, then one record per job.
//! Node membership is not stored; it is rebuilt at load time from the
//! node names the job queue reports.
//!
//! Saves only happen when the engine's change generation has moved since
//! the last successful save. A blob whose header does not match the
//! running code is ignored and the engine starts clean.

pub mod codec;
pub mod error;
pub mod store;

pub use codec::{BlobHeader, PLUGIN_NAME, PSTATE_VERSION, plugin_version};
pub use error::{StateError, StateResult};
pub use store::{STATE_FILE, StateFile};
