//! consres-select — consumable-resource node selection.
//!
//! Tracks which CPUs, cores, sockets and memory every running job holds on
//! every node, and decides where new jobs may go. The engine supports
//! partitions that time-slice nodes into rows, so several jobs can share a
//! node when the partition allows it.

pub mod avail;
pub mod classify;
pub mod consec;
pub mod dist;
pub mod engine;
pub mod error;
pub mod job_table;
pub mod node_table;
pub mod queue;
pub mod select;

pub use engine::{
    PlaceMode, PlaceRequest, PlaceStatus, Placement, SelectEngine, SharedEngine, StepRecord,
    epoch_secs,
};
pub use error::{SelectError, SelectResult};
pub use job_table::{AppliedFlags, JobResources, JobTable, SavedAllocation};
pub use node_table::{NodeTable, PartitionId};
pub use queue::{JobDirectory, JobQueue, QueueState, QueuedJob};
