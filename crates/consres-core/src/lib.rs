//! consres-core — shared types for the consumable-resource node selector.
//!
//! Holds the pieces every other crate needs: the hardware and partition
//! model, job demand records, the node bitmap, and the `cluster.toml`
//! configuration parser.

pub mod bitmap;
pub mod config;
pub mod hostlist;
pub mod types;

pub use bitmap::NodeBitmap;
pub use config::{ClusterConfig, ConfigError, SelectConfig, StateConfig};
pub use hostlist::expand_hostlist;
pub use types::*;
