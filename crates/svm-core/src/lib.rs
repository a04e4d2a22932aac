//! svm-core — shared types for the streamvm instruction scheduler.
//!
//! - **`types`** — identifiers for logical objects, streams, stream types,
//!   and instructions
//! - **`id_alloc`** — fresh `LogicalObjectId` allocation
//! - **`config`** — resolved stream topology, loaded from TOML text or files

pub mod config;
pub mod id_alloc;
pub mod types;

pub use config::{ObjectConfig, SchedulerSettings, StreamConfig, TopologyConfig};
pub use id_alloc::LogicalObjectIdAllocator;
pub use types::*;
