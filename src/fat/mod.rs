//! The cluster allocation table engine.

pub mod alloc;
pub mod chain;
pub mod codec;
pub mod mirror;
pub mod table;
pub mod volume;

pub use alloc::{AllocMode, ClusterRun};
pub use chain::{ChainAnchor, ChainHandle, ChainPoint, ContigRequest};
pub use codec::{Classification, ClusterId, EntryCodec, MIN_CLUSTER};
pub use table::{AllocationCursor, ClusterTable, TableGuard};
pub use volume::{FatType, VolumeGeometry};
