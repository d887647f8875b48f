//! Cache-allocation (CAT) partitioning chain
//!
//! Strict dependency order: topology discovery feeds the mask allocator,
//! whose mask the programmer writes, the verifier cross-checks, and the
//! restorer tears down. The root group must relinquish ways before the
//! workload group can claim them exclusively.

mod mask;
mod partition;
mod topology;

pub use mask::{percent_to_exclusive_mask, validate_percent, WayMask};
pub use partition::{Partition, PartitionProgrammer, PartitionRestorer, PartitionVerifier, ResctrlFs};
pub use topology::CacheTopology;
