//! Region balancer for a placement driver
//!
//! This crate is the balance-plan decision engine of a placement driver for
//! a sharded, multi-replica storage cluster. Given a consistent snapshot of
//! stores, regions, and replica placements, it decides:
//! - which region to move, which source replica to retire, and which target
//!   store to grow (resource balancing)
//! - how to reconcile a region whose replica count diverges from the
//!   configured target (replica-count reconciliation)
//! - in what order membership changes apply so quorum is never lost
//!
//! Plan execution, the server process, and metadata persistence live in the
//! enclosing placement driver; this crate performs no I/O.

pub mod balancer;
pub mod cluster;
pub mod config;
pub mod filter;
pub mod operator;

// Re-export main types
pub use balancer::{
    leader_score, store_score, BalanceError, Balancer, DefaultBalancer, ResourceBalancer,
};
pub use cluster::{
    AllocError, ClusterMeta, ClusterSnapshot, ClusterView, IdAllocator, MonotonicIdAllocator,
    Peer, PeerId, Region, RegionId, Store, StoreId, StoreStats,
};
pub use config::{BalanceConfig, ConfigError};
pub use filter::{CapacityFilter, Filter, SnapCountFilter};
pub use operator::{BalanceOperator, OnceOperator, Operator};
