//! Eviction side of semcache
//!
//! - **LivenessStore**: key → liveness ledger (`LocalStore`,
//!   `DistributedStore`, `NoOpStore`)
//! - **EvictionPolicy**: chooses and builds the store from configuration
//! - **EvictionCoordinator**: marks keys dead and decides when to rebuild
//!
//! Nothing here mutates the vector index.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod coordinator;
pub mod distributed;
pub mod kv;
pub mod local;
pub mod noop;
pub mod policy;
pub mod store;

pub use coordinator::{EvictionCoordinator, RebuildSignal};
pub use distributed::{DistributedOptions, DistributedStore};
pub use kv::{KvBackend, MemoryKv};
pub use local::{LocalStore, OnEvict};
pub use noop::NoOpStore;
pub use policy::EvictionPolicy;
pub use store::LivenessStore;
