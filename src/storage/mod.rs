//! Persistence layer
//!
//! `FlowStore` is the backend seam; `SqliteFlowStore` the production
//! implementation. `LinkageCoordinator` owns the atomic phase commit.

pub mod linkage;
pub mod sqlite;
pub mod traits;

pub use linkage::{CommitReport, LinkageCoordinator};
pub use sqlite::SqliteFlowStore;
pub use traits::{CommitBundle, FlowStore, OpenStore, StorageError, StorageResult};
