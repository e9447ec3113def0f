//! Multi-version node and edge storage.
//!
//! The store keeps every committed version of an entity stamped with the
//! commit id that produced it. Readers resolve the newest version at or
//! below their snapshot; the transaction manager is the only writer.

mod mutation;
mod mvcc;
mod patch;
mod store;
mod types;

pub use mutation::Mutation;
pub use mvcc::{PruneOutcome, Version, VersionChain};
pub use patch::{clean_props, PropPatch, PropPatchOp};
pub use store::{GraphStore, VacuumStats};
pub use types::{
    DeleteMode, Direction, EdgeRecord, GraphStats, NodeRecord, PropertyFilter, PropertyMap,
};
