//! Parent/child profile hierarchies.
//!
//! - [`HierarchyMerger`] serves reads of children through their parents
//! - [`HierarchyLinker`] attaches children to parents
//! - [`CascadeDeleter`] removes profiles without breaking the hierarchy

mod cascade;
mod link;
mod merge;

pub use cascade::{CascadeDeleter, DeletionPlan};
pub use link::HierarchyLinker;
pub use merge::HierarchyMerger;
