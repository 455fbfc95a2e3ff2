//! Layer store
//!
//! Ordered backing trees and the storage capability each one exposes.

mod attr;
mod backend;
mod stack;

pub use attr::{EntryAttr, EntryKind};
pub use backend::{FsStats, LayerBackend, LayerDirEntry, LocalBackend};
pub use stack::{paths_overlap, validate_specs, Layer, LayerId, LayerStack, Mutability, StackOptions};
