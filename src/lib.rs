//! prismafs - Layered userspace filesystem inspired by Plan 9
//!
//! Several directory trees (layers) are bound at one mount point and
//! presented as a single merged tree. The topmost layer is writable; every
//! other layer is read-only. Modifying a lower-layer entry copies it up into
//! the writable layer first, and deleting one records a whiteout marker.

pub mod cache;
pub mod config;
pub mod copyup;
pub mod dispatch;
pub mod error;
pub mod fs;
pub mod layer;
pub mod lock;
pub mod namespace;
pub mod resolver;
pub mod vpath;
pub mod whiteout;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, LayerSpec};
    pub use crate::dispatch::{Dispatcher, SetAttr};
    pub use crate::error::{Error, Result};
    pub use crate::layer::{LayerStack, StackOptions};
    pub use crate::namespace::Namespace;
    pub use crate::resolver::{PathResolver, Resolution};
    pub use crate::vpath::VirtualPath;
}
