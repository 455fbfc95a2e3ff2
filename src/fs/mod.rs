//! FUSE filesystem implementation
//!
//! Bridges the kernel's inode-addressed protocol to the path-based
//! dispatcher.

mod filesystem;
mod inode;

pub use filesystem::PrismaFs;
pub use inode::{InodeTable, ROOT_INO, UNKNOWN_INO};
