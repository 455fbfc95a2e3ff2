//! Virtual paths
//!
//! A virtual path is the lookup key for an entry in the composed namespace,
//! relative to the mount point. It is always normalized: no `.` or `..`
//! components, no leading or trailing separator. The empty path is the root.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Prefix reserved for whiteout markers and internal temporaries
pub const RESERVED_PREFIX: &str = ".wh.";

/// Normalized path relative to the mount point
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct VirtualPath(PathBuf);

impl VirtualPath {
    /// The root of the namespace
    pub fn root() -> Self {
        VirtualPath(PathBuf::new())
    }

    /// Parse and normalize a path. Leading `/` is accepted, `..` is rejected.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut normalized = PathBuf::new();
        for component in path.as_ref().components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => normalized.push(name),
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(Error::InvalidPath(
                        path.as_ref().to_string_lossy().to_string(),
                    ));
                }
            }
        }
        Ok(VirtualPath(normalized))
    }

    /// Append a single name component
    pub fn join<N: AsRef<OsStr>>(&self, name: N) -> Result<Self> {
        let name = name.as_ref();
        validate_name(name)?;
        Ok(VirtualPath(self.0.join(name)))
    }

    pub fn is_root(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// Parent path, `None` for the root
    pub fn parent(&self) -> Option<VirtualPath> {
        if self.is_root() {
            return None;
        }
        Some(VirtualPath(
            self.0.parent().map(Path::to_path_buf).unwrap_or_default(),
        ))
    }

    /// Final component, `None` for the root
    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.file_name()
    }

    /// Strict ancestors from the topmost directory down, excluding the root
    /// and the path itself: `a/b/c` yields `a`, `a/b`.
    pub fn ancestors(&self) -> Vec<VirtualPath> {
        let mut out = Vec::new();
        let mut current = PathBuf::new();
        let components: Vec<_> = self.0.components().collect();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            current.push(component.as_os_str());
            out.push(VirtualPath(current.clone()));
        }
        out
    }

    /// Number of components
    pub fn depth(&self) -> usize {
        self.0.components().count()
    }

    /// True if `self` equals `other` or lies below it
    pub fn starts_with(&self, other: &VirtualPath) -> bool {
        self.0.starts_with(&other.0)
    }

    /// Rewrite the `from` prefix of this path to `to`
    pub fn rebase(&self, from: &VirtualPath, to: &VirtualPath) -> Option<VirtualPath> {
        let rest = self.0.strip_prefix(&from.0).ok()?;
        if rest.as_os_str().is_empty() {
            return Some(to.clone());
        }
        Some(VirtualPath(to.0.join(rest)))
    }

    /// Relative form, suitable for joining onto a layer root
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Physical location of this path below `root`
    pub fn under(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            root.to_path_buf()
        } else {
            root.join(&self.0)
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.display())
    }
}

/// Reject empty names, separators, dot entries and reserved names
pub fn validate_name(name: &OsStr) -> Result<()> {
    let lossy = name.to_string_lossy();
    if name.is_empty() || name == "." || name == ".." || lossy.contains('/') {
        return Err(Error::InvalidName(lossy.to_string()));
    }
    if is_reserved(name) {
        return Err(Error::InvalidName(lossy.to_string()));
    }
    Ok(())
}

/// Names used for whiteouts, opaque markers and copy-up temporaries
pub fn is_reserved(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with(RESERVED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes() {
        let path = VirtualPath::parse("/a//b/./c/").unwrap();
        assert_eq!(path.as_path(), Path::new("a/b/c"));
        assert_eq!(path.to_string(), "/a/b/c");
        assert!(VirtualPath::parse("/").unwrap().is_root());
        assert!(VirtualPath::parse("a/../b").is_err());
    }

    #[test]
    fn test_ancestors() {
        let path = VirtualPath::parse("a/b/c").unwrap();
        let ancestors: Vec<String> = path.ancestors().iter().map(|p| p.to_string()).collect();
        assert_eq!(ancestors, vec!["/a", "/a/b"]);
        assert!(VirtualPath::root().ancestors().is_empty());
        assert!(VirtualPath::parse("a").unwrap().ancestors().is_empty());
    }

    #[test]
    fn test_parent_and_name() {
        let path = VirtualPath::parse("a/b").unwrap();
        assert_eq!(path.parent().unwrap(), VirtualPath::parse("a").unwrap());
        assert_eq!(path.file_name().unwrap(), "b");
        assert_eq!(VirtualPath::parse("a").unwrap().parent().unwrap(), VirtualPath::root());
        assert!(VirtualPath::root().parent().is_none());
    }

    #[test]
    fn test_join_rejects_reserved_and_separators() {
        let root = VirtualPath::root();
        assert!(root.join(".wh.foo").is_err());
        assert!(root.join("a/b").is_err());
        assert!(root.join("..").is_err());
        assert_eq!(root.join("x").unwrap().to_string(), "/x");
    }

    #[test]
    fn test_rebase() {
        let path = VirtualPath::parse("a/b/c").unwrap();
        let from = VirtualPath::parse("a").unwrap();
        let to = VirtualPath::parse("z/y").unwrap();
        assert_eq!(path.rebase(&from, &to).unwrap().to_string(), "/z/y/b/c");
        assert_eq!(from.rebase(&from, &to).unwrap(), to);
    }
}
