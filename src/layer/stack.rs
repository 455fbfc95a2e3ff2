//! Layers and layer stacks
//!
//! A stack is the ordered set of layers bound at one mount point. Rank 0 has
//! the highest precedence and is the only writable layer.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use super::backend::{LayerBackend, LocalBackend};
use crate::cache::ResolveCache;
use crate::config::LayerSpec;
use crate::error::{Error, Result};

/// Stable layer identity, derived from the canonical root path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerId(String);

impl LayerId {
    pub fn for_root(root: &Path) -> Self {
        let digest = blake3::hash(root.as_os_str().as_encoded_bytes());
        LayerId(hex::encode(&digest.as_bytes()[..6]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a layer accepts writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    Writable,
    ReadOnly,
}

/// One backing tree in a stack
#[derive(Debug, Clone)]
pub struct Layer {
    pub id: LayerId,
    pub rank: usize,
    pub mutability: Mutability,
    backend: Arc<dyn LayerBackend>,
}

impl Layer {
    pub fn new(rank: usize, mutability: Mutability, backend: Arc<dyn LayerBackend>) -> Self {
        Self {
            id: LayerId::for_root(backend.root()),
            rank,
            mutability,
            backend,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.mutability == Mutability::Writable
    }

    pub fn root(&self) -> &Path {
        self.backend.root()
    }

    pub fn backend(&self) -> &dyn LayerBackend {
        self.backend.as_ref()
    }
}

/// Options applied to every stack built by the namespace
#[derive(Debug, Clone, Default)]
pub struct StackOptions {
    /// Resolution cache entries, 0 disables the cache
    pub cache_capacity: usize,
    /// Omit dot-files from merged listings
    pub hide_dotfiles: bool,
}

/// Ordered layers bound to one mount point
pub struct LayerStack {
    mount_point: PathBuf,
    layers: Vec<Layer>,
    options: StackOptions,
    cache: Option<ResolveCache>,
}

impl fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStack")
            .field("mount_point", &self.mount_point)
            .field("layers", &self.layers)
            .finish()
    }
}

impl LayerStack {
    /// Build a stack of local layers from ordered specifications
    pub fn from_specs(mount_point: &Path, specs: &[LayerSpec], options: StackOptions) -> Result<Self> {
        validate_specs(specs)?;

        let mut layers = Vec::with_capacity(specs.len());
        let mut seen = HashSet::new();
        for (rank, spec) in specs.iter().enumerate() {
            let root = spec.path.canonicalize().map_err(|e| Error::InvalidLayer {
                root: spec.path.clone(),
                reason: e.to_string(),
            })?;
            if !seen.insert(root.clone()) {
                return Err(Error::InvalidLayer {
                    root,
                    reason: "layer listed more than once".to_string(),
                });
            }
            let backend = LocalBackend::new(root.clone()).map_err(|e| Error::InvalidLayer {
                root: root.clone(),
                reason: e.to_string(),
            })?;
            let mutability = if spec.writable {
                Mutability::Writable
            } else {
                Mutability::ReadOnly
            };
            let layer = Layer::new(rank, mutability, Arc::new(backend));
            debug!(
                "layer {} rank={} {:?} root={:?}",
                layer.id, rank, mutability, root
            );
            layers.push(layer);
        }

        Self::with_layers(mount_point.to_path_buf(), layers, options)
    }

    /// Assemble a stack from already constructed layers
    pub fn with_layers(mount_point: PathBuf, layers: Vec<Layer>, options: StackOptions) -> Result<Self> {
        let writable = layers.iter().filter(|l| l.is_writable()).count();
        if writable != 1 || !layers.first().map(Layer::is_writable).unwrap_or(false) {
            return Err(Error::Config(format!(
                "exactly one writable layer is required at rank 0, found {} writable of {}",
                writable,
                layers.len()
            )));
        }
        if layers.iter().enumerate().any(|(i, l)| l.rank != i) {
            return Err(Error::Config("layer ranks must be contiguous from 0".to_string()));
        }

        let cache = (options.cache_capacity > 0).then(|| ResolveCache::new(options.cache_capacity));
        info!(
            "Layer stack for {:?}: {} layers, writable={}",
            mount_point,
            layers.len(),
            layers[0].id
        );
        Ok(Self {
            mount_point,
            layers,
            options,
            cache,
        })
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// All layers in rank order
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// The rank 0 layer, target of every write
    pub fn writable(&self) -> &Layer {
        &self.layers[0]
    }

    /// Layers below the writable one
    pub fn lower(&self) -> &[Layer] {
        &self.layers[1..]
    }

    pub fn options(&self) -> &StackOptions {
        &self.options
    }

    pub fn cache(&self) -> Option<&ResolveCache> {
        self.cache.as_ref()
    }

    /// True if any root in this stack equals or nests with `path`
    pub fn overlaps(&self, path: &Path) -> bool {
        self.layers.iter().any(|l| paths_overlap(l.root(), path))
    }
}

/// Check the spec list shape before touching disk
pub fn validate_specs(specs: &[LayerSpec]) -> Result<()> {
    if specs.is_empty() {
        return Err(Error::Config("no layers configured".to_string()));
    }
    let writable = specs.iter().filter(|s| s.writable).count();
    if writable != 1 {
        return Err(Error::Config(format!(
            "exactly one writable layer is required, found {}",
            writable
        )));
    }
    if !specs[0].writable {
        return Err(Error::Config(
            "the writable layer must be listed first".to_string(),
        ));
    }
    Ok(())
}

/// True if one path equals or lies below the other
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(path: &Path, writable: bool) -> LayerSpec {
        LayerSpec {
            path: path.to_path_buf(),
            writable,
        }
    }

    #[test]
    fn test_build_stack() {
        let upper = tempdir().unwrap();
        let lower = tempdir().unwrap();
        let stack = LayerStack::from_specs(
            Path::new("/mnt/x"),
            &[spec(upper.path(), true), spec(lower.path(), false)],
            StackOptions::default(),
        )
        .unwrap();

        assert_eq!(stack.layers().len(), 2);
        assert!(stack.writable().is_writable());
        assert_eq!(stack.lower().len(), 1);
        assert_eq!(stack.lower()[0].rank, 1);
        assert!(stack.cache().is_none());
    }

    #[test]
    fn test_rejects_bad_writable_count() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let none = LayerStack::from_specs(
            Path::new("/mnt/x"),
            &[spec(a.path(), false), spec(b.path(), false)],
            StackOptions::default(),
        );
        assert!(matches!(none, Err(Error::Config(_))));

        let two = LayerStack::from_specs(
            Path::new("/mnt/x"),
            &[spec(a.path(), true), spec(b.path(), true)],
            StackOptions::default(),
        );
        assert!(matches!(two, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_writable_not_first() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let result = LayerStack::from_specs(
            Path::new("/mnt/x"),
            &[spec(a.path(), false), spec(b.path(), true)],
            StackOptions::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_missing_and_duplicate_roots() {
        let a = tempdir().unwrap();
        let missing = LayerStack::from_specs(
            Path::new("/mnt/x"),
            &[spec(a.path(), true), spec(&a.path().join("gone"), false)],
            StackOptions::default(),
        );
        assert!(matches!(missing, Err(Error::InvalidLayer { .. })));

        let duplicate = LayerStack::from_specs(
            Path::new("/mnt/x"),
            &[spec(a.path(), true), spec(a.path(), false)],
            StackOptions::default(),
        );
        assert!(matches!(duplicate, Err(Error::InvalidLayer { .. })));
    }

    #[test]
    fn test_layer_id_is_stable() {
        let a = LayerId::for_root(Path::new("/srv/base"));
        let b = LayerId::for_root(Path::new("/srv/base"));
        let c = LayerId::for_root(Path::new("/srv/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 12);
    }

    #[test]
    fn test_paths_overlap() {
        assert!(paths_overlap(Path::new("/a"), Path::new("/a/b")));
        assert!(paths_overlap(Path::new("/a/b"), Path::new("/a")));
        assert!(!paths_overlap(Path::new("/a/b"), Path::new("/a/c")));
        assert!(!paths_overlap(Path::new("/ab"), Path::new("/a")));
    }
}
