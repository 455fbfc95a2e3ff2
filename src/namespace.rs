//! Namespace of active mounts
//!
//! Binds layer stacks to mount points. The process-wide registry comes into
//! existence with the first mount and is torn down after the last unmount;
//! it is guarded by its own lock, separate from the per-path locks.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::config::LayerSpec;
use crate::error::{Error, Result};
use crate::layer::{paths_overlap, LayerStack, StackOptions};

#[derive(Default)]
struct Registry {
    mounts: HashMap<PathBuf, Arc<LayerStack>>,
}

impl Registry {
    /// Refuse a stack that would collide with another active mount: nested
    /// mount points, a mount point over another mount's layers, layers over
    /// another mount point, or nested writable roots
    fn check_conflicts(&self, stack: &LayerStack, skip: &Path) -> Result<()> {
        let ours = stack.writable().root();
        let target = stack.mount_point();
        let conflict = |reason: String| Error::MountConflict {
            mount_point: target.to_path_buf(),
            reason,
        };

        for (mount_point, other) in &self.mounts {
            if mount_point == skip {
                continue;
            }
            if paths_overlap(target, mount_point) {
                return Err(conflict(format!("nests with active mount {:?}", mount_point)));
            }
            if other.overlaps(target) {
                return Err(conflict(format!("overlaps a layer of active mount {:?}", mount_point)));
            }
            if paths_overlap(ours, other.writable().root()) {
                return Err(conflict(format!(
                    "writable layer {:?} overlaps the writable layer of {:?}",
                    ours, mount_point
                )));
            }
            if stack.overlaps(mount_point) {
                return Err(conflict(format!("a layer root overlaps active mount {:?}", mount_point)));
            }
        }
        Ok(())
    }
}

/// Handle on a mount registry
#[derive(Clone, Default)]
pub struct Namespace {
    inner: Arc<RwLock<Option<Registry>>>,
}

static GLOBAL: OnceLock<Namespace> = OnceLock::new();

/// Mount points are compared in canonical form when they exist
fn normalize(mount_point: &Path) -> PathBuf {
    mount_point
        .canonicalize()
        .unwrap_or_else(|_| mount_point.to_path_buf())
}

impl Namespace {
    /// A private namespace, independent of the process-wide one
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide namespace
    pub fn global() -> &'static Namespace {
        GLOBAL.get_or_init(Namespace::new)
    }

    /// Bind `specs` at `mount_point`
    pub fn mount(&self, mount_point: &Path, specs: &[LayerSpec], options: StackOptions) -> Result<Arc<LayerStack>> {
        let mount_point = normalize(mount_point);
        let stack = Arc::new(build_stack(&mount_point, specs, options)?);

        let mut guard = self.inner.write();
        let registry = guard.get_or_insert_with(|| {
            info!("Initializing mount namespace");
            Registry::default()
        });

        let conflict = if registry.mounts.contains_key(&mount_point) {
            Some(Error::AlreadyMounted(mount_point.clone()))
        } else {
            registry.check_conflicts(&stack, &mount_point).err()
        };
        if let Some(e) = conflict {
            // A refused first mount must not leave the registry behind
            if registry.mounts.is_empty() {
                *guard = None;
            }
            return Err(e);
        }

        registry.mounts.insert(mount_point.clone(), Arc::clone(&stack));
        info!(
            "Mounted {:?} with {} layers ({} active)",
            mount_point,
            stack.layers().len(),
            registry.mounts.len()
        );
        Ok(stack)
    }

    /// Drop the stack bound at `mount_point`
    pub fn unmount(&self, mount_point: &Path) -> Result<()> {
        let mount_point = normalize(mount_point);
        let mut guard = self.inner.write();
        let registry = guard
            .as_mut()
            .ok_or_else(|| Error::NotMounted(mount_point.clone()))?;

        if registry.mounts.remove(&mount_point).is_none() {
            return Err(Error::NotMounted(mount_point));
        }
        info!("Unmounted {:?}", mount_point);

        if registry.mounts.is_empty() {
            *guard = None;
            info!("Last mount gone, namespace torn down");
        }
        Ok(())
    }

    /// Replace the stack at `mount_point` in one step. Open handles keep
    /// the descriptors they already hold.
    pub fn rebind(&self, mount_point: &Path, specs: &[LayerSpec], options: StackOptions) -> Result<Arc<LayerStack>> {
        let mount_point = normalize(mount_point);
        let stack = Arc::new(build_stack(&mount_point, specs, options)?);

        let mut guard = self.inner.write();
        let registry = guard
            .as_mut()
            .ok_or_else(|| Error::NotMounted(mount_point.clone()))?;
        if !registry.mounts.contains_key(&mount_point) {
            return Err(Error::NotMounted(mount_point));
        }
        registry.check_conflicts(&stack, &mount_point)?;

        let old = registry.mounts.insert(mount_point.clone(), Arc::clone(&stack));
        debug!(
            "rebind {:?}: {} -> {} layers",
            mount_point,
            old.map(|s| s.layers().len()).unwrap_or(0),
            stack.layers().len()
        );
        info!("Rebound {:?}", mount_point);
        Ok(stack)
    }

    /// Active stack for `mount_point`, which must already be in the
    /// canonical form returned by [`Namespace::canonical`]
    pub fn stack(&self, mount_point: &Path) -> Result<Arc<LayerStack>> {
        let guard = self.inner.read();
        guard
            .as_ref()
            .and_then(|r| r.mounts.get(mount_point).cloned())
            .ok_or_else(|| Error::NotMounted(mount_point.to_path_buf()))
    }

    /// Canonical key under which `mount_point` is registered
    pub fn canonical(mount_point: &Path) -> PathBuf {
        normalize(mount_point)
    }

    pub fn is_mounted(&self, mount_point: &Path) -> bool {
        self.stack(&normalize(mount_point)).is_ok()
    }

    /// Active mount points
    pub fn mounts(&self) -> Vec<PathBuf> {
        let guard = self.inner.read();
        let mut mounts: Vec<PathBuf> = guard
            .as_ref()
            .map(|r| r.mounts.keys().cloned().collect())
            .unwrap_or_default();
        mounts.sort();
        mounts
    }

    /// Whether the registry currently exists
    pub fn is_initialized(&self) -> bool {
        self.inner.read().is_some()
    }
}

fn build_stack(mount_point: &Path, specs: &[LayerSpec], options: StackOptions) -> Result<LayerStack> {
    let stack = LayerStack::from_specs(mount_point, specs, options)?;
    if stack.overlaps(mount_point) {
        return Err(Error::MountConflict {
            mount_point: mount_point.to_path_buf(),
            reason: "a layer root equals, contains, or lies inside the mount point".to_string(),
        });
    }
    Ok(stack)
}
