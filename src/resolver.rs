//! Path resolution across a layer stack
//!
//! Layers are consulted in rank order. In each layer a whiteout marker on the
//! path or on any of its ancestors ends the search, a non-directory ancestor
//! blocks it, and an opaque ancestor stops it after that layer.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};
use crate::layer::{EntryAttr, EntryKind, Layer, LayerId, LayerStack};
use crate::vpath::{is_reserved, VirtualPath};
use crate::whiteout::WhiteoutTracker;

/// A path found in a layer
#[derive(Debug, Clone)]
pub struct Found {
    pub rank: usize,
    pub layer: LayerId,
    pub physical: PathBuf,
    pub kind: EntryKind,
    pub attr: EntryAttr,
}

/// Outcome of resolving a virtual path
#[derive(Debug, Clone)]
pub enum Resolution {
    Found(Found),
    /// Explicitly deleted at the given rank
    Whiteout { rank: usize },
    NotFound,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        matches!(self, Resolution::Found(_))
    }

    pub fn found(&self) -> Option<&Found> {
        match self {
            Resolution::Found(found) => Some(found),
            _ => None,
        }
    }

    /// Convert to the found entry or the matching resolution error
    pub fn into_found(self, path: &VirtualPath) -> Result<Found> {
        match self {
            Resolution::Found(found) => Ok(found),
            Resolution::Whiteout { .. } => Err(Error::Whiteout(path.clone())),
            Resolution::NotFound => Err(Error::NotFound(path.clone())),
        }
    }
}

/// Entry of a merged directory listing
#[derive(Debug, Clone)]
pub struct MergedEntry {
    pub name: OsString,
    pub kind: EntryKind,
    /// Rank of the layer the entry is taken from
    pub rank: usize,
}

/// How one layer sees a path
enum LayerView {
    Whiteout,
    Blocked,
    Missing { opaque: bool },
    Present { attr: EntryAttr, opaque: bool },
}

pub struct PathResolver<'a> {
    stack: &'a LayerStack,
}

impl<'a> PathResolver<'a> {
    pub fn new(stack: &'a LayerStack) -> Self {
        Self { stack }
    }

    /// Resolve through every layer, without consulting the cache
    pub fn resolve(&self, path: &VirtualPath) -> Result<Resolution> {
        self.resolve_below(path, 0)
    }

    /// Resolve, serving and filling the stack's resolution cache if enabled
    pub fn resolve_cached(&self, path: &VirtualPath) -> Result<Resolution> {
        let Some(cache) = self.stack.cache() else {
            return self.resolve(path);
        };
        if let Some(hit) = cache.get(path) {
            return Ok(hit);
        }
        let epoch = cache.epoch();
        let resolution = self.resolve(path)?;
        if !cache.insert_if_current(path.clone(), resolution.clone(), epoch) {
            debug!("resolve {}: invalidated while resolving, not cached", path);
        }
        Ok(resolution)
    }

    /// Resolve considering only layers with rank >= `start_rank`
    pub fn resolve_below(&self, path: &VirtualPath, start_rank: usize) -> Result<Resolution> {
        if path.as_path().iter().any(is_reserved) {
            return Ok(Resolution::NotFound);
        }

        for layer in self.stack.layers().iter().skip(start_rank) {
            match self.view(layer, path)? {
                LayerView::Whiteout => {
                    debug!("resolve {}: whiteout at rank {}", path, layer.rank);
                    return Ok(Resolution::Whiteout { rank: layer.rank });
                }
                LayerView::Blocked => return Ok(Resolution::NotFound),
                LayerView::Missing { opaque: true } => return Ok(Resolution::NotFound),
                LayerView::Missing { opaque: false } => continue,
                LayerView::Present { attr, .. } => {
                    debug!("resolve {}: found at rank {} ({:?})", path, layer.rank, attr.kind);
                    return Ok(Resolution::Found(Found {
                        rank: layer.rank,
                        layer: layer.id.clone(),
                        physical: path.under(layer.root()),
                        kind: attr.kind,
                        attr,
                    }));
                }
            }
        }

        Ok(Resolution::NotFound)
    }

    /// Merged, name-unique listing of directory `dir`
    pub fn readdir(&self, dir: &VirtualPath) -> Result<Vec<MergedEntry>> {
        self.merged(dir, self.stack.options().hide_dotfiles)
    }

    /// Merged listing including dot-files, whatever the listing option says
    pub fn readdir_all(&self, dir: &VirtualPath) -> Result<Vec<MergedEntry>> {
        self.merged(dir, false)
    }

    fn merged(&self, dir: &VirtualPath, hide_dotfiles: bool) -> Result<Vec<MergedEntry>> {
        let found = self.resolve(dir)?.into_found(dir)?;
        if !found.kind.is_dir() {
            return Err(Error::NotDirectory(dir.clone()));
        }

        let mut entries = Vec::new();
        let mut seen: HashSet<OsString> = HashSet::new();
        let mut hidden: HashSet<OsString> = HashSet::new();

        for layer in self.stack.layers().iter().skip(found.rank) {
            let opaque = match self.view(layer, dir)? {
                LayerView::Whiteout | LayerView::Blocked => break,
                LayerView::Missing { opaque: true } => break,
                LayerView::Missing { opaque: false } => continue,
                LayerView::Present { attr, .. } if !attr.kind.is_dir() => break,
                LayerView::Present { opaque, .. } => opaque,
            };

            for entry in layer.backend().read_dir(dir.as_path())? {
                if is_reserved(&entry.name)
                    || seen.contains(&entry.name)
                    || hidden.contains(&entry.name)
                {
                    continue;
                }
                if hide_dotfiles && entry.name.to_string_lossy().starts_with('.') {
                    continue;
                }
                seen.insert(entry.name.clone());
                entries.push(MergedEntry {
                    name: entry.name,
                    kind: entry.kind,
                    rank: layer.rank,
                });
            }

            hidden.extend(WhiteoutTracker::whiteouts_in_dir(layer, dir)?);

            if opaque || WhiteoutTracker::is_opaque(layer, dir)? {
                break;
            }
        }

        debug!("readdir {}: {} merged entries", dir, entries.len());
        Ok(entries)
    }

    /// True if `dir` has no visible entries, hidden dot-files included
    pub fn is_empty_dir(&self, dir: &VirtualPath) -> Result<bool> {
        Ok(self.readdir_all(dir)?.is_empty())
    }

    /// True if some lower layer still shows `path`, taking into account
    /// what the writable layer hides (a marker, an opaque ancestor or a
    /// non-directory ancestor)
    pub fn lower_visible(&self, path: &VirtualPath) -> Result<bool> {
        match self.view(self.stack.writable(), path)? {
            LayerView::Whiteout | LayerView::Blocked => return Ok(false),
            LayerView::Missing { opaque: true } | LayerView::Present { opaque: true, .. } => {
                return Ok(false)
            }
            LayerView::Missing { opaque: false } | LayerView::Present { opaque: false, .. } => {}
        }
        Ok(self.resolve_below(path, 1)?.is_found())
    }

    fn view(&self, layer: &Layer, path: &VirtualPath) -> Result<LayerView> {
        let backend = layer.backend();
        let mut opaque = false;

        for ancestor in path.ancestors() {
            if WhiteoutTracker::is_whiteout(layer, &ancestor)? {
                return Ok(LayerView::Whiteout);
            }
            match backend.stat(ancestor.as_path())? {
                None => return Ok(LayerView::Missing { opaque }),
                Some(attr) if !attr.kind.is_dir() => return Ok(LayerView::Blocked),
                Some(_) => {
                    if WhiteoutTracker::is_opaque(layer, &ancestor)? {
                        opaque = true;
                    }
                }
            }
        }

        if WhiteoutTracker::is_whiteout(layer, path)? {
            return Ok(LayerView::Whiteout);
        }
        match backend.stat(path.as_path())? {
            Some(attr) => Ok(LayerView::Present { attr, opaque }),
            None => Ok(LayerView::Missing { opaque }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerSpec;
    use crate::layer::StackOptions;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        layers: Vec<TempDir>,
        stack: LayerStack,
    }

    fn fixture(count: usize, options: StackOptions) -> Fixture {
        let layers: Vec<TempDir> = (0..count).map(|_| tempdir().unwrap()).collect();
        let specs: Vec<LayerSpec> = layers
            .iter()
            .enumerate()
            .map(|(i, d)| LayerSpec {
                path: d.path().to_path_buf(),
                writable: i == 0,
            })
            .collect();
        let stack = LayerStack::from_specs(Path::new("/mnt/r"), &specs, options).unwrap();
        Fixture { layers, stack }
    }

    fn vp(s: &str) -> VirtualPath {
        VirtualPath::parse(s).unwrap()
    }

    fn names(entries: &[MergedEntry]) -> Vec<String> {
        let mut names: Vec<String> = entries
            .iter()
            .map(|e| e.name.to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_precedence() {
        let f = fixture(3, StackOptions::default());
        fs::write(f.layers[1].path().join("a"), b"middle").unwrap();
        fs::write(f.layers[2].path().join("a"), b"bottom").unwrap();
        fs::write(f.layers[2].path().join("b"), b"bottom").unwrap();

        let resolver = PathResolver::new(&f.stack);
        let a = resolver.resolve(&vp("a")).unwrap().into_found(&vp("a")).unwrap();
        assert_eq!(a.rank, 1);
        assert_eq!(fs::read(&a.physical).unwrap(), b"middle");

        let b = resolver.resolve(&vp("b")).unwrap().into_found(&vp("b")).unwrap();
        assert_eq!(b.rank, 2);

        assert!(matches!(resolver.resolve(&vp("c")).unwrap(), Resolution::NotFound));
    }

    #[test]
    fn test_root_resolves_to_writable() {
        let f = fixture(2, StackOptions::default());
        let root = PathResolver::new(&f.stack)
            .resolve(&VirtualPath::root())
            .unwrap()
            .into_found(&VirtualPath::root())
            .unwrap();
        assert_eq!(root.rank, 0);
        assert!(root.kind.is_dir());
    }

    #[test]
    fn test_whiteout_hides_lower_entry() {
        let f = fixture(3, StackOptions::default());
        fs::write(f.layers[2].path().join("gone"), b"x").unwrap();
        fs::write(f.layers[1].path().join(".wh.gone"), b"").unwrap();

        let resolver = PathResolver::new(&f.stack);
        assert!(matches!(
            resolver.resolve(&vp("gone")).unwrap(),
            Resolution::Whiteout { rank: 1 }
        ));
        let err = resolver.resolve(&vp("gone")).unwrap().into_found(&vp("gone")).unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_directory_whiteout_hides_descendants() {
        let f = fixture(2, StackOptions::default());
        fs::create_dir_all(f.layers[1].path().join("d/sub")).unwrap();
        fs::write(f.layers[1].path().join("d/sub/deep"), b"x").unwrap();
        fs::write(f.layers[0].path().join(".wh.d"), b"").unwrap();

        let resolver = PathResolver::new(&f.stack);
        assert!(!resolver.resolve(&vp("d")).unwrap().is_found());
        assert!(!resolver.resolve(&vp("d/sub")).unwrap().is_found());
        assert!(!resolver.resolve(&vp("d/sub/deep")).unwrap().is_found());
    }

    #[test]
    fn test_opaque_directory_stops_descent() {
        let f = fixture(2, StackOptions::default());
        fs::create_dir(f.layers[1].path().join("d")).unwrap();
        fs::write(f.layers[1].path().join("d/old"), b"x").unwrap();
        fs::create_dir(f.layers[0].path().join("d")).unwrap();
        fs::write(f.layers[0].path().join("d/.wh..wh..opq"), b"").unwrap();
        fs::write(f.layers[0].path().join("d/new"), b"y").unwrap();

        let resolver = PathResolver::new(&f.stack);
        assert!(!resolver.resolve(&vp("d/old")).unwrap().is_found());
        assert!(resolver.resolve(&vp("d/new")).unwrap().is_found());
        assert_eq!(names(&resolver.readdir(&vp("d")).unwrap()), vec!["new"]);
    }

    #[test]
    fn test_file_ancestor_blocks_lower_layers() {
        let f = fixture(2, StackOptions::default());
        fs::create_dir(f.layers[1].path().join("p")).unwrap();
        fs::write(f.layers[1].path().join("p/child"), b"x").unwrap();
        fs::write(f.layers[0].path().join("p"), b"now a file").unwrap();

        let resolver = PathResolver::new(&f.stack);
        assert!(matches!(resolver.resolve(&vp("p/child")).unwrap(), Resolution::NotFound));
    }

    #[test]
    fn test_reserved_names_are_invisible() {
        let f = fixture(2, StackOptions::default());
        fs::write(f.layers[0].path().join(".wh.x"), b"").unwrap();
        let resolver = PathResolver::new(&f.stack);
        assert!(matches!(resolver.resolve(&vp(".wh.x")).unwrap(), Resolution::NotFound));
        assert!(resolver.readdir(&VirtualPath::root()).unwrap().is_empty());
    }

    #[test]
    fn test_readdir_merge() {
        let f = fixture(2, StackOptions::default());
        fs::write(f.layers[0].path().join("x"), b"upper").unwrap();
        fs::write(f.layers[0].path().join("z"), b"upper").unwrap();
        fs::write(f.layers[1].path().join("x"), b"lower").unwrap();
        fs::write(f.layers[1].path().join("y"), b"lower").unwrap();

        let entries = PathResolver::new(&f.stack).readdir(&VirtualPath::root()).unwrap();
        assert_eq!(names(&entries), vec!["x", "y", "z"]);
        let x = entries.iter().find(|e| e.name == "x").unwrap();
        assert_eq!(x.rank, 0);
    }

    #[test]
    fn test_readdir_whiteout_suppresses_name() {
        let f = fixture(2, StackOptions::default());
        fs::write(f.layers[1].path().join("keep"), b"").unwrap();
        fs::write(f.layers[1].path().join("drop"), b"").unwrap();
        fs::write(f.layers[0].path().join(".wh.drop"), b"").unwrap();

        let entries = PathResolver::new(&f.stack).readdir(&VirtualPath::root()).unwrap();
        assert_eq!(names(&entries), vec!["keep"]);
    }

    #[test]
    fn test_readdir_lower_only_directory() {
        let f = fixture(2, StackOptions::default());
        fs::create_dir(f.layers[1].path().join("d")).unwrap();
        fs::write(f.layers[1].path().join("d/a"), b"").unwrap();

        let entries = PathResolver::new(&f.stack).readdir(&vp("d")).unwrap();
        assert_eq!(names(&entries), vec!["a"]);
        assert_eq!(entries[0].rank, 1);
    }

    #[test]
    fn test_readdir_not_a_directory() {
        let f = fixture(2, StackOptions::default());
        fs::write(f.layers[1].path().join("f"), b"").unwrap();
        let err = PathResolver::new(&f.stack).readdir(&vp("f")).unwrap_err();
        assert!(matches!(err, Error::NotDirectory(_)));
    }

    #[test]
    fn test_hide_dotfiles() {
        let f = fixture(
            2,
            StackOptions {
                hide_dotfiles: true,
                ..Default::default()
            },
        );
        fs::write(f.layers[1].path().join(".hidden"), b"").unwrap();
        fs::write(f.layers[1].path().join("shown"), b"").unwrap();

        let resolver = PathResolver::new(&f.stack);
        assert_eq!(names(&resolver.readdir(&VirtualPath::root()).unwrap()), vec!["shown"]);
        // Still reachable by name
        assert!(resolver.resolve(&vp(".hidden")).unwrap().is_found());
    }

    #[test]
    fn test_resolve_below_skips_upper() {
        let f = fixture(2, StackOptions::default());
        fs::write(f.layers[0].path().join("both"), b"up").unwrap();
        fs::write(f.layers[1].path().join("both"), b"down").unwrap();
        fs::write(f.layers[0].path().join("only_up"), b"up").unwrap();

        let resolver = PathResolver::new(&f.stack);
        assert_eq!(
            resolver.resolve_below(&vp("both"), 1).unwrap().found().unwrap().rank,
            1
        );
        assert!(!resolver.resolve_below(&vp("only_up"), 1).unwrap().is_found());
    }

    #[test]
    fn test_resolve_cached() {
        let f = fixture(
            2,
            StackOptions {
                cache_capacity: 16,
                ..Default::default()
            },
        );
        fs::write(f.layers[1].path().join("c"), b"").unwrap();
        let resolver = PathResolver::new(&f.stack);
        assert!(resolver.resolve_cached(&vp("c")).unwrap().is_found());

        // Served from cache until invalidated
        fs::remove_file(f.layers[1].path().join("c")).unwrap();
        assert!(resolver.resolve_cached(&vp("c")).unwrap().is_found());
        f.stack.cache().unwrap().invalidate(&vp("c"));
        assert!(!resolver.resolve_cached(&vp("c")).unwrap().is_found());
    }

    #[test]
    fn test_empty_check_sees_hidden_dotfiles() {
        let f = fixture(
            2,
            StackOptions {
                hide_dotfiles: true,
                ..Default::default()
            },
        );
        fs::create_dir(f.layers[1].path().join("d")).unwrap();
        fs::write(f.layers[1].path().join("d/.profile"), b"").unwrap();

        let resolver = PathResolver::new(&f.stack);
        assert!(resolver.readdir(&vp("d")).unwrap().is_empty());
        assert_eq!(names(&resolver.readdir_all(&vp("d")).unwrap()), vec![".profile"]);
        assert!(!resolver.is_empty_dir(&vp("d")).unwrap());
    }

    #[test]
    fn test_lower_visible_respects_writable_layer() {
        let f = fixture(2, StackOptions::default());
        fs::create_dir(f.layers[1].path().join("d")).unwrap();
        fs::write(f.layers[1].path().join("d/x"), b"lower").unwrap();
        fs::write(f.layers[1].path().join("plain"), b"lower").unwrap();

        let resolver = PathResolver::new(&f.stack);
        assert!(resolver.lower_visible(&vp("d/x")).unwrap());
        assert!(resolver.lower_visible(&vp("plain")).unwrap());
        assert!(!resolver.lower_visible(&vp("absent")).unwrap());

        fs::create_dir(f.layers[0].path().join("d")).unwrap();
        fs::write(f.layers[0].path().join("d/.wh..wh..opq"), b"").unwrap();
        fs::write(f.layers[0].path().join("d/x"), b"upper").unwrap();
        assert!(!resolver.lower_visible(&vp("d/x")).unwrap());

        fs::write(f.layers[0].path().join(".wh.plain"), b"").unwrap();
        assert!(!resolver.lower_visible(&vp("plain")).unwrap());
    }
}
