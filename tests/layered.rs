//! End-to-end behaviour of a mounted layer stack, driven through the
//! dispatcher without a kernel mount.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use prismafs::copyup::{CopyMode, CopyUpEngine};
use prismafs::lock::PathLocks;
use prismafs::prelude::*;
use tempfile::TempDir;

struct Mount {
    _base: TempDir,
    mnt: PathBuf,
    upper: PathBuf,
    lower: PathBuf,
    namespace: Namespace,
    dispatcher: Arc<Dispatcher>,
}

fn mount() -> Mount {
    let base = tempfile::tempdir().unwrap();
    let root = base.path().canonicalize().unwrap();
    let (mnt, upper, lower) = (root.join("mnt"), root.join("upper"), root.join("lower"));
    for d in [&mnt, &upper, &lower] {
        fs::create_dir(d).unwrap();
    }
    let namespace = Namespace::new();
    namespace
        .mount(
            &mnt,
            &[LayerSpec::writable(&upper), LayerSpec::read_only(&lower)],
            StackOptions {
                cache_capacity: 128,
                hide_dotfiles: false,
            },
        )
        .unwrap();
    let dispatcher = Arc::new(Dispatcher::new(
        namespace.clone(),
        &mnt,
        PathLocks::new(Duration::from_secs(2), 16),
    ));
    Mount {
        _base: base,
        mnt,
        upper,
        lower,
        namespace,
        dispatcher,
    }
}

fn vp(s: &str) -> VirtualPath {
    VirtualPath::parse(s).unwrap()
}

fn root() -> VirtualPath {
    VirtualPath::root()
}

fn listing(m: &Mount, dir: &str) -> Vec<OsString> {
    let mut names: Vec<OsString> = m
        .dispatcher
        .readdir(&vp(dir))
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    names
}

fn read_all(m: &Mount, path: &str) -> Vec<u8> {
    let fh = m.dispatcher.open(&vp(path), libc::O_RDONLY).unwrap();
    let data = m.dispatcher.read(fh, 0, 1 << 20).unwrap();
    m.dispatcher.release(fh).unwrap();
    data
}

#[test]
fn whiteout_hides_lower_entry_and_descendants() {
    let m = mount();
    fs::create_dir_all(m.lower.join("dir/nested")).unwrap();
    fs::write(m.lower.join("dir/nested/file"), b"x").unwrap();
    fs::write(m.upper.join(".wh.dir"), b"").unwrap();

    assert!(m.dispatcher.getattr(&vp("dir")).unwrap_err().is_not_found());
    assert!(m.dispatcher.getattr(&vp("dir/nested/file")).unwrap_err().is_not_found());
    assert!(listing(&m, "").is_empty());
}

#[test]
fn write_to_lower_file_leaves_lower_untouched() {
    let m = mount();
    fs::write(m.lower.join("config"), b"original bytes").unwrap();

    let fh = m.dispatcher.open(&vp("config"), libc::O_WRONLY).unwrap();
    m.dispatcher.write(fh, 0, b"modified").unwrap();
    m.dispatcher.release(fh).unwrap();

    let stack = m.namespace.stack(m.dispatcher.mount_point()).unwrap();
    let found = PathResolver::new(&stack)
        .resolve(&vp("config"))
        .unwrap()
        .into_found(&vp("config"))
        .unwrap();
    assert_eq!(found.rank, 0);
    assert_eq!(read_all(&m, "config"), b"modified bytes");
    assert_eq!(fs::read(m.lower.join("config")).unwrap(), b"original bytes");
}

#[test]
fn copy_up_twice_is_a_no_op() {
    let m = mount();
    fs::write(m.lower.join("f"), b"v1").unwrap();
    let stack = m.namespace.stack(m.dispatcher.mount_point()).unwrap();
    let engine = CopyUpEngine::new(&stack);

    let first = engine.ensure_writable(&vp("f")).unwrap();
    fs::write(&first, b"edited in place").unwrap();
    let second = engine.ensure_writable(&vp("f")).unwrap();

    assert_eq!(first, second);
    assert_eq!(fs::read(&second).unwrap(), b"edited in place");
}

#[test]
fn merged_listing_prefers_upper() {
    let m = mount();
    fs::write(m.upper.join("x"), b"upper x").unwrap();
    fs::write(m.upper.join("z"), b"z").unwrap();
    fs::write(m.lower.join("x"), b"lower x").unwrap();
    fs::write(m.lower.join("y"), b"y").unwrap();

    let entries = m.dispatcher.readdir(&root()).unwrap();
    let mut names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec![OsString::from("x"), OsString::from("y"), OsString::from("z")]);

    let x = entries.iter().find(|e| e.name == "x").unwrap();
    assert_eq!(x.rank, 0);
    assert_eq!(read_all(&m, "x"), b"upper x");
}

#[test]
fn delete_lower_entry_records_whiteout() {
    let m = mount();
    fs::write(m.lower.join("victim"), b"still here").unwrap();

    m.dispatcher.unlink(&root(), OsStr::new("victim")).unwrap();

    assert!(m.upper.join(".wh.victim").exists());
    assert!(m.dispatcher.getattr(&vp("victim")).unwrap_err().is_not_found());
    assert_eq!(fs::read(m.lower.join("victim")).unwrap(), b"still here");
}

#[test]
fn recreate_clears_whiteout() {
    let m = mount();
    fs::write(m.lower.join("name"), b"lower").unwrap();
    m.dispatcher.unlink(&root(), OsStr::new("name")).unwrap();

    let (_, _, fh) = m
        .dispatcher
        .create(&root(), OsStr::new("name"), 0o644, libc::O_WRONLY)
        .unwrap();
    m.dispatcher.write(fh, 0, b"fresh").unwrap();
    m.dispatcher.release(fh).unwrap();

    assert!(!m.upper.join(".wh.name").exists());
    assert_eq!(read_all(&m, "name"), b"fresh");
    assert_eq!(listing(&m, ""), vec![OsString::from("name")]);
}

#[test]
fn disjoint_writers_do_not_block_each_other() {
    let m = mount();
    for i in 0..8 {
        fs::write(m.lower.join(format!("f{}", i)), b"seed").unwrap();
    }
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let dispatcher = Arc::clone(&m.dispatcher);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let path = vp(&format!("f{}", i));
                barrier.wait();
                for round in 0..20u8 {
                    let fh = dispatcher.open(&path, libc::O_WRONLY).unwrap();
                    dispatcher.write(fh, 0, &[round; 4]).unwrap();
                    dispatcher.release(fh).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for i in 0..8 {
        assert_eq!(read_all(&m, &format!("f{}", i)), vec![19u8; 4]);
        assert_eq!(fs::read(m.lower.join(format!("f{}", i))).unwrap(), b"seed");
    }
}

#[test]
fn same_path_writers_leave_one_final_state() {
    let m = mount();
    fs::write(m.lower.join("shared"), vec![b'-'; 4096]).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = [b'A', b'B']
        .into_iter()
        .map(|byte| {
            let dispatcher = Arc::clone(&m.dispatcher);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let path = vp("shared");
                barrier.wait();
                let fh = dispatcher.open(&path, libc::O_WRONLY).unwrap();
                dispatcher.write(fh, 0, &vec![byte; 4096]).unwrap();
                dispatcher.release(fh).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let data = read_all(&m, "shared");
    assert_eq!(data.len(), 4096);
    assert!(data.iter().all(|&b| b == data[0]));
    assert!(data[0] == b'A' || data[0] == b'B');
}

#[test]
fn interrupted_copy_up_is_invisible() {
    let m = mount();
    fs::write(m.lower.join("big"), vec![7u8; 8192]).unwrap();
    let stack = m.namespace.stack(m.dispatcher.mount_point()).unwrap();
    let resolver = PathResolver::new(&stack);
    let found = resolver
        .resolve(&vp("big"))
        .unwrap()
        .into_found(&vp("big"))
        .unwrap();

    let staged = CopyUpEngine::new(&stack)
        .stage(&vp("big"), &found, CopyMode::Full)
        .unwrap()
        .unwrap();
    // The process dies here: the temporary stays, the rename never happens
    std::mem::forget(staged);

    let after = resolver
        .resolve(&vp("big"))
        .unwrap()
        .into_found(&vp("big"))
        .unwrap();
    assert_eq!(after.rank, 1);
    assert_eq!(listing(&m, ""), vec![OsString::from("big")]);
    assert_eq!(read_all(&m, "big"), vec![7u8; 8192]);
}

#[test]
fn rebind_keeps_open_handles() {
    let m = mount();
    fs::write(m.lower.join("doc"), b"from lower").unwrap();
    let other = m.lower.with_file_name("other");
    fs::create_dir(&other).unwrap();
    fs::write(other.join("doc"), b"from other").unwrap();

    let fh = m.dispatcher.open(&vp("doc"), libc::O_RDONLY).unwrap();

    m.namespace
        .rebind(
            &m.mnt,
            &[LayerSpec::writable(&m.upper), LayerSpec::read_only(&other)],
            StackOptions::default(),
        )
        .unwrap();

    assert_eq!(m.dispatcher.read(fh, 0, 64).unwrap(), b"from lower");
    m.dispatcher.release(fh).unwrap();
    assert_eq!(read_all(&m, "doc"), b"from other");
}

#[test]
fn operations_fail_after_unmount() {
    let m = mount();
    m.namespace.unmount(&m.mnt).unwrap();
    let err = m.dispatcher.readdir(&root()).unwrap_err();
    assert!(matches!(err, Error::NotMounted(_)));
    assert!(!m.namespace.is_initialized());
}

#[test]
fn directory_rename_hides_old_name() {
    let m = mount();
    fs::create_dir_all(m.lower.join("src/deep")).unwrap();
    fs::write(m.lower.join("src/deep/leaf"), b"leaf").unwrap();
    fs::write(m.lower.join("src/top"), b"top").unwrap();

    m.dispatcher
        .rename(&root(), OsStr::new("src"), &root(), OsStr::new("dst"), 0)
        .unwrap();

    assert_eq!(listing(&m, ""), vec![OsString::from("dst")]);
    assert_eq!(
        listing(&m, "dst"),
        vec![OsString::from("deep"), OsString::from("top")]
    );
    assert_eq!(read_all(&m, "dst/deep/leaf"), b"leaf");
    assert!(m.lower.join("src/deep/leaf").exists());
}
