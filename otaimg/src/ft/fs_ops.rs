//! Materializing file-table entries onto a target filesystem.

use std::fs;
use std::os::unix::fs::{chown, lchown, symlink, PermissionsExt as _};
use std::path::{Path, PathBuf};

use nix::sys::stat::{mknod, Mode, SFlag};

use crate::ft::{DirEntry, NonRegularEntry, RegularEntry, XattrMap};
use crate::Result;

/// Canonical root all file-table paths are absolute to.
pub const CANONICAL_ROOT: &str = "/";

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;

/// Maps a canonical path onto its location under `target_mnt`.
pub fn fpath_on_target(canonical_path: &str, target_mnt: &Path) -> PathBuf {
    target_mnt.join(canonical_path.trim_start_matches(CANONICAL_ROOT))
}

fn set_xattrs(path: &Path, xattrs: &XattrMap) -> Result<()> {
    for (key, value) in xattrs {
        xattr::set(path, key, value)?;
    }
    Ok(())
}

/// Applies ownership and mode. `chown` MUST run before `chmod`: chown
/// clears the setuid/setgid bits.
fn apply_owner_and_mode(path: &Path, uid: u32, gid: u32, mode: u32) -> Result<()> {
    chown(path, Some(uid), Some(gid))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

/// Creates a directory entry with ownership, mode and xattrs.
pub fn prepare_dir(entry: &DirEntry, target_mnt: &Path) -> Result<PathBuf> {
    let target = fpath_on_target(&entry.path, target_mnt);
    fs::create_dir_all(&target)?;
    apply_owner_and_mode(&target, entry.uid, entry.gid, entry.mode)?;
    if let Some(xattrs) = &entry.xattrs {
        set_xattrs(&target, xattrs)?;
    }
    Ok(target)
}

/// Creates a non-regular entry: symlink or char-device placeholder.
///
/// Symlinks get `lchown` but never `chmod` (mode changes on symlinks are
/// ineffective and raise on some platforms). Char devices are restricted
/// to `0,0` devnodes, the overlayfs whiteout form. Unknown file types
/// are silently ignored.
pub fn prepare_non_regular(entry: &NonRegularEntry, target_mnt: &Path) -> Result<PathBuf> {
    let target = fpath_on_target(&entry.path, target_mnt);
    match entry.mode & S_IFMT {
        S_IFLNK => {
            let raw_target = entry.meta.as_deref().ok_or_else(|| {
                crate::Error::NotFound(format!("symlink {} has no target", entry.path))
            })?;
            let link_target = String::from_utf8_lossy(raw_target).into_owned();
            symlink(Path::new(&link_target), &target)?;
            lchown(&target, Some(entry.uid), Some(entry.gid))?;
        }
        S_IFCHR => {
            mknod(
                &target,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(entry.mode & 0o7777),
                0,
            )?;
            lchown(&target, Some(entry.uid), Some(entry.gid))?;
        }
        _ => return Ok(target),
    }
    if let Some(xattrs) = &entry.xattrs {
        set_xattrs(&target, xattrs)?;
    }
    Ok(target)
}

/// Materializes a regular file by copying the resource blob.
pub fn prepare_regular_copy(
    entry: &RegularEntry,
    resource: &Path,
    target_mnt: &Path,
) -> Result<PathBuf> {
    let target = fpath_on_target(&entry.path, target_mnt);
    let result = fs::copy(resource, &target)
        .map_err(Into::into)
        .and_then(|_| apply_entry_metadata(entry, &target));
    if let Err(e) = result {
        fs::remove_file(&target).ok();
        return Err(e);
    }
    Ok(target)
}

/// Materializes a regular file by hardlinking the resource blob.
///
/// Inside a hardlink group only the head applies permissions; tails pass
/// `skip_permissions` since the shared inode is already fixed up.
pub fn prepare_regular_hardlink(
    entry: &RegularEntry,
    resource: &Path,
    target_mnt: &Path,
    skip_permissions: bool,
) -> Result<PathBuf> {
    let target = fpath_on_target(&entry.path, target_mnt);
    let result = fs::hard_link(resource, &target)
        .map_err(Into::into)
        .and_then(|()| {
            if skip_permissions {
                Ok(())
            } else {
                apply_entry_metadata(entry, &target)
            }
        });
    if let Err(e) = result {
        fs::remove_file(&target).ok();
        return Err(e);
    }
    Ok(target)
}

/// Materializes an inlined regular file from table-carried bytes.
pub fn prepare_regular_inlined(entry: &RegularEntry, target_mnt: &Path) -> Result<PathBuf> {
    let target = fpath_on_target(&entry.path, target_mnt);
    let result = fs::write(&target, entry.contents.as_deref().unwrap_or_default())
        .map_err(Into::into)
        .and_then(|()| apply_entry_metadata(entry, &target));
    if let Err(e) = result {
        fs::remove_file(&target).ok();
        return Err(e);
    }
    Ok(target)
}

fn apply_entry_metadata(entry: &RegularEntry, target: &Path) -> Result<()> {
    apply_owner_and_mode(target, entry.uid, entry.gid, entry.mode)?;
    if let Some(xattrs) = &entry.xattrs {
        set_xattrs(target, xattrs)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt as _;

    fn regular_entry(path: &str, contents: Option<&[u8]>) -> RegularEntry {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        RegularEntry {
            path: path.to_owned(),
            uid,
            gid,
            mode: 0o100644,
            links_count: None,
            xattrs: None,
            digest: crate::Sha256Digest::of(contents.unwrap_or_default()),
            size: contents.map_or(0, |c| c.len() as u64),
            inode_id: 1,
            contents: contents.map(<[u8]>::to_vec),
        }
    }

    #[test]
    fn canonical_paths_map_under_target() {
        assert_eq!(
            fpath_on_target("/usr/bin/env", Path::new("/mnt/slot")),
            PathBuf::from("/mnt/slot/usr/bin/env")
        );
        assert_eq!(
            fpath_on_target("/", Path::new("/mnt/slot")),
            PathBuf::from("/mnt/slot/")
        );
    }

    #[test]
    fn inlined_file_gets_contents_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = regular_entry("/greeting", Some(b"hello"));
        entry.mode = 0o100640;
        let target = prepare_regular_inlined(&entry, dir.path()).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"hello");
        assert_eq!(fs::metadata(&target).unwrap().mode() & 0o7777, 0o640);
    }

    #[test]
    fn hardlink_shares_inode_with_resource() {
        let dir = tempfile::tempdir().unwrap();
        let resource = dir.path().join("blob");
        fs::write(&resource, b"payload").unwrap();
        let entry = regular_entry("/file", None);
        let target = prepare_regular_hardlink(&entry, &resource, dir.path(), false).unwrap();
        assert_eq!(
            fs::metadata(&resource).unwrap().ino(),
            fs::metadata(&target).unwrap().ino()
        );
    }

    #[test]
    fn copy_failure_cleans_up_target() {
        let dir = tempfile::tempdir().unwrap();
        let entry = regular_entry("/file", None);
        let missing = dir.path().join("no-such-blob");
        assert!(prepare_regular_copy(&entry, &missing, dir.path()).is_err());
        assert!(!dir.path().join("file").exists());
    }

    #[test]
    fn symlink_entry_points_at_meta_target() {
        let dir = tempfile::tempdir().unwrap();
        let entry = NonRegularEntry {
            path: "/link".to_owned(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            mode: 0o120777,
            xattrs: None,
            meta: Some(b"/usr/bin/env".to_vec()),
        };
        let target = prepare_non_regular(&entry, dir.path()).unwrap();
        assert_eq!(
            fs::read_link(&target).unwrap(),
            PathBuf::from("/usr/bin/env")
        );
    }

    #[test]
    fn unknown_file_type_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let entry = NonRegularEntry {
            path: "/fifo".to_owned(),
            uid: 0,
            gid: 0,
            mode: 0o010644, // FIFO, unsupported
            xattrs: None,
            meta: None,
        };
        prepare_non_regular(&entry, dir.path()).unwrap();
        assert!(!dir.path().join("fifo").exists());
    }
}
