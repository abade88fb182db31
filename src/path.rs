//! `/`-separated path resolution on top of the directory and inode
//! layers. Introduces no on-disk state of its own.

use crate::inode::FileType;
use crate::word::InodeId;
use crate::fs::Filesystem;

/// Splits `path` into non-empty `/`-separated components, then walks
/// them from `root` one directory at a time. An empty path (or one made
/// entirely of slashes) resolves to `root` itself. Returns `None` as
/// soon as a component is missing or a non-leaf component names
/// something other than a directory.
pub fn resolve(fs: &mut Filesystem, root: InodeId, path: &str) -> Option<InodeId> {
    let mut current = root;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if fs.read_inode(current).file_type() != FileType::Dir {
            return None;
        }
        let entries = fs.dir_entries(current);
        let hit = entries
            .iter()
            .find(|(_, name)| name.as_slice() == component.as_bytes())?;
        current = hit.0;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{Filesystem, ROOT_INODE};

    fn mkdir(fs: &mut Filesystem, parent: InodeId, name: &str) -> InodeId {
        let id = fs.alloc_inode().unwrap();
        fs.write_inode(id, |ino| {
            ino.set_in_use(true);
            ino.set_type(FileType::Dir);
            ino.set_permissions(0o755);
            ino.set_nlinks(2);
        });
        let slot = fs.add_dir_entry(parent).unwrap();
        fs.set_dir_name(slot, name, false).unwrap();
        fs.set_dir_inode(slot, id);
        id
    }

    #[test]
    fn empty_path_resolves_to_root() {
        let mut fs = Filesystem::format_memory(4, 512);
        assert_eq!(resolve(&mut fs, ROOT_INODE, ""), Some(ROOT_INODE));
        assert_eq!(resolve(&mut fs, ROOT_INODE, "///"), Some(ROOT_INODE));
    }

    #[test]
    fn nested_directories_resolve() {
        let mut fs = Filesystem::format_memory(4, 512);
        let a = mkdir(&mut fs, ROOT_INODE, "a");
        let b = mkdir(&mut fs, a, "b");
        assert_eq!(resolve(&mut fs, ROOT_INODE, "a"), Some(a));
        assert_eq!(resolve(&mut fs, ROOT_INODE, "a/b"), Some(b));
        assert_eq!(resolve(&mut fs, ROOT_INODE, "/a/b/"), Some(b));
    }

    #[test]
    fn missing_component_is_not_found() {
        let mut fs = Filesystem::format_memory(4, 512);
        mkdir(&mut fs, ROOT_INODE, "a");
        assert_eq!(resolve(&mut fs, ROOT_INODE, "a/missing"), None);
        assert_eq!(resolve(&mut fs, ROOT_INODE, "missing"), None);
    }

    #[test]
    fn descending_through_a_file_fails() {
        let mut fs = Filesystem::format_memory(4, 512);
        let file = fs.alloc_inode().unwrap();
        fs.write_inode(file, |ino| {
            ino.set_in_use(true);
            ino.set_type(FileType::File);
        });
        let slot = fs.add_dir_entry(ROOT_INODE).unwrap();
        fs.set_dir_name(slot, "f", false).unwrap();
        fs.set_dir_inode(slot, file);

        assert_eq!(resolve(&mut fs, ROOT_INODE, "f"), Some(file));
        assert_eq!(resolve(&mut fs, ROOT_INODE, "f/anything"), None);
    }
}
