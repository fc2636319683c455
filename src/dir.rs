//! Directories are inodes whose leaves are arrays of `DirEntry`. Slot 0 and 1 of
//! the first block are always `.` and `..`.

use super::*;
use disk::{DirEntry, DiskInode, InodeKind, Name};
use volume::Volume;

use log::{debug, warn};
use std::ops::ControlFlow;

/// Runs `visit` on the entries of every directory block, in link order.
fn scan<B, F>(vol: &Volume, dir: &DiskInode, mut visit: F) -> Result<Option<B>>
where
    F: FnMut(Link, &[DirEntry]) -> Result<ControlFlow<B>>,
{
    link::iterate(vol, dir, |links| {
        for &link in links.iter().filter(|&&link| link != FREE_LINK) {
            let entries = vol.read_dir_block(link)?;
            if let ControlFlow::Break(found) = visit(link, &entries)? {
                return Ok(ControlFlow::Break(found));
            }
        }
        Ok(ControlFlow::Continue(()))
    })
}

pub fn find_by_name(vol: &Volume, dir: &DiskInode, name: &str) -> Result<Option<InodeId>> {
    scan(vol, dir, |_, entries| {
        Ok(match entries.iter().find(|entry| entry.matches(name)) {
            Some(entry) => ControlFlow::Break(entry.inode_id),
            None => ControlFlow::Continue(()),
        })
    })
}

/// Name under which `dir` lists `id`; `.` and `..` are skipped.
pub fn find_by_id(vol: &Volume, dir: &DiskInode, id: InodeId) -> Result<Option<String>> {
    scan(vol, dir, |_, entries| {
        Ok(
            match entries
                .iter()
                .find(|entry| !entry.is_free() && !entry.is_dot() && entry.inode_id == id)
            {
                Some(entry) => ControlFlow::Break(entry.name().into_owned()),
                None => ControlFlow::Continue(()),
            },
        )
    })
}

/// Every used entry, dots included.
pub fn entries(vol: &Volume, dir: &DiskInode) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    scan::<(), _>(vol, dir, |_, entries| {
        out.extend(entries.iter().filter(|entry| !entry.is_free()).cloned());
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(out)
}

pub fn is_full(entries: &[DirEntry]) -> bool {
    entries.iter().all(|entry| !entry.is_free())
}

/// True when nothing but `.` and `..` is left.
pub fn is_empty(vol: &Volume, dir: &DiskInode) -> Result<bool> {
    let other = scan(vol, dir, |_, entries| {
        if entries.iter().any(|entry| !entry.is_free() && !entry.is_dot()) {
            Ok(ControlFlow::Break(()))
        } else {
            Ok(ControlFlow::Continue(()))
        }
    })?;
    Ok(other.is_none())
}

/// Whether one more entry fits without a new block.
pub fn has_free_slot(vol: &Volume, dir: &DiskInode) -> Result<bool> {
    let slot = scan(vol, dir, |_, entries| {
        if is_full(entries) {
            Ok(ControlFlow::Continue(()))
        } else {
            Ok(ControlFlow::Break(()))
        }
    })?;
    Ok(slot.is_some())
}

/// Blocks an insert into `dir` may consume.
pub fn insert_cost(vol: &Volume, dir: &DiskInode) -> Result<usize> {
    if has_free_slot(vol, dir)? {
        return Ok(0);
    }
    let current = link::count_leaves(vol, dir)?;
    Ok(link::growth_cost(current, 1, vol.count_links()))
}

/// Writes the entry into the first free slot, growing the directory by one block
/// when every block is full.
pub fn insert(vol: &Volume, dir: &mut DiskInode, id: InodeId, name: &Name) -> Result<()> {
    let placed = scan(vol, dir, |link, entries| {
        match entries.iter().position(DirEntry::is_free) {
            Some(slot) => {
                let mut entries = entries.to_vec();
                entries[slot] = DirEntry::new(id, name);
                vol.write_dir_block(link, &entries)?;
                Ok(ControlFlow::Break(()))
            }
            None => Ok(ControlFlow::Continue(())),
        }
    })?;
    if placed.is_some() {
        debug!("dir {}: + `{name}` -> {id}", dir.id);
        return Ok(());
    }

    let link = link::allocate_links(vol, dir, 1)?[0];
    let mut entries = vec![DirEntry::default(); vol.count_dir_items()];
    entries[0] = DirEntry::new(id, name);
    vol.write_dir_block(link, &entries)?;
    dir.file_size += vol.block_size() as u32;
    vol.write_inode(dir)?;
    debug!("dir {}: grew to block {link} for `{name}`", dir.id);
    Ok(())
}

/// Clears the slot holding `name`; returns the inode it pointed at.
pub fn delete(vol: &Volume, dir: &DiskInode, name: &str) -> Result<InodeId> {
    let removed = scan(vol, dir, |link, entries| {
        match entries.iter().position(|entry| entry.matches(name)) {
            Some(slot) => {
                let mut entries = entries.to_vec();
                let id = entries[slot].inode_id;
                entries[slot] = DirEntry::default();
                vol.write_dir_block(link, &entries)?;
                Ok(ControlFlow::Break(id))
            }
            None => Ok(ControlFlow::Continue(())),
        }
    })?;
    let id = removed.ok_or_else(|| FsError::NotFound(name.to_owned()))?;
    debug!("dir {}: - `{name}` ({id})", dir.id);
    Ok(id)
}

/// Clears every entry other than the dots that `select` picks; returns how many.
pub fn delete_where<F>(vol: &Volume, dir: &DiskInode, mut select: F) -> Result<usize>
where
    F: FnMut(&DirEntry) -> bool,
{
    let mut removed = 0;
    scan::<(), _>(vol, dir, |link, entries| {
        let mut entries = entries.to_vec();
        let mut hits = 0;
        for entry in entries.iter_mut() {
            if !entry.is_free() && !entry.is_dot() && select(entry) {
                debug!("dir {}: - `{}` ({})", dir.id, entry.name(), entry.inode_id);
                *entry = DirEntry::default();
                hits += 1;
            }
        }
        if hits > 0 {
            vol.write_dir_block(link, &entries)?;
            removed += hits;
        }
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(removed)
}

/// Parent id from the `..` slot of the first block.
pub fn parent_of(vol: &Volume, dir: &DiskInode) -> Result<InodeId> {
    let first = vol.read_dir_block(dir.direct[0])?;
    match first.get(1) {
        Some(entry) if entry.matches("..") => Ok(entry.inode_id),
        _ => Err(FsError::inconsistent(format!("dir {}: `..` missing", dir.id))),
    }
}

/// Points `..` at `parent`.
pub fn set_parent(vol: &Volume, dir: &DiskInode, parent: InodeId) -> Result<()> {
    let mut first = vol.read_dir_block(dir.direct[0])?;
    match first.get_mut(1) {
        Some(entry) if entry.matches("..") => {
            *entry = DirEntry::new(parent, &Name::dot_dot());
        }
        _ => return Err(FsError::inconsistent(format!("dir {}: `..` missing", dir.id))),
    }
    vol.write_dir_block(dir.direct[0], &first)
}

/// Creates an empty directory `name` inside `parent`. Nothing is left behind on failure.
pub fn make_dir(vol: &Volume, parent: &mut DiskInode, name: &Name) -> Result<InodeId> {
    vol.ensure_free_blocks(1 + insert_cost(vol, parent)?)?;

    let mut dir = vol.alloc_inode(InodeKind::Directory)?;
    let result = || -> Result<()> {
        let link = link::allocate_links(vol, &mut dir, 1)?[0];
        vol.write_dir_block(link, &disk::new_dir_block(dir.id, parent.id, vol.count_dir_items()))?;
        dir.file_size = vol.block_size() as u32;
        vol.write_inode(&dir)?;
        insert(vol, parent, dir.id, name)
    }();

    match result {
        Ok(()) => {
            debug!("mkdir `{name}` -> {} under {}", dir.id, parent.id);
            Ok(dir.id)
        }
        Err(err) => {
            warn!("mkdir `{name}` failed, discarding inode {}: {err}", dir.id);
            discard(vol, &mut dir);
            Err(err)
        }
    }
}

/// Best-effort release of a half-built inode.
pub fn discard(vol: &Volume, inode: &mut DiskInode) {
    if let Err(err) = link::free_all_links(vol, inode).and_then(|_| vol.release_inode(inode)) {
        warn!("inode {} could not be discarded: {err}", inode.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::testing::scratch;

    fn name(raw: &str) -> Name {
        Name::new(raw).unwrap()
    }

    #[test]
    fn root_starts_with_dots_only() {
        let (_dir, fs) = scratch(1);
        let vol = fs.volume();
        let root = vol.read_inode(ROOT_ID).unwrap();
        assert!(is_empty(vol, &root).unwrap());
        assert_eq!(parent_of(vol, &root).unwrap(), ROOT_ID);
        assert_eq!(find_by_name(vol, &root, ".").unwrap(), Some(ROOT_ID));
        assert_eq!(find_by_name(vol, &root, "..").unwrap(), Some(ROOT_ID));
        assert_eq!(find_by_id(vol, &root, ROOT_ID).unwrap(), None);
    }

    #[test]
    fn insert_find_delete() {
        let (_dir, fs) = scratch(1);
        let vol = fs.volume();
        let mut root = vol.read_inode(ROOT_ID).unwrap();
        insert(vol, &mut root, 7, &name("seven")).unwrap();

        assert_eq!(find_by_name(vol, &root, "seven").unwrap(), Some(7));
        assert_eq!(find_by_id(vol, &root, 7).unwrap().as_deref(), Some("seven"));
        assert!(!is_empty(vol, &root).unwrap());

        assert_eq!(delete(vol, &root, "seven").unwrap(), 7);
        assert_eq!(find_by_name(vol, &root, "seven").unwrap(), None);
        assert!(is_empty(vol, &root).unwrap());
        assert_eq!(
            delete(vol, &root, "seven").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn delete_where_skips_the_dots() {
        let (_dir, fs) = scratch(1);
        let vol = fs.volume();
        let mut root = vol.read_inode(ROOT_ID).unwrap();
        insert(vol, &mut root, 40, &name("a")).unwrap();
        insert(vol, &mut root, 41, &name("b")).unwrap();
        insert(vol, &mut root, 40, &name("c")).unwrap();

        let removed = delete_where(vol, &root, |entry| {
            entry.inode_id == 40 || entry.inode_id == ROOT_ID
        })
        .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(find_by_name(vol, &root, "b").unwrap(), Some(41));
        assert_eq!(find_by_name(vol, &root, "a").unwrap(), None);
        assert_eq!(find_by_name(vol, &root, "..").unwrap(), Some(ROOT_ID));
    }

    #[test]
    fn full_directory_grows_by_one_block() {
        let (_dir, fs) = scratch(1);
        let vol = fs.volume();
        let mut root = vol.read_inode(ROOT_ID).unwrap();
        let per_block = vol.count_dir_items();
        for i in 0..per_block - 2 {
            insert(vol, &mut root, 100 + i as InodeId, &name(&format!("f{i}"))).unwrap();
        }
        assert_eq!(link::count_leaves(vol, &root).unwrap(), 1);
        assert!(!has_free_slot(vol, &root).unwrap());
        assert_eq!(insert_cost(vol, &root).unwrap(), 1);

        insert(vol, &mut root, 999, &name("spill")).unwrap();
        assert_eq!(link::count_leaves(vol, &root).unwrap(), 2);
        assert_eq!(root.file_size as usize, 2 * vol.block_size());
        assert_eq!(find_by_name(vol, &root, "spill").unwrap(), Some(999));
        assert_eq!(vol.read_inode(ROOT_ID).unwrap(), root);

        // a freed slot in the first block is reused before the second fills
        delete(vol, &root, "f3").unwrap();
        insert(vol, &mut root, 1000, &name("again")).unwrap();
        let first = vol.read_dir_block(root.direct[0]).unwrap();
        assert!(first.iter().any(|entry| entry.matches("again")));
    }

    #[test]
    fn make_dir_links_both_ways() {
        let (_dir, fs) = scratch(1);
        let vol = fs.volume();
        let mut root = vol.read_inode(ROOT_ID).unwrap();
        let id = make_dir(vol, &mut root, &name("sub")).unwrap();
        let sub = vol.read_inode(id).unwrap();
        assert!(sub.is_dir());
        assert_eq!(parent_of(vol, &sub).unwrap(), ROOT_ID);
        assert_eq!(find_by_name(vol, &sub, ".").unwrap(), Some(id));
        assert_eq!(find_by_id(vol, &root, id).unwrap().as_deref(), Some("sub"));

        set_parent(vol, &sub, 42).unwrap();
        assert_eq!(parent_of(vol, &sub).unwrap(), 42);
    }
}
