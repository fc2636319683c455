//! User-level operations. Each one checks capacity before it mutates anything and
//! either commits every structural change or leaves the image as it found it.

use super::*;
use disk::{DiskInode, InodeKind, Name};
use fs::FileSystem;
use volume::Volume;

use log::{debug, info};
use std::ops::ControlFlow;
use std::path::Path;

/// One `ls` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub id: InodeId,
    pub kind: InodeKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeInfo {
    pub name: String,
    pub id: InodeId,
    pub kind: InodeKind,
    pub file_size: u32,
    /// data blocks in file order
    pub data_links: Vec<Link>,
    pub index_links: Vec<Link>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Usage {
    pub block_size: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub total_inodes: usize,
    pub free_inodes: usize,
}

/// An existing entry that may be unlinked: never the root, `.` or `..`.
struct Entry<'p> {
    id: InodeId,
    parent: InodeId,
    name: &'p str,
}

impl FileSystem {
    pub fn mkdir(&mut self, path: &str) -> Result<InodeId> {
        self.track(|fs| {
            let vol = fs.volume();
            let (mut parent, name) = fs.new_entry(path)?;
            let id = dir::make_dir(vol, &mut parent, &name)?;
            info!("mkdir {path} -> {id}");
            Ok(id)
        })
    }

    /// Removes an empty directory.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.track(|fs| {
            let entry = fs.entry(path)?;
            let vol = fs.volume();
            let mut inode = vol.read_inode(entry.id)?;
            if !inode.is_dir() {
                return Err(FsError::NotADirectory(path.to_owned()));
            }
            if !dir::is_empty(vol, &inode)? {
                return Err(FsError::DirectoryNotEmpty(path.to_owned()));
            }

            let parent = vol.read_inode(entry.parent)?;
            dir::delete(vol, &parent, entry.name)?;
            link::free_all_links(vol, &mut inode)?;
            vol.release_inode(&mut inode)?;
            if fs.cwd() == entry.id {
                fs.set_cwd(entry.parent);
            }
            info!("rmdir {path} ({})", entry.id);
            Ok(())
        })
    }

    /// Removes a file. The entry goes first, so an interrupted `rm` leaves a lost
    /// inode for fsck rather than a dangling entry.
    pub fn rm(&mut self, path: &str) -> Result<()> {
        self.track(|fs| {
            let entry = fs.entry(path)?;
            let vol = fs.volume();
            let mut inode = vol.read_inode(entry.id)?;
            if !inode.is_file() {
                return Err(FsError::NotAFile(path.to_owned()));
            }

            let parent = vol.read_inode(entry.parent)?;
            dir::delete(vol, &parent, entry.name)?;
            link::free_all_links(vol, &mut inode)?;
            vol.release_inode(&mut inode)?;
            info!("rm {path} ({})", entry.id);
            Ok(())
        })
    }

    /// Relinks `src` under `dst`. An existing directory `dst` receives `src` under
    /// its own name.
    pub fn mv(&mut self, src: &str, dst: &str) -> Result<()> {
        self.track(|fs| {
            let entry = fs.entry(src)?;
            let vol = fs.volume();
            let inode = vol.read_inode(entry.id)?;
            let (mut target, name) = fs.destination(dst, entry.name)?;

            if inode.is_dir() && is_within(vol, target.id, entry.id)? {
                return Err(FsError::InvalidArgument(format!(
                    "cannot move `{src}` into itself"
                )));
            }
            vol.ensure_free_blocks(dir::insert_cost(vol, &target)?)?;

            dir::insert(vol, &mut target, entry.id, &name)?;
            let parent = vol.read_inode(entry.parent)?;
            dir::delete(vol, &parent, entry.name)?;
            if inode.is_dir() {
                dir::set_parent(vol, &inode, target.id)?;
            }
            info!("mv {src} -> {dst} ({})", entry.id);
            Ok(())
        })
    }

    /// Copies a file. The copy becomes visible only once every block is written.
    pub fn cp(&mut self, src: &str, dst: &str) -> Result<InodeId> {
        self.track(|fs| {
            let vol = fs.volume();
            let source = fs.resolve_inode(src)?;
            if !source.is_file() {
                return Err(FsError::NotAFile(src.to_owned()));
            }
            let (_, src_name) = path::split(src)?;
            let (mut target, name) = fs.destination(dst, src_name)?;

            let leaves = link::count_leaves(vol, &source)?;
            link::ensure_capacity(vol, leaves, dir::insert_cost(vol, &target)?)?;

            let mut copy = vol.alloc_inode(InodeKind::File)?;
            let result = || -> Result<()> {
                let mut fresh = link::allocate_links(vol, &mut copy, leaves)?.into_iter();
                link::iterate::<(), _>(vol, &source, |links| {
                    for &from in links.iter().filter(|&&link| link != FREE_LINK) {
                        let to = fresh
                            .next()
                            .ok_or_else(|| FsError::inconsistent("copy ran out of blocks"))?;
                        vol.write_block(to, &vol.read_block(from)?)?;
                    }
                    Ok(ControlFlow::Continue(()))
                })?;
                copy.file_size = source.file_size;
                vol.write_inode(&copy)?;
                dir::insert(vol, &mut target, copy.id, &name)
            }();

            match result {
                Ok(()) => {
                    info!("cp {src} -> {dst} ({} -> {})", source.id, copy.id);
                    Ok(copy.id)
                }
                Err(err) => {
                    dir::discard(vol, &mut copy);
                    Err(err)
                }
            }
        })
    }

    pub fn cd(&mut self, path: &str) -> Result<()> {
        self.track(|fs| {
            let inode = fs.resolve_inode(path)?;
            if !inode.is_dir() {
                return Err(FsError::NotADirectory(path.to_owned()));
            }
            fs.set_cwd(inode.id);
            Ok(())
        })
    }

    pub fn pwd(&mut self) -> Result<String> {
        self.track(|fs| path::path_to_root(fs.volume(), fs.cwd()))
    }

    /// Entries of a directory (the working directory by default), dots excluded.
    pub fn ls(&mut self, path: Option<&str>) -> Result<Vec<Listing>> {
        self.track(|fs| {
            let path = path.unwrap_or(".");
            let vol = fs.volume();
            let inode = fs.resolve_inode(path)?;
            if !inode.is_dir() {
                return Err(FsError::NotADirectory(path.to_owned()));
            }
            dir::entries(vol, &inode)?
                .into_iter()
                .filter(|entry| !entry.is_dot())
                .map(|entry| -> Result<Listing> {
                    Ok(Listing {
                        name: entry.name().into_owned(),
                        id: entry.inode_id,
                        kind: vol.read_inode(entry.inode_id)?.kind,
                    })
                })
                .collect()
        })
    }

    pub fn cat(&mut self, path: &str) -> Result<Vec<u8>> {
        self.track(|fs| {
            let inode = fs.resolve_inode(path)?;
            if !inode.is_file() {
                return Err(FsError::NotAFile(path.to_owned()));
            }
            link::read_data(fs.volume(), &inode)
        })
    }

    pub fn info(&mut self, path: &str) -> Result<InodeInfo> {
        self.track(|fs| {
            let vol = fs.volume();
            let inode = fs.resolve_inode(path)?;
            let name = match inode.id {
                ROOT_ID => SEPARATOR.to_string(),
                _ => path::split(path)?.1.to_owned(),
            };
            Ok(InodeInfo {
                name,
                id: inode.id,
                kind: inode.kind,
                file_size: inode.file_size,
                data_links: link::leaves(vol, &inode)?,
                index_links: link::index_blocks(vol, &inode)?,
            })
        })
    }

    /// Imports a host file. An existing file at the destination keeps its inode
    /// and is resized in place.
    pub fn incp(&mut self, host: &Path, dst: &str) -> Result<InodeId> {
        self.track(|fs| {
            let data = std::fs::read(host)?;
            let host_name = host
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| FsError::InvalidArgument(format!("{}", host.display())))?;
            let vol = fs.volume();
            let (mut target, name) = fs.destination_or_existing(dst, host_name)?;

            let want = data.len().div_ceil(vol.block_size());
            if let Some(id) = dir::find_by_name(vol, &target, name.as_str())? {
                let mut existing = vol.read_inode(id)?;
                if !existing.is_file() {
                    return Err(FsError::NotAFile(dst.to_owned()));
                }
                let current = link::count_leaves(vol, &existing)?;
                if want > current {
                    let cost = link::growth_cost(current, want - current, vol.count_links());
                    vol.ensure_free_blocks(cost)?;
                }
                link::write_data(vol, &mut existing, &data)?;
                info!("incp {} -> {dst}: overwrote {id}", host.display());
                return Ok(id);
            }

            link::ensure_capacity(vol, want, dir::insert_cost(vol, &target)?)?;
            let mut file = vol.alloc_inode(InodeKind::File)?;
            let result = || -> Result<()> {
                link::write_data(vol, &mut file, &data)?;
                dir::insert(vol, &mut target, file.id, &name)
            }();
            match result {
                Ok(()) => {
                    info!("incp {} -> {dst} ({} bytes, {})", host.display(), data.len(), file.id);
                    Ok(file.id)
                }
                Err(err) => {
                    dir::discard(vol, &mut file);
                    Err(err)
                }
            }
        })
    }

    /// Exports a file to the host.
    pub fn outcp(&mut self, src: &str, host: &Path) -> Result<()> {
        self.track(|fs| {
            let inode = fs.resolve_inode(src)?;
            if !inode.is_file() {
                return Err(FsError::NotAFile(src.to_owned()));
            }
            let data = link::read_data(fs.volume(), &inode)?;
            std::fs::write(host, &data)?;
            info!("outcp {src} -> {} ({} bytes)", host.display(), data.len());
            Ok(())
        })
    }

    pub fn statfs(&mut self) -> Result<Usage> {
        self.track(|fs| {
            let vol = fs.volume();
            Ok(Usage {
                block_size: vol.block_size(),
                total_blocks: vol.block_count(),
                free_blocks: vol.free_blocks()?,
                total_inodes: vol.block_count(),
                free_inodes: vol.free_inodes()?,
            })
        })
    }

    fn resolve_inode(&self, path: &str) -> Result<DiskInode> {
        let (id, _) = path::resolve(self.volume(), self.cwd(), path)?;
        self.volume().read_inode(id)
    }

    /// Directory `path` as an inode, failing unless it is one.
    fn resolve_dir(&self, path: &str) -> Result<DiskInode> {
        let inode = self.resolve_inode(path)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(path.to_owned()));
        }
        Ok(inode)
    }

    /// Parent directory and name for an entry `path` that must not exist yet.
    fn new_entry(&self, path: &str) -> Result<(DiskInode, Name)> {
        let (parent_path, name) = path::split(path)?;
        let name = Name::new(name)?;
        let parent = self.resolve_dir(parent_path)?;
        if dir::find_by_name(self.volume(), &parent, name.as_str())?.is_some() {
            return Err(FsError::AlreadyExists(path.to_owned()));
        }
        Ok((parent, name))
    }

    /// Where `dst` puts an entry called `fallback`: inside `dst` when it is an
    /// existing directory, otherwise at `dst` itself.
    fn destination_or_existing(&self, dst: &str, fallback: &str) -> Result<(DiskInode, Name)> {
        match self.resolve_inode(dst) {
            Ok(inode) if inode.is_dir() => Ok((inode, Name::new(fallback)?)),
            Ok(_) | Err(FsError::NotFound(_)) => {
                let (parent_path, name) = path::split(dst)?;
                Ok((self.resolve_dir(parent_path)?, Name::new(name)?))
            }
            Err(err) => Err(err),
        }
    }

    /// Like `destination_or_existing`, but the name must still be free.
    fn destination(&self, dst: &str, fallback: &str) -> Result<(DiskInode, Name)> {
        let (target, name) = self.destination_or_existing(dst, fallback)?;
        if dir::find_by_name(self.volume(), &target, name.as_str())?.is_some() {
            return Err(FsError::AlreadyExists(dst.to_owned()));
        }
        Ok((target, name))
    }

    /// Resolves an entry that may be unlinked.
    fn entry<'p>(&self, path: &'p str) -> Result<Entry<'p>> {
        let (_, name) = path::split(path)?;
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument(format!("cannot unlink `{path}`")));
        }
        let (id, parent) = path::resolve(self.volume(), self.cwd(), path)?;
        if id == ROOT_ID {
            return Err(FsError::InvalidArgument("cannot unlink the root".to_owned()));
        }
        debug!("entry {path}: {id} in {parent}");
        Ok(Entry { id, parent, name })
    }
}

/// Whether directory `id` is `ancestor` or lies below it.
fn is_within(vol: &Volume, id: InodeId, ancestor: InodeId) -> Result<bool> {
    let mut current = id;
    for _ in 0..vol.block_count() {
        if current == ancestor {
            return Ok(true);
        }
        if current == ROOT_ID {
            return Ok(false);
        }
        current = dir::parent_of(vol, &vol.read_inode(current)?)?;
    }
    Err(FsError::inconsistent(format!("`..` chain of {id} loops")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fs::testing::scratch;

    fn names(listing: &[Listing]) -> Vec<&str> {
        listing.iter().map(|entry| entry.name.as_str()).collect()
    }

    fn put(fs: &mut FileSystem, dir: &tempfile::TempDir, path: &str, data: &[u8]) -> InodeId {
        let host = dir.path().join("upload");
        std::fs::write(&host, data).unwrap();
        fs.incp(&host, path).unwrap()
    }

    fn maps(fs: &FileSystem) -> (Vec<u8>, Vec<u8>) {
        let vol = fs.volume();
        (
            vol.inode_map().load(vol.blk_dev()).unwrap(),
            vol.data_map().load(vol.blk_dev()).unwrap(),
        )
    }

    /// Uploads one large file and then one-block files until `left` blocks are free.
    fn fill_to(fs: &mut FileSystem, dir: &tempfile::TempDir, left: usize) {
        let free = fs.statfs().unwrap().free_blocks;
        let count_links = fs.volume().count_links();
        let leaves = (0..free)
            .rev()
            .find(|&n| link::growth_cost(0, n, count_links) + 8 <= free - left)
            .unwrap();
        put(fs, dir, "/filler", &vec![1u8; leaves * BLOCK_SIZE]);
        let mut pad = 0;
        while fs.statfs().unwrap().free_blocks > left {
            put(fs, dir, &format!("/pad{pad}"), b"p");
            pad += 1;
        }
        assert_eq!(fs.statfs().unwrap().free_blocks, left);
    }

    #[test]
    fn mkdir_then_ls_shows_one_directory() {
        let (_dir, mut fs) = scratch(1);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        let listing = fs.ls(Some("/a")).unwrap();
        assert_eq!(names(&listing), ["b"]);
        assert_eq!(listing[0].kind, InodeKind::Directory);

        assert_eq!(fs.mkdir("/a/b").unwrap_err().kind(), ErrorKind::AlreadyExists);
        assert_eq!(fs.last_error(), Some(ErrorKind::AlreadyExists));
        assert_eq!(fs.mkdir("/nope/x").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            fs.mkdir("/twelve_bytes").unwrap_err().kind(),
            ErrorKind::NameTooLong
        );
    }

    #[test]
    fn rm_and_rmdir_check_kinds_and_emptiness() {
        let (dir, mut fs) = scratch(1);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        put(&mut fs, &dir, "/f", b"data");

        assert_eq!(fs.rm("/a").unwrap_err().kind(), ErrorKind::NotAFile);
        assert_eq!(fs.rmdir("/f").unwrap_err().kind(), ErrorKind::NotADirectory);
        assert_eq!(fs.rmdir("/a").unwrap_err().kind(), ErrorKind::DirectoryNotEmpty);
        assert_eq!(fs.rmdir("/").unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(fs.rmdir("/a/..").unwrap_err().kind(), ErrorKind::InvalidArgument);

        let before = fs.statfs().unwrap();
        fs.rmdir("/a/b").unwrap();
        fs.rmdir("/a").unwrap();
        fs.rm("/f").unwrap();
        let after = fs.statfs().unwrap();
        assert_eq!(after.free_blocks, before.free_blocks + 3);
        assert_eq!(after.free_inodes, before.free_inodes + 3);
        assert!(fs.ls(None).unwrap().is_empty());
    }

    #[test]
    fn rmdir_of_the_working_directory_moves_up() {
        let (_dir, mut fs) = scratch(1);
        fs.mkdir("/a").unwrap();
        fs.cd("/a").unwrap();
        fs.rmdir("/a").unwrap();
        assert_eq!(fs.pwd().unwrap(), "/");
    }

    #[test]
    fn cd_and_pwd_follow_relative_paths() {
        let (_dir, mut fs) = scratch(1);
        fs.mkdir("x").unwrap();
        fs.cd("x").unwrap();
        fs.mkdir("y").unwrap();
        fs.cd("y").unwrap();
        assert_eq!(fs.pwd().unwrap(), "/x/y");
        fs.cd("..").unwrap();
        assert_eq!(fs.pwd().unwrap(), "/x");
        assert_eq!(fs.cd("missing").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(fs.pwd().unwrap(), "/x");
    }

    #[test]
    fn mv_renames_and_relinks_directories() {
        let (dir, mut fs) = scratch(1);
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        let f = put(&mut fs, &dir, "/a/f", b"payload");

        fs.mv("/a/f", "/b").unwrap();
        assert!(fs.ls(Some("/a")).unwrap().is_empty());
        assert_eq!(fs.ls(Some("/b")).unwrap()[0].id, f);

        fs.mv("/b/f", "/b/g").unwrap();
        assert_eq!(fs.cat("/b/g").unwrap(), b"payload");

        fs.mv("/a", "/b").unwrap();
        fs.cd("/b/a").unwrap();
        assert_eq!(fs.pwd().unwrap(), "/b/a");
        fs.cd("..").unwrap();
        assert_eq!(fs.pwd().unwrap(), "/b");

        assert_eq!(fs.mv("/b", "/b/a").unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(fs.mv("/b/g", "/b/a/..").unwrap_err().kind(), ErrorKind::AlreadyExists);
        assert_eq!(fs.mv("/b/a", "/b").unwrap_err().kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn cp_duplicates_blocks_and_leaves_source_alone() {
        let (dir, mut fs) = scratch(2);
        let data: Vec<u8> = (0..7 * BLOCK_SIZE + 300).map(|i| (i * 7 % 256) as u8).collect();
        let src = put(&mut fs, &dir, "/src", &data);
        let src_info = fs.info("/src").unwrap();

        let dst = fs.cp("/src", "/dst").unwrap();
        assert_ne!(src, dst);
        let dst_info = fs.info("/dst").unwrap();
        assert_eq!(dst_info.file_size, src_info.file_size);
        assert_eq!(dst_info.data_links.len(), src_info.data_links.len());
        assert_eq!(dst_info.index_links.len(), 1);
        assert_eq!(fs.cat("/dst").unwrap(), data);
        assert_eq!(fs.info("/src").unwrap(), src_info);

        assert_eq!(fs.cp("/src", "/dst").unwrap_err().kind(), ErrorKind::AlreadyExists);
        fs.mkdir("/d").unwrap();
        assert_eq!(fs.cp("/d", "/e").unwrap_err().kind(), ErrorKind::NotAFile);
    }

    #[test]
    fn cp_without_room_changes_nothing() {
        let (dir, mut fs) = scratch(1);
        let free = fs.statfs().unwrap().free_blocks;
        let half = (free / 2 + 10) * BLOCK_SIZE;
        put(&mut fs, &dir, "/big", &vec![1u8; half]);
        let before = fs.statfs().unwrap();

        let err = fs.cp("/big", "/copy").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfSpace);
        assert_eq!(fs.statfs().unwrap(), before);
        assert_eq!(names(&fs.ls(None).unwrap()), ["big"]);
    }

    #[test]
    fn cp_failing_mid_copy_returns_every_block() {
        let (dir, mut fs) = scratch(1);
        let src = put(&mut fs, &dir, "/src", &vec![5u8; 3 * BLOCK_SIZE]);
        {
            let vol = fs.volume();
            let mut inode = vol.read_inode(src).unwrap();
            inode.direct[2] = vol.block_count() as Link + 7;
            vol.write_inode(&inode).unwrap();
        }
        let before = maps(&fs);

        let err = fs.cp("/src", "/dst").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalInconsistency);
        assert_eq!(maps(&fs), before);
        assert_eq!(names(&fs.ls(None).unwrap()), ["src"]);
    }

    #[test]
    fn mkdir_into_a_full_directory_needs_a_spare_block() {
        let (dir, mut fs) = scratch(1);
        fs.mkdir("/d").unwrap();
        let per_block = fs.volume().count_dir_items();
        for i in 0..per_block - 2 {
            put(&mut fs, &dir, &format!("/d/e{i}"), b"");
        }
        fill_to(&mut fs, &dir, 1);
        let before = maps(&fs);

        assert_eq!(fs.mkdir("/d/x").unwrap_err().kind(), ErrorKind::OutOfSpace);
        assert_eq!(fs.last_error(), Some(ErrorKind::OutOfSpace));
        assert_eq!(maps(&fs), before);
        assert_eq!(fs.ls(Some("/d")).unwrap().len(), per_block - 2);

        // the root still has a free slot, so one block is enough there
        fs.mkdir("/x").unwrap();
        assert_eq!(fs.statfs().unwrap().free_blocks, 0);
    }

    #[test]
    fn incp_overwrites_in_place_and_outcp_exports() {
        let (dir, mut fs) = scratch(1);
        let id = put(&mut fs, &dir, "/f", &vec![9u8; 3 * BLOCK_SIZE]);
        let free = fs.statfs().unwrap().free_blocks;

        assert_eq!(put(&mut fs, &dir, "/f", b"short"), id);
        assert_eq!(fs.statfs().unwrap().free_blocks, free + 2);
        assert_eq!(fs.cat("/f").unwrap(), b"short");

        let out = dir.path().join("out");
        fs.outcp("/f", &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"short");

        fs.mkdir("/d").unwrap();
        let inside = put(&mut fs, &dir, "/d", b"named after host");
        assert_eq!(fs.ls(Some("/d")).unwrap()[0].name, "upload");
        assert_eq!(fs.ls(Some("/d")).unwrap()[0].id, inside);

        assert_eq!(
            fs.incp(&dir.path().join("absent"), "/x").unwrap_err().kind(),
            ErrorKind::HostIo
        );
        assert_eq!(fs.outcp("/d", &out).unwrap_err().kind(), ErrorKind::NotAFile);
    }

    #[test]
    fn info_reports_links() {
        let (_dir, mut fs) = scratch(1);
        let root = fs.info("/").unwrap();
        assert_eq!(root.name, "/");
        assert_eq!(root.id, ROOT_ID);
        assert_eq!(root.data_links, [1]);
        assert!(root.index_links.is_empty());
    }
}
