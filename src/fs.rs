use super::*;
use block_device::{BlockDevice, FileDisk};
use disk::{DiskInode, InodeKind, Region, SuperBlock};
use volume::Volume;

use log::info;
use std::path::Path;

/// inodes written per chunk while formatting
const FORMAT_INODE_CHUNK: usize = 1024;
/// data blocks zeroed per chunk while formatting
const FORMAT_ZERO_CHUNK: usize = 64;

/// One mounted image plus the session state that goes with it.
pub struct FileSystem {
    vol: Volume,
    cwd: InodeId,
    last_error: Option<ErrorKind>,
}

impl FileSystem {
    /// Lays out a fresh image of `size_mb` MiB at `path`, replacing whatever was
    /// there, and mounts it with the root as working directory.
    pub fn format(path: &Path, size_mb: u64) -> Result<Self> {
        let disk_size = size_mb
            .checked_mul(MIB)
            .filter(|&size| size > 0)
            .ok_or_else(|| FsError::InvalidArgument(format!("bad image size {size_mb} MiB")))?;
        let super_blk = SuperBlock::new(disk_size)?;

        let blk_dev = FileDisk::create(path, disk_size)?;
        blk_dev.write_at(0, &disk::encode(&super_blk)?)?;
        let vol = Volume::new(Box::new(blk_dev), super_blk);

        // slot 0 of both maps belongs to the root
        vol.inode_map().format(vol.blk_dev(), 1)?;
        vol.data_map().format(vol.blk_dev(), 1)?;
        Self::write_inode_table(&vol)?;
        Self::zero_data(&vol)?;

        let root_link: Link = 1;
        vol.write_dir_block(
            root_link,
            &disk::new_dir_block(ROOT_ID, ROOT_ID, vol.count_dir_items()),
        )?;
        vol.flush()?;

        info!(
            "formatted {}: {size_mb} MiB, {} blocks of {} bytes",
            path.display(),
            vol.block_count(),
            vol.block_size()
        );
        Ok(Self::with_volume(vol))
    }

    fn write_inode_table(vol: &Volume) -> Result<()> {
        let count = vol.block_count();
        for first in (0..count).step_by(FORMAT_INODE_CHUNK) {
            let last = count.min(first + FORMAT_INODE_CHUNK);
            let mut raw = Vec::with_capacity((last - first) * INODE_SIZE);
            for slot in first..last {
                let id = slot as InodeId + 1;
                let inode = if id == ROOT_ID {
                    let mut root = DiskInode::new(ROOT_ID, InodeKind::Directory);
                    root.direct[0] = 1;
                    root.file_size = vol.block_size() as u32;
                    root
                } else {
                    DiskInode::new(id, InodeKind::Free)
                };
                raw.extend_from_slice(&disk::encode(&inode)?);
            }
            let addr = vol.super_blk().addr(Region::InodeTable, first as u64);
            vol.blk_dev().write_at(addr, &raw)?;
        }
        Ok(())
    }

    fn zero_data(vol: &Volume) -> Result<()> {
        let super_blk = vol.super_blk();
        let zeros = vec![0u8; FORMAT_ZERO_CHUNK * vol.block_size()];
        let mut addr = super_blk.addr_data;
        while addr < super_blk.disk_size {
            let n = (super_blk.disk_size - addr).min(zeros.len() as u64);
            vol.blk_dev().write_at(addr, &zeros[..n as usize])?;
            addr += n;
        }
        Ok(())
    }

    /// Mounts an existing image. A missing or foreign file is `NotFormatted`.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(FsError::NotFormatted);
        }
        let blk_dev = FileDisk::open(path)?;
        let image_len = blk_dev.len()?;
        let vol = Volume::mount(Box::new(blk_dev), image_len)?;

        match vol.read_inode(ROOT_ID) {
            Ok(root) if root.is_dir() => {}
            _ => return Err(FsError::NotFormatted),
        }
        info!(
            "opened {}: {} blocks, {} free",
            path.display(),
            vol.block_count(),
            vol.free_blocks()?
        );
        Ok(Self::with_volume(vol))
    }

    fn with_volume(vol: Volume) -> Self {
        Self {
            vol,
            cwd: ROOT_ID,
            last_error: None,
        }
    }

    /// Flushes the image and drops the handle.
    pub fn close(self) -> Result<()> {
        self.vol.flush()?;
        info!("closed image");
        Ok(())
    }

    pub fn superblock(&self) -> &SuperBlock {
        self.vol.super_blk()
    }

    /// Kind of the most recent failed operation.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn cwd(&self) -> InodeId {
        self.cwd
    }

    pub(crate) fn set_cwd(&mut self, id: InodeId) {
        self.cwd = id;
    }

    pub(crate) fn volume(&self) -> &Volume {
        &self.vol
    }

    /// Runs one operation and remembers the kind of its failure.
    pub(crate) fn track<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = op(self);
        if let Err(err) = &result {
            self.last_error = Some(err.kind());
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_seeds_root_and_maps() {
        let (_dir, fs) = testing::scratch(1);
        let vol = fs.volume();
        let root = vol.read_inode(ROOT_ID).unwrap();
        assert!(root.is_dir());
        assert_eq!(root.direct[0], 1);
        assert_eq!(root.file_size as usize, BLOCK_SIZE);
        assert_eq!(vol.free_inodes().unwrap(), vol.block_count() - 1);
        assert_eq!(vol.free_blocks().unwrap(), vol.block_count() - 1);
        assert!(vol.read_inode(2).unwrap().is_free());
        assert_eq!(fs.cwd(), ROOT_ID);
        assert_eq!(fs.last_error(), None);
    }

    #[test]
    fn reopen_sees_the_same_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let formatted = FileSystem::format(&path, 2).unwrap();
        let expected = formatted.superblock().clone();
        formatted.close().unwrap();

        let fs = FileSystem::open(&path).unwrap();
        assert_eq!(fs.superblock(), &expected);
    }

    #[test]
    fn missing_or_foreign_images_are_not_formatted() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileSystem::open(&dir.path().join("missing.img"));
        assert_eq!(missing.err().map(|err| err.kind()), Some(ErrorKind::NotFormatted));

        let junk = dir.path().join("junk.img");
        std::fs::write(&junk, vec![0xAB; 4096]).unwrap();
        let foreign = FileSystem::open(&junk);
        assert_eq!(foreign.err().map(|err| err.kind()), Some(ErrorKind::NotFormatted));

        let short = dir.path().join("short.img");
        std::fs::write(&short, b"SIMFS").unwrap();
        let short = FileSystem::open(&short);
        assert_eq!(short.err().map(|err| err.kind()), Some(ErrorKind::NotFormatted));
    }

    #[test]
    fn zero_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileSystem::format(&dir.path().join("zero.img"), 0).err();
        assert_eq!(err.map(|err| err.kind()), Some(ErrorKind::InvalidArgument));
    }

    #[test]
    fn track_keeps_the_last_failure() {
        let (_dir, mut fs) = testing::scratch(1);
        let _ = fs.track(|_| -> Result<()> { Err(FsError::OutOfInodes) });
        assert_eq!(fs.last_error(), Some(ErrorKind::OutOfInodes));
        fs.track(|_| Ok(())).unwrap();
        assert_eq!(fs.last_error(), Some(ErrorKind::OutOfInodes));
    }
}
