use super::*;
use bitmap::BitMap;
use block_device::BlockDevice;
use disk::{DirEntry, DiskInode, InodeKind, Region, SuperBlock};

use log::debug;
use std::io;

/// A mounted image: the device, its geometry and both allocators.
/// All I/O is positional, so every accessor takes `&self`.
pub struct Volume {
    blk_dev: Box<dyn BlockDevice>,
    super_blk: SuperBlock,
    inode_map: BitMap,
    data_map: BitMap,
}

impl Volume {
    /// Trusts `super_blk`; used while formatting.
    pub fn new(blk_dev: Box<dyn BlockDevice>, super_blk: SuperBlock) -> Self {
        let slots = super_blk.block_count as usize;
        let inode_map = BitMap::new(super_blk.addr(Region::InodeBitmap, 0), slots);
        let data_map = BitMap::new(super_blk.addr(Region::DataBitmap, 0), slots);
        Self {
            blk_dev,
            super_blk,
            inode_map,
            data_map,
        }
    }

    /// Reads and validates the super block.
    pub fn mount(blk_dev: Box<dyn BlockDevice>, image_len: u64) -> Result<Self> {
        let mut raw = vec![0u8; SUPERBLOCK_SIZE];
        match blk_dev.read_at(0, &mut raw) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(FsError::NotFormatted)
            }
            Err(err) => return Err(err.into()),
        }
        let super_blk: SuperBlock = disk::decode(&raw).map_err(|_| FsError::NotFormatted)?;
        if !super_blk.is_valid() || super_blk.disk_size > image_len {
            return Err(FsError::NotFormatted);
        }
        Ok(Self::new(blk_dev, super_blk))
    }

    pub fn super_blk(&self) -> &SuperBlock {
        &self.super_blk
    }

    pub fn blk_dev(&self) -> &dyn BlockDevice {
        self.blk_dev.as_ref()
    }

    pub fn inode_map(&self) -> &BitMap {
        &self.inode_map
    }

    pub fn data_map(&self) -> &BitMap {
        &self.data_map
    }

    pub fn block_size(&self) -> usize {
        self.super_blk.block_size as usize
    }

    pub fn block_count(&self) -> usize {
        self.super_blk.block_count as usize
    }

    pub fn count_links(&self) -> usize {
        self.super_blk.count_links as usize
    }

    pub fn count_dir_items(&self) -> usize {
        self.super_blk.count_dir_items as usize
    }

    pub fn flush(&self) -> Result<()> {
        self.blk_dev.flush()?;
        Ok(())
    }

    pub fn id_in_range(&self, id: InodeId) -> bool {
        id != 0 && id as usize <= self.block_count()
    }

    pub fn link_in_range(&self, link: Link) -> bool {
        link != FREE_LINK && link as usize <= self.block_count()
    }

    fn slot_of_id(&self, id: InodeId) -> Result<usize> {
        if !self.id_in_range(id) {
            return Err(FsError::inconsistent(format!("inode id {id} out of range")));
        }
        Ok(id as usize - 1)
    }

    fn slot_of_link(&self, link: Link) -> Result<usize> {
        if !self.link_in_range(link) {
            return Err(FsError::inconsistent(format!("link {link} out of range")));
        }
        Ok(link as usize - 1)
    }

    // inode table

    pub fn read_inode(&self, id: InodeId) -> Result<DiskInode> {
        let slot = self.slot_of_id(id)?;
        let mut raw = [0u8; INODE_SIZE];
        self.blk_dev
            .read_at(self.super_blk.addr(Region::InodeTable, slot as u64), &mut raw)?;
        let inode: DiskInode = disk::decode(&raw)?;
        if inode.id != id {
            return Err(FsError::inconsistent(format!(
                "inode slot {id} holds id {}",
                inode.id
            )));
        }
        Ok(inode)
    }

    pub fn write_inode(&self, inode: &DiskInode) -> Result<()> {
        let slot = self.slot_of_id(inode.id)?;
        self.blk_dev.write_at(
            self.super_blk.addr(Region::InodeTable, slot as u64),
            &disk::encode(inode)?,
        )?;
        Ok(())
    }

    /// Takes a free inode slot and writes a fresh inode of `kind` into it.
    pub fn alloc_inode(&self, kind: InodeKind) -> Result<DiskInode> {
        let slot = self
            .inode_map
            .alloc(self.blk_dev())?
            .ok_or(FsError::OutOfInodes)?;
        let inode = DiskInode::new(slot as InodeId + 1, kind);
        if let Err(err) = self.write_inode(&inode) {
            self.inode_map.dealloc(self.blk_dev(), slot)?;
            return Err(err);
        }
        debug!("alloc inode {} ({kind:?})", inode.id);
        Ok(inode)
    }

    /// Resets the inode to free and hands its slot back. Links must already be released.
    pub fn release_inode(&self, inode: &mut DiskInode) -> Result<()> {
        let slot = self.slot_of_id(inode.id)?;
        inode.clear();
        self.write_inode(inode)?;
        self.inode_map.dealloc(self.blk_dev(), slot)?;
        debug!("release inode {}", inode.id);
        Ok(())
    }

    pub fn free_inodes(&self) -> Result<usize> {
        self.inode_map.count_free(self.blk_dev())
    }

    // data region

    pub fn read_block(&self, link: Link) -> Result<Vec<u8>> {
        let index = self.slot_of_link(link)?;
        let mut block = vec![0u8; self.block_size()];
        self.blk_dev
            .read_at(self.super_blk.addr(Region::Data, index as u64), &mut block)?;
        Ok(block)
    }

    /// Writes `data` at the start of the block; shorter data is zero padded.
    pub fn write_block(&self, link: Link, data: &[u8]) -> Result<()> {
        let index = self.slot_of_link(link)?;
        if data.len() > self.block_size() {
            return Err(FsError::inconsistent(format!(
                "{} bytes do not fit a block",
                data.len()
            )));
        }
        let mut block = data.to_vec();
        block.resize(self.block_size(), 0);
        self.blk_dev
            .write_at(self.super_blk.addr(Region::Data, index as u64), &block)?;
        Ok(())
    }

    pub fn read_links(&self, link: Link) -> Result<Vec<Link>> {
        Ok(disk::decode_links(&self.read_block(link)?))
    }

    pub fn write_links(&self, link: Link, links: &[Link]) -> Result<()> {
        self.write_block(link, &disk::encode_links(links, self.block_size()))
    }

    pub fn read_dir_block(&self, link: Link) -> Result<Vec<DirEntry>> {
        disk::decode_dir_block(&self.read_block(link)?)
    }

    pub fn write_dir_block(&self, link: Link, entries: &[DirEntry]) -> Result<()> {
        self.write_block(link, &disk::encode_dir_block(entries, self.block_size())?)
    }

    pub fn alloc_block(&self) -> Result<Link> {
        match self.data_map.alloc(self.blk_dev())? {
            Some(index) => Ok(index as Link + 1),
            None => Err(FsError::OutOfSpace { needed: 1, free: 0 }),
        }
    }

    pub fn free_block(&self, link: Link) -> Result<()> {
        let index = self.slot_of_link(link)?;
        self.data_map.dealloc(self.blk_dev(), index)
    }

    pub fn free_blocks(&self) -> Result<usize> {
        self.data_map.count_free(self.blk_dev())
    }

    /// Fails with `OutOfSpace` unless `needed` data blocks are free.
    pub fn ensure_free_blocks(&self, needed: usize) -> Result<()> {
        let free = self.free_blocks()?;
        if needed > free {
            return Err(FsError::OutOfSpace { needed, free });
        }
        Ok(())
    }
}
