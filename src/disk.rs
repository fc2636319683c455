//! Disk layout, every record bincode-encoded (little-endian, fixed width, no padding):
//! [ super block | inode bitmap | data bitmap | inode table | gap | data blocks ]
//! The data region is pinned to the tail: it starts at `disk_size - block_count * block_size`.

use super::*;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

#[repr(C)]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    /// Must be SIGNATURE
    pub signature: [u8; 8],
    /// Free text, NUL padded
    pub descriptor: [u8; 32],
    /// Size of the image (bytes)
    pub disk_size: u64,
    pub block_size: u32,
    /// Number of data blocks, also the number of inode slots
    pub block_count: u32,
    /// Links per index block
    pub count_links: u32,
    /// Entries per directory block
    pub count_dir_items: u32,
    pub addr_bm_inodes: u64,
    pub addr_bm_data: u64,
    pub addr_inodes: u64,
    pub addr_data: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Region {
    InodeBitmap,
    DataBitmap,
    InodeTable,
    Data,
}

impl SuperBlock {
    /// Lays out an image of `disk_size` bytes.
    pub fn new(disk_size: u64) -> Result<Self> {
        let block_size = BLOCK_SIZE as u64;
        let block_count = disk_size
            .checked_mul(DATA_RATIO.0)
            .map_or(0, |scaled| scaled / DATA_RATIO.1 / block_size);
        if block_count == 0 || block_count > u32::MAX as u64 {
            return Err(FsError::InvalidArgument(format!(
                "cannot lay out {disk_size} bytes"
            )));
        }

        let addr_bm_inodes = SUPERBLOCK_SIZE as u64;
        let addr_bm_data = addr_bm_inodes + block_count;
        let addr_inodes = addr_bm_data + block_count;
        let inodes_end = addr_inodes + block_count * INODE_SIZE as u64;
        let addr_data = disk_size - block_count * block_size;
        if inodes_end > addr_data {
            return Err(FsError::InvalidArgument(format!(
                "{disk_size} bytes leave no room for the inode table"
            )));
        }

        let mut descriptor = [0u8; 32];
        let text = DESCRIPTOR.as_bytes();
        let n = text.len().min(descriptor.len() - 1);
        descriptor[..n].copy_from_slice(&text[..n]);

        Ok(Self {
            signature: SIGNATURE,
            descriptor,
            disk_size,
            block_size: BLOCK_SIZE as u32,
            block_count: block_count as u32,
            count_links: COUNT_LINKS as u32,
            count_dir_items: COUNT_DIR_ITEMS as u32,
            addr_bm_inodes,
            addr_bm_data,
            addr_inodes,
            addr_data,
        })
    }

    /// Signature and geometry check, done before anything else is trusted.
    pub fn is_valid(&self) -> bool {
        let block_size = self.block_size as u64;
        let block_count = self.block_count as u64;
        self.signature == SIGNATURE
            && self.block_size as usize == BLOCK_SIZE
            && self.count_links as usize == COUNT_LINKS
            && self.count_dir_items as usize == COUNT_DIR_ITEMS
            && block_count > 0
            && self.addr_bm_inodes >= SUPERBLOCK_SIZE as u64
            && self.addr_bm_data == self.addr_bm_inodes + block_count
            && self.addr_inodes == self.addr_bm_data + block_count
            && self.addr_inodes + block_count * INODE_SIZE as u64 <= self.addr_data
            && self.addr_data + block_count * block_size == self.disk_size
    }

    /// Absolute byte offset of slot `index` inside `region`.
    pub fn addr(&self, region: Region, index: u64) -> u64 {
        match region {
            Region::InodeBitmap => self.addr_bm_inodes + index,
            Region::DataBitmap => self.addr_bm_data + index,
            Region::InodeTable => self.addr_inodes + index * INODE_SIZE as u64,
            Region::Data => self.addr_data + index * self.block_size as u64,
        }
    }

    pub fn descriptor(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(until_nul(&self.descriptor))
    }
}

#[repr(u32)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    #[default]
    Free = 0,
    File = 1,
    Directory = 2,
}

/// inode on disk
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiskInode {
    pub id: InodeId,
    pub kind: InodeKind,
    /// Size of file (bytes)
    pub file_size: u32,
    pub direct: [Link; DIRECT_LINKS],
    pub indirect1: Link,
    pub indirect2: Link,
}

impl DiskInode {
    pub fn new(id: InodeId, kind: InodeKind) -> Self {
        Self {
            id,
            kind,
            ..Default::default()
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == InodeKind::File
    }

    pub fn is_free(&self) -> bool {
        self.kind == InodeKind::Free
    }

    /// Back to a free slot; keeps the id.
    pub fn clear(&mut self) {
        *self = Self::new(self.id, InodeKind::Free);
    }
}

/// Entry name checked against the on-disk limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Name(String);

impl Name {
    /// longest name, the terminator takes the last byte
    pub const MAX: usize = NAME_LEN - 1;

    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument("empty name".to_owned()));
        }
        if name.len() > Self::MAX {
            return Err(FsError::NameTooLong(name.to_owned()));
        }
        if name == "." || name == ".." || name.contains(SEPARATOR) || name.contains('\0') {
            return Err(FsError::InvalidArgument(format!("bad name `{name}`")));
        }
        Ok(Self(name.to_owned()))
    }

    pub(crate) fn dot() -> Self {
        Self(".".to_owned())
    }

    pub(crate) fn dot_dot() -> Self {
        Self("..".to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DirEntry {
    pub inode_id: InodeId,
    /// NUL terminated; empty marks a free slot
    name: [u8; NAME_LEN],
}

impl DirEntry {
    pub fn new(inode_id: InodeId, name: &Name) -> Self {
        let mut raw = [0u8; NAME_LEN];
        let bytes = name.as_str().as_bytes();
        raw[..bytes.len()].copy_from_slice(bytes);
        Self {
            inode_id,
            name: raw,
        }
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == 0
    }

    /// `.` or `..`
    pub fn is_dot(&self) -> bool {
        matches!(self.name_bytes(), b"." | b"..")
    }

    pub fn matches(&self, name: &str) -> bool {
        !self.is_free() && self.name_bytes() == name.as_bytes()
    }

    pub fn name_bytes(&self) -> &[u8] {
        until_nul(&self.name)
    }

    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name_bytes())
    }
}

fn until_nul(raw: &[u8]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end]
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Index block -> links.
pub fn decode_links(block: &[u8]) -> Vec<Link> {
    block
        .chunks_exact(std::mem::size_of::<Link>())
        .map(|raw| Link::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect()
}

/// Links -> index block, zero padded to `block_size`.
pub fn encode_links(links: &[Link], block_size: usize) -> Vec<u8> {
    let mut block: Vec<u8> = links.iter().flat_map(|link| link.to_le_bytes()).collect();
    block.resize(block_size, 0);
    block
}

/// Directory block -> entries, free slots included.
pub fn decode_dir_block(block: &[u8]) -> Result<Vec<DirEntry>> {
    block.chunks_exact(DIR_ENTRY_SIZE).map(decode::<DirEntry>).collect()
}

/// Entries -> directory block, zero padded to `block_size`.
pub fn encode_dir_block(entries: &[DirEntry], block_size: usize) -> Result<Vec<u8>> {
    let mut block = Vec::with_capacity(block_size);
    for entry in entries {
        block.extend_from_slice(&encode(entry)?);
    }
    block.resize(block_size, 0);
    Ok(block)
}

/// First block of a directory: `.` then `..`, everything else free.
pub fn new_dir_block(id: InodeId, parent: InodeId, count_dir_items: usize) -> Vec<DirEntry> {
    let mut entries = vec![DirEntry::default(); count_dir_items];
    entries[0] = DirEntry::new(id, &Name::dot());
    entries[1] = DirEntry::new(parent, &Name::dot_dot());
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_sizes_match_layout_constants() {
        let sb = SuperBlock::new(MIB).unwrap();
        assert_eq!(bincode::serialized_size(&sb).unwrap() as usize, SUPERBLOCK_SIZE);
        let inode = DiskInode::new(3, InodeKind::File);
        assert_eq!(bincode::serialized_size(&inode).unwrap() as usize, INODE_SIZE);
        let entry = DirEntry::new(3, &Name::new("abc").unwrap());
        assert_eq!(bincode::serialized_size(&entry).unwrap() as usize, DIR_ENTRY_SIZE);
    }

    #[test]
    fn inode_fields_are_little_endian_in_order() {
        let mut inode = DiskInode::new(0x0102, InodeKind::Directory);
        inode.file_size = 7;
        inode.direct[0] = 9;
        inode.indirect2 = 0x0a0b0c0d;
        let raw = encode(&inode).unwrap();
        assert_eq!(&raw[0..4], &[0x02, 0x01, 0, 0]);
        assert_eq!(&raw[4..8], &[2, 0, 0, 0]);
        assert_eq!(&raw[8..12], &[7, 0, 0, 0]);
        assert_eq!(&raw[12..16], &[9, 0, 0, 0]);
        assert_eq!(&raw[36..40], &[0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(decode::<DiskInode>(&raw).unwrap(), inode);
    }

    #[test]
    fn zeroed_inode_decodes_as_free() {
        let inode: DiskInode = decode(&[0u8; INODE_SIZE]).unwrap();
        assert_eq!(inode, DiskInode::default());
        assert_eq!(inode.kind, InodeKind::Free);
    }

    #[test]
    fn layout_is_increasing_and_tail_aligned() {
        let sb = SuperBlock::new(10 * MIB).unwrap();
        assert_eq!(sb.block_count as u64, 10 * MIB * 9 / 10 / BLOCK_SIZE as u64);
        assert!(sb.addr_bm_inodes < sb.addr_bm_data);
        assert!(sb.addr_bm_data < sb.addr_inodes);
        assert!(sb.addr_inodes < sb.addr_data);
        assert_eq!(
            sb.addr_data + sb.block_count as u64 * BLOCK_SIZE as u64,
            10 * MIB
        );
        assert!(sb.is_valid());
        assert_eq!(sb.descriptor(), DESCRIPTOR);
    }

    #[test]
    fn tiny_images_are_refused() {
        assert!(matches!(SuperBlock::new(0), Err(FsError::InvalidArgument(_))));
        assert!(matches!(SuperBlock::new(1000), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn names_are_bounded() {
        assert!(Name::new("abcdefghijk").is_ok());
        assert!(matches!(
            Name::new("abcdefghijkl"),
            Err(FsError::NameTooLong(_))
        ));
        assert!(matches!(Name::new(""), Err(FsError::InvalidArgument(_))));
        assert!(matches!(Name::new("a/b"), Err(FsError::InvalidArgument(_))));
        assert!(matches!(Name::new(".."), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn dir_block_keeps_dots_at_fixed_slots() {
        let entries = new_dir_block(5, 1, COUNT_DIR_ITEMS);
        let raw = encode_dir_block(&entries, BLOCK_SIZE).unwrap();
        assert_eq!(raw.len(), BLOCK_SIZE);
        let back = decode_dir_block(&raw).unwrap();
        assert_eq!(back.len(), COUNT_DIR_ITEMS);
        assert!(back[0].matches(".") && back[0].inode_id == 5);
        assert!(back[1].matches("..") && back[1].inode_id == 1);
        assert!(back[2..].iter().all(DirEntry::is_free));
    }

    #[test]
    fn link_blocks_pad_with_free_links() {
        let raw = encode_links(&[3, 4], BLOCK_SIZE);
        let links = decode_links(&raw);
        assert_eq!(links.len(), COUNT_LINKS);
        assert_eq!(&links[..3], &[3, 4, FREE_LINK]);
    }
}
