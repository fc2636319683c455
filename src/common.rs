use std::mem::size_of;

/// inode number, 1-based; slot `id - 1` in the inode bitmap and inode table
pub type InodeId = u32;

/// data block number, 1-based; block index `link - 1` in the data region
pub type Link = u32;

/// root i-number
pub const ROOT_ID: InodeId = 1;

/// unused pointer slot
pub const FREE_LINK: Link = 0;

pub const SIGNATURE: [u8; 8] = *b"SIMFS\0\0\0";

pub const DESCRIPTOR: &str = "inode filesystem in a host file";

/// block size
pub const BLOCK_SIZE: usize = 1024;

/// direct links in inode
pub const DIRECT_LINKS: usize = 5;

/// bytes of a directory entry name, terminator included
pub const NAME_LEN: usize = 12;

/// links per index block
pub const COUNT_LINKS: usize = BLOCK_SIZE / size_of::<Link>();

/// directory entries per directory block
pub const COUNT_DIR_ITEMS: usize = BLOCK_SIZE / DIR_ENTRY_SIZE;

/// encoded sizes, see `disk`
pub const SUPERBLOCK_SIZE: usize = 96;
pub const INODE_SIZE: usize = 40;
pub const DIR_ENTRY_SIZE: usize = 16;

/// share of the image handed to the data region
pub const DATA_RATIO: (u64, u64) = (9, 10);

pub const MIB: u64 = 1024 * 1024;

pub const SEPARATOR: char = '/';

pub const LOST_FOUND: &str = "lost+found";

/// capacity of a rendered working directory
pub const PATH_CAPACITY: usize = 256;

/// leading marker of a truncated working directory
pub const PATH_TRUNCATED: &str = "..";
