mod bitmap; // free/used slots of inodes and data blocks
pub mod block_device;
mod common;
mod dir;
pub mod disk; // on-disk records
mod error;
mod fs; // session: format, open, close
mod fsck;
mod link; // link graph of an inode
mod ops;
mod path;
pub mod shell;
pub mod signal;
mod volume;

pub use block_device::{BlockDevice, FileDisk};
pub use common::*;
pub use disk::{InodeKind, SuperBlock};
pub use error::{ErrorKind, FsError, Result};
pub use fs::FileSystem;
pub use fsck::{FsckReport, FsckStatus};
pub use ops::{InodeInfo, Listing, Usage};
