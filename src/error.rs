use super::*;

use thiserror::Error;

/// What went wrong, without the payload. Kept by the session as its last error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ArgumentMissing,
    NameTooLong,
    NotFound,
    AlreadyExists,
    NotAFile,
    NotADirectory,
    DirectoryNotEmpty,
    OutOfInodes,
    OutOfLinks,
    OutOfSpace,
    InternalInconsistency,
    HostIo,
    NotFormatted,
    InvalidArgument,
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("ARGUMENT MISSING")]
    ArgumentMissing,
    #[error("NAME TOO LONG: `{0}`")]
    NameTooLong(String),
    #[error("FILE NOT FOUND: `{0}`")]
    NotFound(String),
    #[error("EXIST: `{0}`")]
    AlreadyExists(String),
    #[error("NOT A FILE: `{0}`")]
    NotAFile(String),
    #[error("NOT A DIRECTORY: `{0}`")]
    NotADirectory(String),
    #[error("NOT EMPTY: `{0}`")]
    DirectoryNotEmpty(String),
    #[error("NO FREE INODES")]
    OutOfInodes,
    #[error("inode {0} has no free link slots left")]
    OutOfLinks(InodeId),
    #[error("NO SPACE LEFT: {needed} block(s) needed, {free} free")]
    OutOfSpace { needed: usize, free: usize },
    #[error("filesystem inconsistency: {0}")]
    Inconsistent(String),
    #[error("host I/O error: {0}")]
    HostIo(#[from] std::io::Error),
    #[error("malformed on-disk record: {0}")]
    Codec(#[from] bincode::Error),
    #[error("image is not formatted")]
    NotFormatted,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::ArgumentMissing => ErrorKind::ArgumentMissing,
            FsError::NameTooLong(_) => ErrorKind::NameTooLong,
            FsError::NotFound(_) => ErrorKind::NotFound,
            FsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FsError::NotAFile(_) => ErrorKind::NotAFile,
            FsError::NotADirectory(_) => ErrorKind::NotADirectory,
            FsError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            FsError::OutOfInodes => ErrorKind::OutOfInodes,
            FsError::OutOfLinks(_) => ErrorKind::OutOfLinks,
            FsError::OutOfSpace { .. } => ErrorKind::OutOfSpace,
            FsError::Inconsistent(_) | FsError::Codec(_) => ErrorKind::InternalInconsistency,
            FsError::HostIo(_) => ErrorKind::HostIo,
            FsError::NotFormatted => ErrorKind::NotFormatted,
            FsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }

    pub(crate) fn inconsistent(msg: impl Into<String>) -> Self {
        FsError::Inconsistent(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
