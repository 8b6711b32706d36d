use std::fmt;
use thiserror::Error;

/// The allocatable resource classes, one bitmap each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Inode,
    DataBlock,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Inode => write!(f, "inodes"),
            Resource::DataBlock => write!(f, "data blocks"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MFSError {
    #[error("superblock magic {0:#010x} does not identify a minifs volume")]
    BadMagic(u32),
    #[error("no free {0} left")]
    AllocationExhausted(Resource),
    #[error("found nothing at {0}")]
    NotFound(String),
    #[error("an entry named {0} already exists")]
    AlreadyExists(String),
    #[error("inode {0} is not a directory")]
    NotADirectory(u32),
    #[error("unit {unit} is outside a bitmap of {capacity} units")]
    InvalidUnit { unit: usize, capacity: usize },
    #[error("name of {0} bytes exceeds the entry name limit")]
    NameTooLong(usize),
    #[error("logical block {0} is beyond the largest file the inode can address")]
    FileTooLarge(usize),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corrupted volume: {0}")]
    Corrupted(String),
    #[error("block device failure")]
    Device(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MFSError>;
