//! A minimal file system on top of a raw block device.
//!
//! The volume is split into fixed regions at format time: the super block,
//! an inode bitmap, the inode table, a data bitmap and the data region.
//! Inodes address their content through ten direct block pointers and one
//! indirect block. Directories are ordinary inodes whose bytes are a list of
//! `(inode id, name)` entries.
//!
//! A mounted volume is an [`MFS`] session. Operations borrow it mutably, so
//! the borrow checker enforces a single writer per volume; use
//! [`MFS::into_shared`] to hand a volume to several threads behind one lock.
//! Nothing is journaled: a write that fails partway keeps whatever blocks it
//! already wrote.
//!
//! ```no_run
//! use fileblock::FileBlockEmulatorBuilder;
//! use minifs::{FormatOptions, InodeKind, MFS};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dev = FileBlockEmulatorBuilder::from(tempfile::tempfile()?)
//!     .with_block_count(256)
//!     .build()?;
//! let opts = FormatOptions::new().with_data_blocks(200).with_inodes(32);
//! let mut fs = MFS::create(dev, &opts)?;
//! let id = fs.make_entry("/", "hello.txt", InodeKind::File)?;
//! fs.open_inode(id)?.write_at(0, b"hello")?;
//! assert_eq!(fs.resolve_path("/HELLO.TXT")?, id);
//! fs.unmount()?;
//! # Ok(())
//! # }
//! ```
mod alloc;
mod config;
mod dir;
mod error;
mod file;
mod fs;
mod node;
mod sb;

pub use crate::alloc::{blocks_for_units, units_in_blocks, Bitmap, State, BITS_PER_BLOCK};
pub use crate::config::FormatOptions;
pub use crate::dir::{components, DirEntries, DirEntry, MAX_NAME_LEN, SEPARATOR};
pub use crate::error::{MFSError, Resource, Result};
pub use crate::file::CACHED_COUNT;
pub use crate::fs::{InodeInfo, OpenFile, MFS};
pub use crate::node::{
    Inode, InodeKind, InodeTable, DIRECT_COUNT, EMPTY, INODE_SIZE, MAX_FILE_BLOCKS,
    POINTERS_PER_BLOCK,
};
pub use crate::sb::{SuperBlock, SB_MAGIC};

#[cfg(test)]
pub(crate) mod testing {
    use crate::config::FormatOptions;
    use crate::fs::{Volume, MFS};
    use crate::sb::SuperBlock;
    use fileblock::{FileBlockEmulator, FileBlockEmulatorBuilder};

    pub fn device(blocks: usize) -> FileBlockEmulator {
        FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap())
            .with_block_count(blocks)
            .build()
            .expect("Could not initialize disk emulator.")
    }

    /// A freshly formatted and mounted volume, root directory at inode 0.
    pub fn volume(data_blocks: usize, inodes: usize) -> Volume<FileBlockEmulator> {
        let opts = FormatOptions::new()
            .with_data_blocks(data_blocks)
            .with_inodes(inodes);
        let blocks = SuperBlock::plan(&opts).unwrap().blocks_count as usize;
        MFS::create(device(blocks), &opts).unwrap().vol
    }

    /// Bytes that differ from their neighbours and from block to block.
    pub fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }
}
