use crate::alloc::{blocks_for_units, units_in_blocks};
use crate::config::FormatOptions;
use crate::error::{MFSError, Result};
use crate::node::INODES_PER_BLOCK;
use fileblock::BLOCK_SIZE;

pub const SB_MAGIC: u32 = 0x4d46_5342; // MFSB

/// Number of 32-bit fields in the encoded superblock.
const FIELDS: usize = 13;

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Region boundaries are inclusive block numbers and are fixed at format time:
///
/// ```text
/// | SuperBlock | Bitmap (inodes) | Inodes | Bitmap (data region) | Data Region |
/// ```
///
/// Data block numbers handed out by the data bitmap are relative to
/// `data_first_block`.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperBlock {
    /// A 32-bit identifying string, in this case MFSB.
    pub sb_magic: u32,
    /// Every block of the volume including the super block.
    pub blocks_count: u32,
    /// Usable inodes, the capacity of the inode bitmap.
    pub inodes_count: u32,
    /// Usable data blocks, the capacity of the data bitmap.
    pub data_blocks_count: u32,
    pub inode_bitmap_first_block: u32,
    pub inode_bitmap_last_block: u32,
    pub inode_first_block: u32,
    pub inode_last_block: u32,
    pub data_bitmap_first_block: u32,
    pub data_bitmap_last_block: u32,
    pub data_first_block: u32,
    pub root_inode: u32,
    /// Inodes currently allocated, the root included.
    pub used_inodes: u32,
}

impl SuperBlock {
    /// Computes the region boundaries for a volume. The same options always
    /// produce the same layout.
    pub fn plan(opts: &FormatOptions) -> Result<Self> {
        opts.validate()?;

        let inode_bitmap_blocks = blocks_for_units(opts.inodes());
        let inode_blocks = (opts.inodes() + INODES_PER_BLOCK - 1) / INODES_PER_BLOCK;
        let data_bitmap_blocks = blocks_for_units(opts.data_blocks());
        // Whole bitmap blocks may address more units than requested; the
        // surplus bits stay permanently clear.
        let inodes = opts
            .inodes()
            .min(units_in_blocks(inode_bitmap_blocks))
            .min(inode_blocks * INODES_PER_BLOCK);
        let data_blocks = opts.data_blocks().min(units_in_blocks(data_bitmap_blocks));

        let inode_bitmap_first_block = 1;
        let inode_bitmap_last_block = inode_bitmap_first_block + inode_bitmap_blocks - 1;
        let inode_first_block = inode_bitmap_last_block + 1;
        let inode_last_block = inode_first_block + inode_blocks - 1;
        let data_bitmap_first_block = inode_last_block + 1;
        let data_bitmap_last_block = data_bitmap_first_block + data_bitmap_blocks - 1;
        let data_first_block = data_bitmap_last_block + 1;
        let blocks_count = data_first_block + data_blocks;

        Ok(Self {
            sb_magic: SB_MAGIC,
            blocks_count: blocks_count as u32,
            inodes_count: inodes as u32,
            data_blocks_count: data_blocks as u32,
            inode_bitmap_first_block: inode_bitmap_first_block as u32,
            inode_bitmap_last_block: inode_bitmap_last_block as u32,
            inode_first_block: inode_first_block as u32,
            inode_last_block: inode_last_block as u32,
            data_bitmap_first_block: data_bitmap_first_block as u32,
            data_bitmap_last_block: data_bitmap_last_block as u32,
            data_first_block: data_first_block as u32,
            root_inode: 0,
            used_inodes: 0,
        })
    }

    /// Reads the super block from a buffer holding at least the encoded fields.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FIELDS * 4 {
            return Err(MFSError::Corrupted(format!(
                "super block buffer of {} bytes is truncated",
                buf.len()
            )));
        }
        let mut fields = buf.chunks_exact(4).take(FIELDS).map(|chunk| {
            let mut word = [0; 4];
            word.copy_from_slice(chunk);
            u32::from_be_bytes(word)
        });
        let mut next = || fields.next().unwrap_or_default();

        let sb_magic = next();
        if sb_magic != SB_MAGIC {
            return Err(MFSError::BadMagic(sb_magic));
        }

        let sb = Self {
            sb_magic,
            blocks_count: next(),
            inodes_count: next(),
            data_blocks_count: next(),
            inode_bitmap_first_block: next(),
            inode_bitmap_last_block: next(),
            inode_first_block: next(),
            inode_last_block: next(),
            data_bitmap_first_block: next(),
            data_bitmap_last_block: next(),
            data_first_block: next(),
            root_inode: next(),
            used_inodes: next(),
        };
        sb.check_regions()?;
        Ok(sb)
    }

    /// Serializes the SuperBlock into a BLOCK_SIZE buffer for writing to disk.
    /// The encoding is a series of struct fields with big endian alignment.
    pub fn serialize(&self) -> Vec<u8> {
        let mut sb_encoded = Vec::with_capacity(BLOCK_SIZE);
        for field in &[
            self.sb_magic,
            self.blocks_count,
            self.inodes_count,
            self.data_blocks_count,
            self.inode_bitmap_first_block,
            self.inode_bitmap_last_block,
            self.inode_first_block,
            self.inode_last_block,
            self.data_bitmap_first_block,
            self.data_bitmap_last_block,
            self.data_first_block,
            self.root_inode,
            self.used_inodes,
        ] {
            sb_encoded.extend_from_slice(&field.to_be_bytes());
        }
        sb_encoded.resize(BLOCK_SIZE, 0);
        sb_encoded
    }

    /// Regions must follow one another in order with no gaps.
    fn check_regions(&self) -> Result<()> {
        let follows = |next: u32, last: u32| next as u64 == last as u64 + 1;
        let ordered = self.inode_bitmap_first_block == 1
            && self.inode_bitmap_first_block <= self.inode_bitmap_last_block
            && follows(self.inode_first_block, self.inode_bitmap_last_block)
            && self.inode_first_block <= self.inode_last_block
            && follows(self.data_bitmap_first_block, self.inode_last_block)
            && self.data_bitmap_first_block <= self.data_bitmap_last_block
            && follows(self.data_first_block, self.data_bitmap_last_block)
            && self.data_first_block as u64 + self.data_blocks_count as u64
                == self.blocks_count as u64;
        if !ordered {
            return Err(MFSError::Corrupted(
                "super block regions are not contiguous".to_string(),
            ));
        }
        if self.root_inode >= self.inodes_count || self.used_inodes > self.inodes_count {
            return Err(MFSError::Corrupted(format!(
                "root inode {} or usage {} outside {} inodes",
                self.root_inode, self.used_inodes, self.inodes_count
            )));
        }
        Ok(())
    }
}
