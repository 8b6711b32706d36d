use crate::error::{MFSError, Result};
use crate::node::EMPTY;

/// Format-time inputs for a new volume.
///
/// The counts are requests: the bitmap regions are sized in whole blocks, so
/// each region can address at least as many units as requested, and the
/// superblock records the count actually made usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    data_blocks: usize,
    inodes: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            data_blocks: 1024,
            inodes: 128,
        }
    }
}

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of blocks reserved for file and directory content.
    pub fn with_data_blocks(mut self, blocks: usize) -> Self {
        self.data_blocks = blocks;
        self
    }

    /// Sets the number of files and directories the volume can hold.
    pub fn with_inodes(mut self, inodes: usize) -> Self {
        self.inodes = inodes;
        self
    }

    pub fn data_blocks(&self) -> usize {
        self.data_blocks
    }

    pub fn inodes(&self) -> usize {
        self.inodes
    }

    pub fn validate(&self) -> Result<()> {
        if self.inodes == 0 {
            return Err(MFSError::InvalidArgument(
                "a volume needs at least the root inode".to_string(),
            ));
        }
        if self.data_blocks == 0 {
            return Err(MFSError::InvalidArgument(
                "a volume needs at least one data block".to_string(),
            ));
        }
        // Unit ids are stored as u32 and u32::MAX marks an empty slot.
        let limit = EMPTY as usize / 2;
        if self.inodes > limit || self.data_blocks > limit {
            return Err(MFSError::InvalidArgument(format!(
                "unit counts are limited to {}",
                limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let opts = FormatOptions::new().with_data_blocks(12).with_inodes(3);
        assert_eq!(opts.data_blocks(), 12);
        assert_eq!(opts.inodes(), 3);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn zero_counts_are_rejected() {
        assert!(matches!(
            FormatOptions::new().with_inodes(0).validate(),
            Err(MFSError::InvalidArgument(_))
        ));
        assert!(matches!(
            FormatOptions::new().with_data_blocks(0).validate(),
            Err(MFSError::InvalidArgument(_))
        ));
    }

    #[test]
    fn counts_beyond_block_id_space_are_rejected() {
        let opts = FormatOptions::new().with_data_blocks(u32::MAX as usize);
        assert!(opts.validate().is_err());
    }
}
