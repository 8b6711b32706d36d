use std::io::ErrorKind;
use std::path::Path;

/// 4k is a common block size for file systems. Disks commonly are composed of
/// 512 byte blocks mapping each file system block to 8 hard disk blocks.
pub const BLOCK_SIZE: usize = 4096;

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks available.
pub type BlockNumber = usize;

/// Tried to map as closely as possible to the prescribed interface found here:
/// http://web.mit.edu/6.033/1997/handouts/html/04sfs.html.
///
/// In cases where implementing the interface as described would lead to non-idiomatic
/// rust code, I opted to use a more rust-y interface.
pub trait BlockStorage {
    /// Opens a disk at the specified path. This method does not validate the
    /// storage blocks, it is up for clients to ensure disks are appropriately initialized.
    fn open_disk<P: AsRef<Path>>(path: P, nblocks: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;

    /// The number of blocks addressable on this device.
    fn block_count(&self) -> usize;

    /// Reads disk block number into provided buffer.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;

    /// Writes provided buffer into the specified block number.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()>;

    /// Reads `buf.len()` bytes starting `offset` bytes into the block.
    fn read_block_range(
        &mut self,
        blocknr: BlockNumber,
        buf: &mut [u8],
        offset: usize,
    ) -> std::io::Result<()> {
        check_range(offset, buf.len())?;
        let mut block = vec![0; BLOCK_SIZE];
        self.read_block(blocknr, &mut block)?;
        buf.copy_from_slice(&block[offset..offset + buf.len()]);
        Ok(())
    }

    /// Writes `buf` into the block starting `offset` bytes in, leaving the rest
    /// of the block untouched.
    fn write_block_range(
        &mut self,
        blocknr: BlockNumber,
        buf: &[u8],
        offset: usize,
    ) -> std::io::Result<()> {
        check_range(offset, buf.len())?;
        if offset == 0 && buf.len() == BLOCK_SIZE {
            return self.write_block(blocknr, buf);
        }
        let mut block = vec![0; BLOCK_SIZE];
        self.read_block(blocknr, &mut block)?;
        block[offset..offset + buf.len()].copy_from_slice(buf);
        self.write_block(blocknr, &block)
    }

    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}

pub(crate) fn check_range(offset: usize, len: usize) -> std::io::Result<()> {
    if offset + len > BLOCK_SIZE {
        return Err(std::io::Error::new(
            ErrorKind::InvalidInput,
            "byte range crosses block boundary",
        ));
    }
    Ok(())
}
