use crate::blockio::{check_range, BlockNumber, BlockStorage, BLOCK_SIZE};
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

#[derive(Debug)]
pub struct FileBlockEmulator {
    /// The file must be a fixed-size file some exact multiple of the size of a block.
    fd: File,
    /// The total number of blocks available in the file store.
    block_count: usize,
}

/// Emulates block disk/flash storage in userspace using a file as block storage.
/// This is only meant to be used for file system development and testing.
impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_block(&self, blocknr: BlockNumber) -> std::io::Result<()> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "block {} requested exceeds device upper bound {}",
                    blocknr, self.block_count
                ),
            ));
        }
        Ok(())
    }

    fn seek_to(&mut self, blocknr: BlockNumber, offset: usize) -> std::io::Result<()> {
        self.fd
            .seek(SeekFrom::Start((blocknr * BLOCK_SIZE + offset) as u64))?;
        Ok(())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, nblocks: usize) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        let emu = FileBlockEmulator {
            fd: file,
            block_count: nblocks,
        };

        Ok(emu)
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_block(blocknr)?;
        if buf.len() < BLOCK_SIZE {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.seek_to(blocknr, 0)?;
        // Limit the read to just the block specified.
        self.fd.read_exact(&mut buf[0..BLOCK_SIZE])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        self.check_block(blocknr)?;
        self.seek_to(blocknr, 0)?;

        let max = if BLOCK_SIZE < buf.len() {
            BLOCK_SIZE
        } else {
            buf.len()
        };
        self.fd.write_all(&buf[0..max])
    }

    fn read_block_range(
        &mut self,
        blocknr: BlockNumber,
        buf: &mut [u8],
        offset: usize,
    ) -> std::io::Result<()> {
        self.check_block(blocknr)?;
        check_range(offset, buf.len())?;
        self.seek_to(blocknr, offset)?;
        self.fd.read_exact(buf)
    }

    fn write_block_range(
        &mut self,
        blocknr: BlockNumber,
        buf: &[u8],
        offset: usize,
    ) -> std::io::Result<()> {
        self.check_block(blocknr)?;
        check_range(offset, buf.len())?;
        self.seek_to(blocknr, offset)?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    block_count: usize,
    clear_medium: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded down
            // to the nearest block.
            block_count: 0,
            clear_medium: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the number of desired blocks in the block store device.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Controls whether the medium is zeroed on build. Disable it to reattach
    /// to an image that already holds a file system.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    /// This builder assumed ownership of the file descriptor used and does
    /// destructive things to prepare the file for use. Additionally, ownership
    /// of the file is transfered to the emulator meaning this builder can only
    /// be used to create one emulator.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "device must hold at least one block",
            ));
        }
        if self.clear_medium {
            self.zero_blocks()?;
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            block_count: self.block_count,
        })
    }

    fn zero_blocks(&mut self) -> std::io::Result<()> {
        debug!("zeroing {} emulated blocks", self.block_count);
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        let zeroes = vec![0x00; BLOCK_SIZE];
        // Zero out the "disk" block, buffering each write to prevent excessive reads.
        for _ in 0..self.block_count {
            bfd.write_all(zeroes.as_slice())?;
        }
        bfd.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator(blocks: usize) -> FileBlockEmulator {
        let fs_block = tempfile::tempfile().unwrap();
        FileBlockEmulatorBuilder::from(fs_block)
            .with_block_count(blocks)
            .build()
            .expect("failed to allocate file block")
    }

    #[test]
    fn file_emulator_allocates_correct_num_bytes() {
        let mut disk_emu = emulator(4);
        disk_emu.sync_disk().unwrap();
        assert_eq!(disk_emu.block_count(), 4);
        assert_eq!(disk_emu.into_file().metadata().unwrap().len(), 4 * 4096);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let mut disk_emu = emulator(4);

        // Allocate a block with a non-zero character.
        let block = vec![0x55; 4096];
        disk_emu.write_block(2, block.as_slice()).unwrap();
        disk_emu.sync_disk().unwrap();

        let mut read_block = vec![0x00; 4096];
        // Read a different block.
        disk_emu.read_block(3, read_block.as_mut_slice()).unwrap();
        assert_eq!(read_block, vec![0x00; 4096]);

        // Read the block with data.
        let mut filled_block = vec![0x00; 4096];
        disk_emu.read_block(2, filled_block.as_mut_slice()).unwrap();
        assert_eq!(filled_block, vec![0x55; 4096]);
    }

    #[test]
    fn can_read_and_write_start_and_end_blocks() {
        let mut disk_emu = emulator(2);

        disk_emu.write_block(0, &[0x55; 4096]).unwrap();
        let mut read_block = vec![0x00; 4096];
        disk_emu.read_block(0, read_block.as_mut_slice()).unwrap();
        assert_eq!(read_block, vec![0x55; 4096]);

        disk_emu.write_block(1, &[0x66; 4096]).unwrap();
        disk_emu.read_block(1, read_block.as_mut_slice()).unwrap();
        assert_eq!(read_block, vec![0x66; 4096]);
    }

    #[test]
    fn access_beyond_range_returns_error() {
        let mut disk_emu = emulator(1);

        let wresult = disk_emu.write_block(1, &[0x55; 4096]);
        assert_eq!(wresult.unwrap_err().kind(), ErrorKind::InvalidInput);

        let mut buf = vec![0; 4096];
        let rresult = disk_emu.read_block(1, &mut buf);
        assert_eq!(rresult.unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn writing_to_block_with_block_size_lt_max_succeeds() {
        let mut disk_emu = emulator(1);

        // Fill half the block with meaningful data.
        disk_emu
            .write_block(0, &[0x55; 2048])
            .expect("failed to write block");

        let mut buf = vec![0; 4096];
        disk_emu.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..2048], &[0x55; 2048][..]);
        assert_eq!(&buf[2048..], &[0x00; 2048][..]);
    }

    #[test]
    fn range_writes_leave_rest_of_block_intact() {
        let mut disk_emu = emulator(2);
        disk_emu.write_block(1, &[0x11; 4096]).unwrap();

        disk_emu.write_block_range(1, b"hello", 4000).unwrap();

        let mut word = [0; 5];
        disk_emu.read_block_range(1, &mut word, 4000).unwrap();
        assert_eq!(&word, b"hello");

        let mut buf = vec![0; 4096];
        disk_emu.read_block(1, &mut buf).unwrap();
        assert_eq!(buf[3999], 0x11);
        assert_eq!(buf[4005], 0x11);
    }

    #[test]
    fn range_crossing_block_boundary_is_rejected() {
        let mut disk_emu = emulator(2);
        let err = disk_emu.write_block_range(0, &[1; 16], 4090).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn reattached_medium_keeps_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut first = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .build()
            .unwrap();
        first.write_block(1, &[0x42; 4096]).unwrap();
        first.sync_disk().unwrap();

        let mut second = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .clear_medium(false)
            .build()
            .unwrap();
        let mut buf = vec![0; 4096];
        second.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x42; 4096]);

        let mut third = FileBlockEmulator::open_disk(disk.path(), 2).unwrap();
        third.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, vec![0x42; 4096]);
    }

    #[test]
    fn zero_sized_device_is_rejected() {
        let fs_block = tempfile::tempfile().unwrap();
        let result = FileBlockEmulatorBuilder::from(fs_block).build();
        assert!(result.is_err());
    }
}
