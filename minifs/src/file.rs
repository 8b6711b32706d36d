//! Open-file handles and the byte-range I/O engine.
//!
//! A handle owns an in-memory copy of one inode. All reads and writes go
//! through [`Volume`], which maps logical block indices onto data-region units
//! and grows files by allocating units as writes reach past their end.
use crate::error::{MFSError, Result};
use crate::fs::Volume;
use crate::node::{Inode, InodeKind, DIRECT_COUNT, EMPTY, MAX_FILE_BLOCKS, POINTERS_PER_BLOCK};
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{debug, warn};
use std::cmp;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Resolved block ids remembered per handle.
pub const CACHED_COUNT: usize = 8;

/// A block whose content is an array of unit ids.
#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes)]
struct IndirectBlock {
    pointers: [u32; POINTERS_PER_BLOCK],
}

impl IndirectBlock {
    fn empty() -> Self {
        Self {
            pointers: [EMPTY; POINTERS_PER_BLOCK],
        }
    }
}

/// Round-robin memo of (logical block, unit) pairs. Only lives as long as
/// its handle, which is the only writer of the inode it caches.
#[derive(Debug)]
struct BlockCache {
    slots: [(u32, u32); CACHED_COUNT],
    next: usize,
}

impl BlockCache {
    fn new() -> Self {
        Self {
            slots: [(EMPTY, EMPTY); CACHED_COUNT],
            next: 0,
        }
    }

    fn get(&self, logical: usize) -> Option<u32> {
        self.slots
            .iter()
            .find(|(l, _)| *l as usize == logical)
            .map(|(_, unit)| *unit)
    }

    fn insert(&mut self, logical: usize, unit: u32) {
        self.slots[self.next] = (logical as u32, unit);
        self.next = (self.next + 1) % CACHED_COUNT;
    }
}

/// In-memory session over one inode.
#[derive(Debug)]
pub struct Handle {
    pub(crate) inode: Inode,
    cache: BlockCache,
    /// False while the in-memory inode differs from its record.
    pub(crate) flushed: bool,
}

impl Handle {
    pub(crate) fn new(inode: Inode, flushed: bool) -> Self {
        Self {
            inode,
            cache: BlockCache::new(),
            flushed,
        }
    }

    pub fn id(&self) -> u32 {
        self.inode.id
    }

    pub fn size(&self) -> usize {
        self.inode.size as usize
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }
}

impl<T: BlockStorage> Volume<T> {
    /// Opens a handle over an allocated inode.
    pub(crate) fn open_handle(&mut self, id: u32) -> Result<Handle> {
        if !self.inode_bmp.test(id as usize) {
            return Err(MFSError::NotFound(format!("inode {}", id)));
        }
        let inode = self.inodes.find(&mut self.dev, id)?;
        Ok(Handle::new(inode, true))
    }

    /// Allocates and records a new, empty inode.
    pub(crate) fn create_handle(&mut self, kind: InodeKind) -> Result<Handle> {
        let inode = self.inodes.make(&mut self.inode_bmp, kind)?;
        if let Err(e) = self.inodes.save(&mut self.dev, &inode) {
            self.inode_bmp.free(inode.id as usize)?;
            return Err(e);
        }
        self.sb.used_inodes += 1;
        Ok(Handle::new(inode, false))
    }

    /// Writes the handle's inode back to the table.
    pub(crate) fn flush_handle(&mut self, handle: &mut Handle) -> Result<()> {
        self.inodes.save(&mut self.dev, &handle.inode)?;
        handle.flushed = true;
        Ok(())
    }

    pub(crate) fn close(&mut self, mut handle: Handle) -> Result<()> {
        self.flush_handle(&mut handle)
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, clamped to the file
    /// size. Returns the number of bytes read.
    pub(crate) fn read_at(&mut self, handle: &mut Handle, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let size = handle.size();
        if offset >= size {
            return Ok(0);
        }
        let end = cmp::min(offset.saturating_add(buf.len()), size);

        let mut pos = offset;
        while pos < end {
            let from = pos % BLOCK_SIZE;
            let count = cmp::min(BLOCK_SIZE - from, end - pos);
            let dst = &mut buf[pos - offset..pos - offset + count];
            match self.block_id(handle, pos / BLOCK_SIZE)? {
                Some(unit) => {
                    let block = self.physical(unit);
                    self.dev.read_block_range(block, dst, from)?;
                }
                None => {
                    warn!(
                        "inode {} has no block for offset {} inside its size",
                        handle.id(),
                        pos
                    );
                    dst.iter_mut().for_each(|b| *b = 0);
                }
            }
            pos += count;
        }
        Ok(pos - offset)
    }

    /// Writes `buf` at `offset`, allocating blocks as needed and growing the
    /// file when the write ends past its size. The inode is flushed before
    /// returning whenever it changed.
    ///
    /// Writes are not atomic: when allocation fails partway, the blocks
    /// written before the failure stay written, the size covers them, and the
    /// error is returned.
    pub(crate) fn write_at(&mut self, handle: &mut Handle, offset: usize, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(buf.len())
            .ok_or(MFSError::FileTooLarge(offset / BLOCK_SIZE))?;
        if end > MAX_FILE_BLOCKS * BLOCK_SIZE {
            return Err(MFSError::FileTooLarge((end - 1) / BLOCK_SIZE));
        }
        let mut pos = offset;
        let mut failure = None;

        while pos < end {
            let from = pos % BLOCK_SIZE;
            let count = cmp::min(BLOCK_SIZE - from, end - pos);
            let unit = match self.block_id_or_allocate(handle, pos / BLOCK_SIZE) {
                Ok(unit) => unit,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let block = self.physical(unit);
            if let Err(e) = self
                .dev
                .write_block_range(block, &buf[pos - offset..pos - offset + count], from)
            {
                failure = Some(e.into());
                break;
            }
            pos += count;
            if pos > handle.size() {
                handle.inode.size = pos as u32;
                handle.flushed = false;
            }
        }

        if !handle.flushed {
            self.flush_handle(handle)?;
        }
        match failure {
            Some(e) => {
                warn!(
                    "write to inode {} stopped after {} of {} bytes: {}",
                    handle.id(),
                    pos - offset,
                    buf.len(),
                    e
                );
                Err(e)
            }
            None => Ok(pos - offset),
        }
    }

    /// Makes sure every block under `offset..offset + len` is allocated, so a
    /// following write of that range needs no allocation.
    pub(crate) fn reserve(&mut self, handle: &mut Handle, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(len)
            .ok_or(MFSError::FileTooLarge(offset / BLOCK_SIZE))?;
        for logical in offset / BLOCK_SIZE..=(end - 1) / BLOCK_SIZE {
            self.block_id_or_allocate(handle, logical)?;
        }
        Ok(())
    }

    /// Maps a logical block of the file to its unit, if one is allocated.
    fn block_id(&mut self, handle: &mut Handle, logical: usize) -> Result<Option<u32>> {
        if let Some(unit) = handle.cache.get(logical) {
            return Ok(Some(unit));
        }
        let unit = if logical < DIRECT_COUNT {
            handle.inode.direct[logical]
        } else if logical < MAX_FILE_BLOCKS && handle.inode.indirect != EMPTY {
            self.read_indirect(handle.inode.indirect)?.pointers[logical - DIRECT_COUNT]
        } else {
            EMPTY
        };
        if unit == EMPTY {
            return Ok(None);
        }
        handle.cache.insert(logical, unit);
        Ok(Some(unit))
    }

    /// Like [`Volume::block_id`] but allocates the block, and the indirect
    /// block on its first use, when the slot is empty.
    fn block_id_or_allocate(&mut self, handle: &mut Handle, logical: usize) -> Result<u32> {
        if let Some(unit) = self.block_id(handle, logical)? {
            return Ok(unit);
        }
        if logical >= MAX_FILE_BLOCKS {
            return Err(MFSError::FileTooLarge(logical));
        }

        let unit = if logical < DIRECT_COUNT {
            let unit = self.allocate_block()?;
            handle.inode.direct[logical] = unit;
            handle.inode.direct_pointers += 1;
            unit
        } else {
            if handle.inode.indirect == EMPTY {
                let indirect = self.allocate_block()?;
                self.write_indirect(indirect, &IndirectBlock::empty())?;
                handle.inode.indirect = indirect;
                handle.flushed = false;
                self.flush_handle(handle)?;
            }
            let mut table = self.read_indirect(handle.inode.indirect)?;
            let unit = self.allocate_block()?;
            table.pointers[logical - DIRECT_COUNT] = unit;
            self.write_indirect(handle.inode.indirect, &table)?;
            handle.inode.indirect_pointers += 1;
            unit
        };
        handle.inode.blocks_count += 1;
        handle.flushed = false;
        self.flush_handle(handle)?;
        handle.cache.insert(logical, unit);
        debug!(
            "inode {} logical block {} -> unit {}",
            handle.id(),
            logical,
            unit
        );
        Ok(unit)
    }

    /// Releases every data unit the inode owns, the indirect block included.
    pub(crate) fn release_blocks(&mut self, inode: &mut Inode) -> Result<()> {
        for slot in inode.direct.iter_mut() {
            if *slot != EMPTY {
                self.data_bmp.free(*slot as usize)?;
                *slot = EMPTY;
            }
        }
        if inode.indirect != EMPTY {
            let table = self.read_indirect(inode.indirect)?;
            for unit in table.pointers.iter().filter(|unit| **unit != EMPTY) {
                self.data_bmp.free(*unit as usize)?;
            }
            self.data_bmp.free(inode.indirect as usize)?;
            inode.indirect = EMPTY;
        }
        inode.size = 0;
        inode.blocks_count = 0;
        inode.direct_pointers = 0;
        inode.indirect_pointers = 0;
        Ok(())
    }

    /// Claims a data unit and zeroes its block.
    fn allocate_block(&mut self) -> Result<u32> {
        let unit = self.data_bmp.allocate()? as u32;
        let block = self.physical(unit);
        if let Err(e) = self.dev.write_block(block, &[0; BLOCK_SIZE]) {
            self.data_bmp.free(unit as usize)?;
            return Err(e.into());
        }
        Ok(unit)
    }

    fn read_indirect(&mut self, unit: u32) -> Result<IndirectBlock> {
        let mut table = IndirectBlock::new_zeroed();
        let block = self.physical(unit);
        self.dev.read_block(block, table.as_bytes_mut())?;
        Ok(table)
    }

    fn write_indirect(&mut self, unit: u32, table: &IndirectBlock) -> Result<()> {
        let block = self.physical(unit);
        self.dev.write_block(block, table.as_bytes())?;
        Ok(())
    }

    /// Absolute device block of a data-region unit.
    fn physical(&self, unit: u32) -> usize {
        self.sb.data_first_block as usize + unit as usize
    }
}
