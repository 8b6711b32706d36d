use crate::alloc::Bitmap;
use crate::error::{MFSError, Result};
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::debug;
use std::convert::TryFrom;
use std::mem::size_of;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Block pointers held directly in the inode.
pub const DIRECT_COUNT: usize = 10;
/// Pointers held by the single indirect block.
pub const POINTERS_PER_BLOCK: usize = BLOCK_SIZE / size_of::<u32>();
/// Largest number of data blocks one file can own.
pub const MAX_FILE_BLOCKS: usize = DIRECT_COUNT + POINTERS_PER_BLOCK;
/// Sentinel for a pointer slot that references no block. Never a valid unit id.
pub const EMPTY: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File = 0,
    Directory = 1,
}

impl TryFrom<u32> for InodeKind {
    type Error = MFSError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(InodeKind::File),
            1 => Ok(InodeKind::Directory),
            other => Err(MFSError::Corrupted(format!("unknown inode kind {}", other))),
        }
    }
}

#[repr(C)]
#[derive(AsBytes, FromZeroes, FromBytes, Debug, Copy, Clone, PartialEq)]
/// This structure __must be exactly 128 bytes.__
pub struct Inode {
    /// Slot of this record in the inode table.
    pub id: u32,
    /// Raw [`InodeKind`].
    pub kind: u32,
    /// The total size of the file in bytes.
    pub size: u32,
    /// Data blocks owned by the file, not counting the indirect block.
    pub blocks_count: u32,
    /// Data-region unit ids for the first `DIRECT_COUNT` logical blocks.
    pub direct: [u32; DIRECT_COUNT],
    /// Unit id of the block holding pointers for the following logical blocks.
    pub indirect: u32,
    /// Direct slots in use.
    pub direct_pointers: u32,
    /// Entries of the indirect block in use.
    pub indirect_pointers: u32,
    padding: [u32; 15],
}

const _: () = assert!(size_of::<Inode>() == INODE_SIZE);

impl Inode {
    /// A fresh record with every pointer slot empty.
    pub fn new(id: u32, kind: InodeKind) -> Self {
        Self {
            id,
            kind: kind as u32,
            size: 0,
            blocks_count: 0,
            direct: [EMPTY; DIRECT_COUNT],
            indirect: EMPTY,
            direct_pointers: 0,
            indirect_pointers: 0,
            padding: [0; 15],
        }
    }

    pub fn kind(&self) -> Result<InodeKind> {
        InodeKind::try_from(self.kind)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory as u32
    }
}

/// The fixed-size record table. Record `id` lives `id * INODE_SIZE` bytes into
/// the region; records never straddle blocks.
#[derive(Debug)]
pub struct InodeTable {
    first_block: usize,
    last_block: usize,
    capacity: usize,
}

impl InodeTable {
    pub fn new(first_block: usize, last_block: usize, capacity: usize) -> Self {
        Self {
            first_block,
            last_block,
            capacity,
        }
    }

    /// Allocates an id from `ids` and returns a zeroed record for it. The
    /// record is not written until [`InodeTable::save`].
    pub fn make(&self, ids: &mut Bitmap, kind: InodeKind) -> Result<Inode> {
        let id = ids.allocate()?;
        debug!("made {:?} inode {}", kind, id);
        Ok(Inode::new(id as u32, kind))
    }

    pub fn find<T: BlockStorage>(&self, dev: &mut T, id: u32) -> Result<Inode> {
        let (block, offset) = self.position(id)?;
        let mut record = Inode::new_zeroed();
        dev.read_block_range(block, record.as_bytes_mut(), offset)?;
        if record.id != id {
            return Err(MFSError::Corrupted(format!(
                "slot {} holds a record for inode {}",
                id, record.id
            )));
        }
        record.kind()?;
        Ok(record)
    }

    pub fn save<T: BlockStorage>(&self, dev: &mut T, inode: &Inode) -> Result<()> {
        let (block, offset) = self.position(inode.id)?;
        dev.write_block_range(block, inode.as_bytes(), offset)?;
        Ok(())
    }

    /// Overwrites a slot with zeroes once its inode is released.
    pub fn erase<T: BlockStorage>(&self, dev: &mut T, id: u32) -> Result<()> {
        let (block, offset) = self.position(id)?;
        dev.write_block_range(block, Inode::new_zeroed().as_bytes(), offset)?;
        Ok(())
    }

    fn position(&self, id: u32) -> Result<(usize, usize)> {
        let id = id as usize;
        let block = self.first_block + id / INODES_PER_BLOCK;
        if id >= self.capacity || block > self.last_block {
            return Err(MFSError::NotFound(format!("inode {}", id)));
        }
        Ok((block, (id % INODES_PER_BLOCK) * INODE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Resource;
    use crate::testing::device;

    #[test]
    fn new_inode_has_only_empty_pointers() {
        let node = Inode::new(3, InodeKind::File);
        assert!(node.direct.iter().all(|&p| p == EMPTY));
        assert_eq!(node.indirect, EMPTY);
        assert_eq!(node.kind().unwrap(), InodeKind::File);
        assert!(!node.is_dir());
    }

    #[test]
    fn saved_records_are_found_again() {
        let mut dev = device(4);
        let mut ids = Bitmap::new(Resource::Inode, 1, 1, 64);
        let table = InodeTable::new(2, 3, 64);

        let mut dir = table.make(&mut ids, InodeKind::Directory).unwrap();
        let mut file = table.make(&mut ids, InodeKind::File).unwrap();
        dir.size = 42;
        file.direct[0] = 7;
        file.blocks_count = 1;
        table.save(&mut dev, &dir).unwrap();
        table.save(&mut dev, &file).unwrap();

        assert_eq!(table.find(&mut dev, 0).unwrap(), dir);
        assert_eq!(table.find(&mut dev, 1).unwrap(), file);
        assert!(table.find(&mut dev, 0).unwrap().is_dir());
    }

    #[test]
    fn records_in_second_table_block_do_not_clobber_first() {
        let mut dev = device(4);
        let table = InodeTable::new(2, 3, 64);
        let low = Inode::new(31, InodeKind::File);
        let high = Inode::new(32, InodeKind::Directory);
        table.save(&mut dev, &low).unwrap();
        table.save(&mut dev, &high).unwrap();

        assert_eq!(table.find(&mut dev, 31).unwrap(), low);
        assert_eq!(table.find(&mut dev, 32).unwrap(), high);
    }

    #[test]
    fn ids_outside_table_are_not_found() {
        let mut dev = device(4);
        let table = InodeTable::new(2, 3, 64);
        assert!(matches!(
            table.find(&mut dev, 64),
            Err(MFSError::NotFound(_))
        ));
    }

    #[test]
    fn erased_slot_no_longer_matches_its_id() {
        let mut dev = device(4);
        let table = InodeTable::new(2, 3, 64);
        table.save(&mut dev, &Inode::new(5, InodeKind::File)).unwrap();
        table.erase(&mut dev, 5).unwrap();
        assert!(matches!(
            table.find(&mut dev, 5),
            Err(MFSError::Corrupted(_))
        ));
    }

    #[test]
    fn make_fails_when_ids_run_out() {
        let mut ids = Bitmap::new(Resource::Inode, 1, 1, 1);
        let table = InodeTable::new(2, 2, 1);
        table.make(&mut ids, InodeKind::Directory).unwrap();
        assert!(matches!(
            table.make(&mut ids, InodeKind::File),
            Err(MFSError::AllocationExhausted(Resource::Inode))
        ));
    }
}
