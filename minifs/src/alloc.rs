use crate::error::{MFSError, Resource, Result};
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{debug, warn};
use zerocopy::AsBytes;

/// Each bitmap block tracks 4096 * 8 units, 32,768 per block.
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

const WORD_BITS: usize = 64;
const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 8;

/// Number of bitmap blocks needed to hold one bit per unit. Rounds up.
pub fn blocks_for_units(units: usize) -> usize {
    (units + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK
}

/// Number of units addressable by `blocks` whole bitmap blocks.
pub fn units_in_blocks(blocks: usize) -> usize {
    blocks * BITS_PER_BLOCK
}

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// A bit-per-unit allocation map persisted in a contiguous run of blocks.
///
/// The bits live in memory once loaded; mutations only reach the device on
/// [`Bitmap::flush`]. Units at or beyond `capacity` are never handed out even
/// when the last block has room for them.
#[derive(Debug)]
pub struct Bitmap {
    resource: Resource,
    first_block: usize,
    last_block: usize,
    capacity: usize,
    words: Vec<u64>,
    dirty: bool,
}

impl Bitmap {
    /// Binds the bitmap to blocks `first_block..=last_block` without reading them.
    /// The in-memory image starts out all free.
    pub fn new(resource: Resource, first_block: usize, last_block: usize, capacity: usize) -> Self {
        let blocks = last_block + 1 - first_block;
        debug_assert!(capacity <= units_in_blocks(blocks));
        Self {
            resource,
            first_block,
            last_block,
            capacity: capacity.min(units_in_blocks(blocks)),
            words: vec![0; blocks * WORDS_PER_BLOCK],
            dirty: false,
        }
    }

    /// Replaces the in-memory image with the persisted one.
    pub fn load<T: BlockStorage>(&mut self, dev: &mut T) -> Result<()> {
        let first = self.first_block;
        let bytes = self.words.as_mut_slice().as_bytes_mut();
        for (i, chunk) in bytes.chunks_mut(BLOCK_SIZE).enumerate() {
            dev.read_block(first + i, chunk)?;
        }
        self.dirty = false;
        let surplus = self.clear_surplus();
        if surplus > 0 {
            warn!(
                "cleared {} {} bits past capacity {}",
                surplus, self.resource, self.capacity
            );
        }
        debug!(
            "loaded {} bitmap from blocks {}..={} ({} of {} used)",
            self.resource,
            self.first_block,
            self.last_block,
            self.used(),
            self.capacity
        );
        Ok(())
    }

    /// Persists the in-memory image back to its block range.
    pub fn flush<T: BlockStorage>(&mut self, dev: &mut T) -> Result<()> {
        for (i, chunk) in self.words.as_slice().as_bytes().chunks(BLOCK_SIZE).enumerate() {
            dev.write_block(self.first_block + i, chunk)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Claims the lowest free unit.
    pub fn allocate(&mut self) -> Result<usize> {
        let found = self
            .words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(idx, word)| idx * WORD_BITS + word.trailing_ones() as usize)
            .filter(|unit| *unit < self.capacity);

        match found {
            Some(unit) => {
                self.words[unit / WORD_BITS] |= 1u64 << (unit % WORD_BITS);
                self.dirty = true;
                debug!("allocated {} unit {}", self.resource, unit);
                Ok(unit)
            }
            None => {
                warn!("{} bitmap exhausted at {} units", self.resource, self.capacity);
                Err(MFSError::AllocationExhausted(self.resource))
            }
        }
    }

    /// Releases a unit. Freeing a unit that is already free is a caller bug
    /// and leaves the bit clear.
    pub fn free(&mut self, unit: usize) -> Result<()> {
        self.check(unit)?;
        debug_assert_eq!(self.state(unit)?, State::Used, "double free of {}", unit);
        self.words[unit / WORD_BITS] &= !(1u64 << (unit % WORD_BITS));
        self.dirty = true;
        debug!("freed {} unit {}", self.resource, unit);
        Ok(())
    }

    pub fn state(&self, unit: usize) -> Result<State> {
        self.check(unit)?;
        match (self.words[unit / WORD_BITS] >> (unit % WORD_BITS)) & 1 {
            0 => Ok(State::Free),
            _ => Ok(State::Used),
        }
    }

    /// True when `unit` is allocated. Units outside the bitmap are never allocated.
    pub fn test(&self, unit: usize) -> bool {
        matches!(self.state(unit), Ok(State::Used))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn free_units(&self) -> usize {
        self.capacity - self.used()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears bits at or past `capacity`, returning how many were set.
    fn clear_surplus(&mut self) -> usize {
        let mut cleared = 0;
        let (word, bit) = (self.capacity / WORD_BITS, self.capacity % WORD_BITS);
        if bit > 0 {
            let mask = !0u64 << bit;
            cleared += (self.words[word] & mask).count_ones() as usize;
            self.words[word] &= !mask;
        }
        let start = if bit > 0 { word + 1 } else { word };
        for w in self.words.iter_mut().skip(start) {
            cleared += w.count_ones() as usize;
            *w = 0;
        }
        cleared
    }

    fn check(&self, unit: usize) -> Result<()> {
        if unit >= self.capacity {
            return Err(MFSError::InvalidUnit {
                unit,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
