//! Block storage for the `minifs` filesystem.
//!
//! A block device is addressed by absolute block number and transfers data in
//! fixed [`BLOCK_SIZE`] units. [`FileBlockEmulator`] backs a device with an
//! ordinary file so the filesystem can be developed and tested in userspace.
mod blockio;
mod emulator;

pub use blockio::{BlockNumber, BlockStorage, BLOCK_SIZE};
pub use emulator::{FileBlockEmulator, FileBlockEmulatorBuilder};
