//! Directory content encoding and lookup.
//!
//! A directory is an ordinary inode whose bytes are a run of entries:
//!
//! ```text
//! | inode id (u32 LE) | name length (u8) | name bytes |
//! ```
//!
//! with no terminator or padding. Entries are only ever appended.
use crate::error::{MFSError, Result};
use crate::file::Handle;
use crate::fs::Volume;
use fileblock::BlockStorage;
use std::convert::TryInto;
use std::mem::size_of;

/// Longest name a one-byte length field can describe.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;
pub const SEPARATOR: char = '/';

const HEADER_LEN: usize = size_of::<u32>() + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: u32,
}

impl DirEntry {
    pub fn encode(name: &str, inode: u32) -> Result<Vec<u8>> {
        check_name(name)?;
        let mut record = Vec::with_capacity(HEADER_LEN + name.len());
        record.extend_from_slice(&inode.to_le_bytes());
        record.push(name.len() as u8);
        record.extend_from_slice(name.as_bytes());
        Ok(record)
    }
}

/// Decodes entries front to back, in the order they were appended.
pub struct DirEntries<'a> {
    buf: &'a [u8],
}

impl<'a> DirEntries<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn decode(&mut self) -> Result<DirEntry> {
        if self.buf.len() < HEADER_LEN {
            return Err(MFSError::Corrupted(format!(
                "directory ends inside an entry header ({} bytes left)",
                self.buf.len()
            )));
        }
        let (header, rest) = self.buf.split_at(HEADER_LEN);
        let inode = u32::from_le_bytes(header[..4].try_into().map_err(|_| {
            MFSError::Corrupted("directory entry id is truncated".to_string())
        })?);
        let len = header[4] as usize;
        if rest.len() < len {
            return Err(MFSError::Corrupted(format!(
                "directory entry name of {} bytes overruns content",
                len
            )));
        }
        let (name, rest) = rest.split_at(len);
        let name = String::from_utf8(name.to_vec())
            .map_err(|_| MFSError::Corrupted("directory entry name is not utf-8".to_string()))?;
        self.buf = rest;
        Ok(DirEntry { name, inode })
    }
}

impl<'a> Iterator for DirEntries<'a> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }
        let entry = self.decode();
        if entry.is_err() {
            // Nothing after a malformed record can be trusted.
            self.buf = &[];
        }
        Some(entry)
    }
}

pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(SEPARATOR) {
        return Err(MFSError::InvalidArgument(format!(
            "{:?} is not a valid entry name",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(MFSError::NameTooLong(name.len()));
    }
    Ok(())
}

/// Splits a path into the components to walk. A single leading separator is
/// dropped and the walk ends at the first empty component, so `"/docs/"`
/// names `docs`.
pub fn components<'a>(path: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    let path = path.strip_prefix(SEPARATOR).unwrap_or(path);
    path.split(SEPARATOR).take_while(|part| !part.is_empty())
}

impl<T: BlockStorage> Volume<T> {
    /// Appends an entry at the end of the directory. Blocks for the whole
    /// record are claimed first, so running out of space leaves the existing
    /// entries untouched.
    pub(crate) fn add_entry(&mut self, dir: &mut Handle, name: &str, inode: u32) -> Result<()> {
        if !dir.is_dir() {
            return Err(MFSError::NotADirectory(dir.id()));
        }
        let record = DirEntry::encode(name, inode)?;
        let offset = dir.size();
        self.reserve(dir, offset, record.len())?;
        self.write_at(dir, offset, &record)?;
        Ok(())
    }

    /// Lists the directory, most recently added entry first.
    pub(crate) fn list_entries(&mut self, dir: &mut Handle) -> Result<Vec<DirEntry>> {
        if !dir.is_dir() {
            return Err(MFSError::NotADirectory(dir.id()));
        }
        let mut content = vec![0; dir.size()];
        let read = self.read_at(dir, 0, &mut content)?;
        content.truncate(read);

        let mut entries = DirEntries::new(&content).collect::<Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }

    /// Case-insensitive lookup. With duplicate names the newest entry wins.
    pub(crate) fn find_entry(&mut self, dir: &mut Handle, name: &str) -> Result<u32> {
        self.list_entries(dir)?
            .into_iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.inode)
            .ok_or_else(|| MFSError::NotFound(name.to_string()))
    }
}
