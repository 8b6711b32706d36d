use crate::alloc::Bitmap;
use crate::config::FormatOptions;
use crate::dir::{check_name, components, DirEntry, MAX_NAME_LEN};
use crate::error::{MFSError, Resource, Result};
use crate::file::Handle;
use crate::node::{Inode, InodeKind, InodeTable};
use crate::sb::SuperBlock;
use fileblock::{BlockStorage, BLOCK_SIZE};
use log::{debug, error, info};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Everything a mounted volume shares across its handles: the device, the
/// super block, both bitmaps and the inode table.
#[derive(Debug)]
pub(crate) struct Volume<T: BlockStorage> {
    pub(crate) dev: T,
    pub(crate) sb: SuperBlock,
    pub(crate) inode_bmp: Bitmap,
    pub(crate) data_bmp: Bitmap,
    pub(crate) inodes: InodeTable,
}

fn inode_bitmap(sb: &SuperBlock) -> Bitmap {
    Bitmap::new(
        Resource::Inode,
        sb.inode_bitmap_first_block as usize,
        sb.inode_bitmap_last_block as usize,
        sb.inodes_count as usize,
    )
}

fn data_bitmap(sb: &SuperBlock) -> Bitmap {
    Bitmap::new(
        Resource::DataBlock,
        sb.data_bitmap_first_block as usize,
        sb.data_bitmap_last_block as usize,
        sb.data_blocks_count as usize,
    )
}

fn inode_table(sb: &SuperBlock) -> InodeTable {
    InodeTable::new(
        sb.inode_first_block as usize,
        sb.inode_last_block as usize,
        sb.inodes_count as usize,
    )
}

impl<T: BlockStorage> Volume<T> {
    /// Releases an inode's blocks, its record and its id.
    pub(crate) fn remove_inode(&mut self, mut inode: Inode) -> Result<()> {
        self.release_blocks(&mut inode)?;
        self.inodes.erase(&mut self.dev, inode.id)?;
        self.inode_bmp.free(inode.id as usize)?;
        self.sb.used_inodes = self.sb.used_inodes.saturating_sub(1);
        debug!("removed inode {}", inode.id);
        Ok(())
    }
}

/// Metadata of one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    pub id: u32,
    pub kind: InodeKind,
    pub size: usize,
    pub blocks: usize,
}

impl InodeInfo {
    fn of(inode: &Inode) -> Result<Self> {
        Ok(Self {
            id: inode.id,
            kind: inode.kind()?,
            size: inode.size as usize,
            blocks: inode.blocks_count as usize,
        })
    }
}

/// A mounted volume.
///
/// # Layout
/// ===============================================================================
/// | SuperBlock | Bitmap (inodes) | Inodes | Bitmap (data region) | Data Region |
/// ===============================================================================
///
/// Every operation takes `&mut self`, so one mounted volume has exactly one
/// writer at a time. To share a volume between threads wrap it with
/// [`MFS::into_shared`], which puts the whole volume behind a single lock.
///
/// Bitmaps and the super block are kept in memory; call [`MFS::flush`] or
/// [`MFS::unmount`] to make them durable.
#[derive(Debug)]
pub struct MFS<T: BlockStorage> {
    pub(crate) vol: Volume<T>,
    pub(crate) root: Handle,
}

impl<T: BlockStorage> MFS<T> {
    /// Formats `dev` and mounts the new volume.
    pub fn create(mut dev: T, opts: &FormatOptions) -> Result<Self> {
        MFS::format(&mut dev, opts)?;
        MFS::open(dev)
    }

    /// Writes an empty file system holding only the root directory.
    pub fn format(dev: &mut T, opts: &FormatOptions) -> Result<SuperBlock> {
        let mut sb = SuperBlock::plan(opts)?;
        if dev.block_count() < sb.blocks_count as usize {
            return Err(MFSError::InvalidArgument(format!(
                "volume needs {} blocks, device has {}",
                sb.blocks_count,
                dev.block_count()
            )));
        }

        // Reusable buffer for writing blocks.
        let block_buffer = vec![0; BLOCK_SIZE];
        for block in 0..sb.blocks_count as usize {
            dev.write_block(block, &block_buffer)?;
        }

        let mut inode_bmp = inode_bitmap(&sb);
        let inodes = inode_table(&sb);
        let root = inodes.make(&mut inode_bmp, InodeKind::Directory)?;
        inodes.save(dev, &root)?;
        inode_bmp.flush(dev)?;

        sb.root_inode = root.id;
        sb.used_inodes = 1;
        dev.write_block(0, &sb.serialize())?;
        dev.sync_disk()?;

        info!(
            "formatted {} blocks: {} inodes, {} data blocks starting at block {}",
            sb.blocks_count, sb.inodes_count, sb.data_blocks_count, sb.data_first_block
        );
        Ok(sb)
    }

    /// Mounts a formatted device.
    pub fn open(mut dev: T) -> Result<Self> {
        let mut block_buf = vec![0; BLOCK_SIZE];

        // Read superblock from first block;
        dev.read_block(0, &mut block_buf)?;
        let sb = SuperBlock::parse(&block_buf)?;
        if dev.block_count() < sb.blocks_count as usize {
            return Err(MFSError::Corrupted(format!(
                "super block spans {} blocks, device has {}",
                sb.blocks_count,
                dev.block_count()
            )));
        }

        let mut vol = Volume {
            inode_bmp: inode_bitmap(&sb),
            data_bmp: data_bitmap(&sb),
            inodes: inode_table(&sb),
            dev,
            sb,
        };
        vol.inode_bmp.load(&mut vol.dev)?;
        vol.data_bmp.load(&mut vol.dev)?;

        let root_id = vol.sb.root_inode;
        let root = vol.open_handle(root_id)?;
        if !root.is_dir() {
            return Err(MFSError::Corrupted(format!(
                "root inode {} is not a directory",
                root_id
            )));
        }

        info!(
            "mounted volume: {} of {} inodes used, {} of {} data blocks used",
            vol.sb.used_inodes,
            vol.sb.inodes_count,
            vol.data_bmp.used(),
            vol.sb.data_blocks_count
        );
        Ok(MFS { vol, root })
    }

    /// Persists the super block, both bitmaps and the root inode.
    pub fn flush(&mut self) -> Result<()> {
        self.vol.dev.write_block(0, &self.vol.sb.serialize())?;
        if self.vol.inode_bmp.is_dirty() {
            self.vol.inode_bmp.flush(&mut self.vol.dev)?;
        }
        if self.vol.data_bmp.is_dirty() {
            self.vol.data_bmp.flush(&mut self.vol.dev)?;
        }
        self.vol.flush_handle(&mut self.root)?;
        self.vol.dev.sync_disk()?;
        Ok(())
    }

    /// Flushes the volume and hands back its device.
    pub fn unmount(mut self) -> Result<T> {
        self.flush()?;
        info!("unmounted volume");
        Ok(self.vol.dev)
    }

    /// Puts the volume behind one lock so several threads can take turns.
    pub fn into_shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.vol.sb
    }

    pub fn root_id(&self) -> u32 {
        self.vol.sb.root_inode
    }

    pub fn free_inodes(&self) -> usize {
        self.vol.inode_bmp.free_units()
    }

    pub fn free_data_blocks(&self) -> usize {
        self.vol.data_bmp.free_units()
    }

    /// The root directory. It stays open for the life of the mount.
    pub fn root(&mut self) -> OpenFile<'_, T> {
        OpenFile {
            vol: &mut self.vol,
            handle: Slot::Root(&mut self.root),
            closed: false,
        }
    }

    /// Opens an allocated inode.
    pub fn open_inode(&mut self, id: u32) -> Result<OpenFile<'_, T>> {
        if id == self.vol.sb.root_inode {
            return Ok(self.root());
        }
        let handle = self.vol.open_handle(id)?;
        Ok(OpenFile {
            vol: &mut self.vol,
            handle: Slot::Owned(handle),
            closed: false,
        })
    }

    /// Allocates a new empty inode. It is not linked into any directory.
    pub fn create_file(&mut self, kind: InodeKind) -> Result<OpenFile<'_, T>> {
        let handle = self.vol.create_handle(kind)?;
        Ok(OpenFile {
            vol: &mut self.vol,
            handle: Slot::Owned(handle),
            closed: false,
        })
    }

    pub fn stat(&mut self, id: u32) -> Result<InodeInfo> {
        if id == self.vol.sb.root_inode {
            return InodeInfo::of(&self.root.inode);
        }
        let handle = self.vol.open_handle(id)?;
        InodeInfo::of(&handle.inode)
    }

    /// Resolves a slash separated path from the root to an inode id. Lookups
    /// ignore case. An empty path or `"/"` is the root itself.
    pub fn resolve_path(&mut self, path: &str) -> Result<u32> {
        let mut found = self.vol.sb.root_inode;
        // None while the walk sits on the root, which is never closed here.
        let mut current: Option<Handle> = None;

        for name in components(path) {
            let lookup = if name.len() > MAX_NAME_LEN {
                Err(MFSError::NotFound(name.to_string()))
            } else {
                let dir = match current.as_mut() {
                    Some(handle) => handle,
                    None => &mut self.root,
                };
                self.vol.find_entry(dir, name)
            };
            let next = lookup.and_then(|id| {
                if id == self.vol.sb.root_inode {
                    Ok((id, None))
                } else {
                    self.vol.open_handle(id).map(|handle| (id, Some(handle)))
                }
            });
            let (id, handle) = match next {
                Ok(next) => next,
                Err(e) => {
                    if let Some(previous) = current.take() {
                        self.vol.close(previous)?;
                    }
                    debug!("resolving {:?} failed at {:?}: {}", path, name, e);
                    return Err(e);
                }
            };
            if let Some(previous) = std::mem::replace(&mut current, handle) {
                self.vol.close(previous)?;
            }
            found = id;
        }

        if let Some(last) = current {
            self.vol.close(last)?;
        }
        debug!("resolved {:?} to inode {}", path, found);
        Ok(found)
    }

    /// Creates an inode of `kind` and links it as `name` inside the directory
    /// at `parent`. Fails if the directory already has an entry of that name.
    pub fn make_entry(&mut self, parent: &str, name: &str, kind: InodeKind) -> Result<u32> {
        check_name(name)?;
        let parent_id = self.resolve_path(parent)?;
        self.with_handle(parent_id, |vol, dir| {
            if !dir.is_dir() {
                return Err(MFSError::NotADirectory(dir.id()));
            }
            match vol.find_entry(dir, name) {
                Ok(_) => return Err(MFSError::AlreadyExists(name.to_string())),
                Err(MFSError::NotFound(_)) => (),
                Err(e) => return Err(e),
            }

            let child = vol.create_handle(kind)?;
            let child_id = child.id();
            let inode = child.inode;
            vol.close(child)?;
            if let Err(e) = vol.add_entry(dir, name, child_id) {
                vol.remove_inode(inode)?;
                return Err(e);
            }
            Ok(child_id)
        })
    }

    /// Releases an inode and every block it owns. Directory entries that
    /// still name it are left as they are.
    pub fn delete_inode(&mut self, id: u32) -> Result<()> {
        if id == self.vol.sb.root_inode {
            return Err(MFSError::InvalidArgument(
                "the root directory cannot be deleted".to_string(),
            ));
        }
        let handle = self.vol.open_handle(id)?;
        self.vol.remove_inode(handle.inode)
    }

    /// Runs `f` on a handle for `id`, closing it afterwards unless it is the root.
    fn with_handle<R, F>(&mut self, id: u32, f: F) -> Result<R>
    where
        F: FnOnce(&mut Volume<T>, &mut Handle) -> Result<R>,
    {
        if id == self.vol.sb.root_inode {
            return f(&mut self.vol, &mut self.root);
        }
        let mut handle = self.vol.open_handle(id)?;
        let result = f(&mut self.vol, &mut handle);
        let closed = self.vol.close(handle);
        let value = result?;
        closed?;
        Ok(value)
    }
}

enum Slot<'a> {
    Owned(Handle),
    Root(&'a mut Handle),
}

impl Deref for Slot<'_> {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        match self {
            Slot::Owned(handle) => handle,
            Slot::Root(handle) => handle,
        }
    }
}

impl DerefMut for Slot<'_> {
    fn deref_mut(&mut self) -> &mut Handle {
        match self {
            Slot::Owned(handle) => handle,
            Slot::Root(handle) => handle,
        }
    }
}

/// An open inode. Borrows the volume for as long as it is open.
///
/// Closing flushes the inode record. Dropping an open file closes it, logging
/// any error; call [`OpenFile::close`] to observe the error instead. The root
/// directory is only flushed, never closed.
pub struct OpenFile<'a, T: BlockStorage> {
    vol: &'a mut Volume<T>,
    handle: Slot<'a>,
    closed: bool,
}

impl<'a, T: BlockStorage> OpenFile<'a, T> {
    pub fn id(&self) -> u32 {
        self.handle.id()
    }

    pub fn kind(&self) -> InodeKind {
        if self.handle.is_dir() {
            InodeKind::Directory
        } else {
            InodeKind::File
        }
    }

    pub fn is_dir(&self) -> bool {
        self.handle.is_dir()
    }

    pub fn size(&self) -> usize {
        self.handle.size()
    }

    pub fn info(&self) -> Result<InodeInfo> {
        InodeInfo::of(&self.handle.inode)
    }

    /// Reads from `offset` into `buf`, stopping at the end of the file.
    pub fn read_at(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.vol.read_at(&mut self.handle, offset, buf)
    }

    /// Writes `buf` at `offset`, growing the file as needed.
    pub fn write_at(&mut self, offset: usize, buf: &[u8]) -> Result<usize> {
        self.vol.write_at(&mut self.handle, offset, buf)
    }

    pub fn append(&mut self, buf: &[u8]) -> Result<usize> {
        let offset = self.handle.size();
        self.write_at(offset, buf)
    }

    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut content = vec![0; self.handle.size()];
        let read = self.read_at(0, &mut content)?;
        content.truncate(read);
        Ok(content)
    }

    /// Appends a directory entry. Does not check for duplicate names.
    pub fn add_entry(&mut self, name: &str, inode: u32) -> Result<()> {
        self.vol.add_entry(&mut self.handle, name, inode)
    }

    /// Directory entries, most recently added first.
    pub fn entries(&mut self) -> Result<Vec<DirEntry>> {
        self.vol.list_entries(&mut self.handle)
    }

    pub fn find_entry(&mut self, name: &str) -> Result<u32> {
        self.vol.find_entry(&mut self.handle, name)
    }

    /// Flushes the inode and closes the file.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.vol.flush_handle(&mut self.handle)
    }
}

impl<'a, T: BlockStorage> Drop for OpenFile<'a, T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let needs_flush = match self.handle {
            Slot::Owned(_) => true,
            Slot::Root(ref handle) => !handle.flushed,
        };
        if needs_flush {
            if let Err(e) = self.vol.flush_handle(&mut self.handle) {
                error!("failed to flush inode {} on close: {}", self.handle.id(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device, pattern};
    use fileblock::{FileBlockEmulator, FileBlockEmulatorBuilder};

    fn opts() -> FormatOptions {
        FormatOptions::new().with_data_blocks(64).with_inodes(16)
    }

    fn create_test_fs() -> MFS<FileBlockEmulator> {
        let blocks = SuperBlock::plan(&opts()).unwrap().blocks_count as usize;
        MFS::create(device(blocks), &opts()).unwrap()
    }

    #[test]
    fn fresh_volume_has_directory_root() {
        let mut fs = create_test_fs();
        assert_eq!(fs.super_block().used_inodes, 1);
        let root = fs.root();
        assert!(root.is_dir());
        assert_eq!(root.size(), 0);
        assert_eq!(root.id(), 0);
    }

    #[test]
    fn format_rejects_small_device() {
        let mut dev = device(4);
        assert!(matches!(
            MFS::format(&mut dev, &opts()),
            Err(MFSError::InvalidArgument(_))
        ));
    }

    #[test]
    fn unformatted_device_has_bad_magic() {
        match MFS::open(device(8)) {
            Err(MFSError::BadMagic(0)) => (),
            other => panic!("expected BadMagic, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn root_dir_resolves_to_root() {
        let mut fs = create_test_fs();
        assert_eq!(fs.resolve_path("/").unwrap(), 0);
        assert_eq!(fs.resolve_path("").unwrap(), 0);
    }

    #[test]
    fn missing_file_is_not_found() {
        let mut fs = create_test_fs();
        match fs.resolve_path("/foo") {
            Err(MFSError::NotFound(name)) => assert_eq!(name, "foo"),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn resolves_nested_paths() {
        let mut fs = create_test_fs();
        let docs = fs.make_entry("/", "docs", InodeKind::Directory).unwrap();
        let readme = fs.make_entry("/docs", "readme.md", InodeKind::File).unwrap();

        assert_eq!(fs.resolve_path("/docs/readme.md").unwrap(), readme);
        assert_eq!(fs.resolve_path("docs/README.MD").unwrap(), readme);
        assert_eq!(fs.resolve_path("/docs/").unwrap(), docs);
        assert!(matches!(
            fs.resolve_path("/docs/missing.md"),
            Err(MFSError::NotFound(_))
        ));
        assert!(matches!(
            fs.resolve_path("/docs/readme.md/deeper"),
            Err(MFSError::NotADirectory(id)) if id == readme
        ));
    }

    #[test]
    fn make_entry_rejects_duplicates_and_files_as_parents() {
        let mut fs = create_test_fs();
        fs.make_entry("/", "a", InodeKind::File).unwrap();
        assert!(matches!(
            fs.make_entry("/", "A", InodeKind::File),
            Err(MFSError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.make_entry("/a", "b", InodeKind::File),
            Err(MFSError::NotADirectory(_))
        ));
        assert_eq!(fs.super_block().used_inodes, 2);
    }

    #[test]
    fn full_directory_keeps_earlier_entries() {
        let opts = FormatOptions::new().with_data_blocks(1).with_inodes(8);
        let blocks = SuperBlock::plan(&opts).unwrap().blocks_count as usize;
        let mut fs = MFS::create(device(blocks), &opts).unwrap();
        let docs = fs.make_entry("/", "docs", InodeKind::Directory).unwrap();

        let mut added = 0;
        loop {
            let name = format!("{:0100}", added);
            match fs.root().add_entry(&name, docs) {
                Ok(()) => added += 1,
                Err(e) => {
                    assert!(matches!(
                        e,
                        MFSError::AllocationExhausted(Resource::DataBlock)
                    ));
                    break;
                }
            }
            assert!(added < 64, "root never filled up");
        }

        assert_eq!(fs.root().size(), 9 + added * 105);
        assert_eq!(fs.root().entries().unwrap().len(), added + 1);
        assert_eq!(fs.resolve_path("/docs").unwrap(), docs);
        assert_eq!(fs.free_data_blocks(), 0);
    }

    #[test]
    fn created_files_count_as_used_inodes() {
        let mut fs = create_test_fs();
        let id = {
            let file = fs.create_file(InodeKind::File).unwrap();
            file.id()
        };
        assert_eq!(fs.super_block().used_inodes, 2);
        assert_eq!(fs.free_inodes(), 14);
        assert_eq!(fs.stat(id).unwrap().kind, InodeKind::File);
    }

    #[test]
    fn inode_exhaustion_is_reported() {
        let mut fs = create_test_fs();
        for _ in 1..16 {
            fs.create_file(InodeKind::File).unwrap().close().unwrap();
        }
        assert!(matches!(
            fs.create_file(InodeKind::File).map(|f| f.id()),
            Err(MFSError::AllocationExhausted(Resource::Inode))
        ));
    }

    #[test]
    fn dropped_handle_flushes_its_inode() {
        let mut fs = create_test_fs();
        let id = {
            let mut file = fs.create_file(InodeKind::File).unwrap();
            file.write_at(0, b"data").unwrap();
            file.id()
        };
        let mut file = fs.open_inode(id).unwrap();
        assert_eq!(file.read_to_end().unwrap(), b"data".to_vec());
    }

    #[test]
    fn open_inode_of_root_shares_the_root_handle() {
        let mut fs = create_test_fs();
        fs.open_inode(0).unwrap().add_entry("x", 9).unwrap();
        assert_eq!(fs.root().find_entry("x").unwrap(), 9);
        assert_eq!(fs.root.size(), DirEntry::encode("x", 9).unwrap().len());
    }

    #[test]
    fn delete_returns_blocks_and_id() {
        let mut fs = create_test_fs();
        let id = fs.make_entry("/", "big", InodeKind::File).unwrap();
        let before = fs.free_data_blocks();
        fs.open_inode(id)
            .unwrap()
            .write_at(0, &pattern(12 * BLOCK_SIZE))
            .unwrap();
        // 12 data blocks and the indirect block.
        assert_eq!(fs.free_data_blocks(), before - 13);

        fs.delete_inode(id).unwrap();

        assert_eq!(fs.free_data_blocks(), before);
        assert_eq!(fs.super_block().used_inodes, 1);
        assert!(matches!(fs.open_inode(id).map(|f| f.id()), Err(MFSError::NotFound(_))));
        assert!(matches!(
            fs.delete_inode(0),
            Err(MFSError::InvalidArgument(_))
        ));
    }

    #[test]
    fn can_create_and_reopen_initialized_filesystem() {
        let blocks = SuperBlock::plan(&opts()).unwrap().blocks_count as usize;
        let disk = tempfile::NamedTempFile::new().unwrap();
        let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(blocks)
            .build()
            .unwrap();
        let mut fs = MFS::create(dev, &opts()).unwrap();
        let id = fs.make_entry("/", "notes.txt", InodeKind::File).unwrap();
        fs.open_inode(id).unwrap().write_at(0, b"persisted").unwrap();
        let sb = fs.super_block().clone();
        fs.unmount().unwrap();

        let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
            .with_block_count(blocks)
            // Don't reset initialized disk.
            .clear_medium(false)
            .build()
            .unwrap();
        let mut fs: MFS<FileBlockEmulator> = MFS::open(dev).unwrap();
        assert_eq!(fs.super_block(), &sb);
        assert_eq!(fs.super_block().used_inodes, 2);
        // One block each for the root's entries and the file.
        assert_eq!(fs.free_data_blocks(), 62);
        let id = fs.resolve_path("/notes.txt").unwrap();
        assert_eq!(
            fs.open_inode(id).unwrap().read_to_end().unwrap(),
            b"persisted".to_vec()
        );
        // The reloaded bitmap hands out the next free id.
        assert_eq!(fs.create_file(InodeKind::File).unwrap().id(), 2);
    }
}
