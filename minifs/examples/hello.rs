use fileblock::FileBlockEmulatorBuilder;
use minifs::{FormatOptions, InodeKind, MFS};

pub fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts = FormatOptions::new().with_data_blocks(256).with_inodes(64);
    let blocks = minifs::SuperBlock::plan(&opts)?.blocks_count as usize;
    let dev = FileBlockEmulatorBuilder::from(tempfile::tempfile()?)
        .with_block_count(blocks)
        .build()?;

    // create a new volume on the device and build a small tree under /
    let mut fs = MFS::create(dev, &opts)?;
    fs.make_entry("/", "docs", InodeKind::Directory)?;
    let readme = fs.make_entry("/docs", "readme.md", InodeKind::File)?;
    fs.open_inode(readme)?
        .write_at(0, b"# minifs\n\nA file system on a block device.\n")?;

    let found = fs.resolve_path("/DOCS/README.MD")?;
    let content = fs.open_inode(found)?.read_to_end()?;
    println!("/docs/readme.md -> inode {}", found);
    print!("{}", String::from_utf8_lossy(&content));

    let entries = fs.root().entries()?;
    for entry in entries {
        let info = fs.stat(entry.inode)?;
        println!("{:>4} {:?} {} bytes", entry.name, info.kind, info.size);
    }

    let sb = fs.super_block();
    println!(
        "{} of {} inodes used, {} of {} data blocks free",
        sb.used_inodes,
        sb.inodes_count,
        fs.free_data_blocks(),
        sb.data_blocks_count
    );
    fs.unmount()?;
    Ok(())
}
