//! EmberFS image builder
//!
//! Drives the real engine against an in-memory flash device and dumps the
//! raw flash to a file, so images are bit-identical to what a device
//! produces on its own. Can also list the contents of an existing image.

use clap::Parser;
use emberfs::flash::DEFAULT_BLOCK_SIZE;
use emberfs::{FileSystem, FsError, Geometry, OpenFlags, RamFlash, MAX_NAME_LEN};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(about = "Build and inspect EmberFS flash images")]
struct Args {
    /// Output flash image path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory tree to import into the image
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Flash page size in bytes
    #[arg(long, default_value_t = 1024)]
    page_size: usize,

    /// Number of flash pages
    #[arg(long, default_value_t = 128)]
    pages: usize,

    /// List the contents of an existing image instead of building one
    #[arg(short, long)]
    list: Option<PathBuf>,
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    if let Some(image) = &args.list {
        return list_image(image, args.page_size);
    }

    let output = match &args.output {
        Some(path) => path.clone(),
        None => {
            eprintln!("error: --output is required unless --list is given");
            std::process::exit(2);
        }
    };

    let geometry = Geometry {
        page_size: args.page_size,
        page_count: args.pages,
        block_size: DEFAULT_BLOCK_SIZE,
    };
    println!(
        "Creating EmberFS image: {:?} ({} KiB, {} blocks of {} bytes)",
        output,
        geometry.total_bytes() / 1024,
        geometry.total_blocks(),
        geometry.block_size
    );

    let mut fs = FileSystem::format(RamFlash::with_geometry(geometry)).map_err(fs_err)?;

    let mut imported = 0u64;
    if let Some(dir) = &args.dir {
        if dir.exists() {
            import_tree(&mut fs, dir, "", &mut imported)?;
        } else {
            println!("⚠️  Source directory {:?} does not exist, image stays empty", dir);
        }
    }

    let dev = fs.into_device().map_err(fs_err)?;
    fs::write(&output, dev.data())?;
    println!("\n✅ Done. {} files imported.", imported);
    Ok(())
}

/// Import all files and subdirectories under `dir` into the image
fn import_tree(
    fs: &mut FileSystem<RamFlash>,
    dir: &Path,
    prefix: &str,
    imported: &mut u64,
) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        if name.len() > MAX_NAME_LEN {
            println!(
                "  ⚠️  Skipping {}{}: name too long (max {} chars)",
                prefix, name, MAX_NAME_LEN
            );
            continue;
        }
        let fs_path = format!("{}{}", prefix, name);

        if path.is_dir() {
            println!("  📁 Creating {}/", fs_path);
            fs.create_directory(&fs_path).map_err(fs_err)?;
            import_tree(fs, &path, &format!("{}/", fs_path), imported)?;
        } else if path.is_file() {
            let data = fs::read(&path)?;
            println!("  📄 Importing {} ({} bytes)", fs_path, data.len());
            let mut file = fs
                .open_file(&fs_path, OpenFlags::WRITE | OpenFlags::CREATE)
                .map_err(fs_err)?;
            file.write_all(&data).map_err(fs_err)?;
            file.close().map_err(fs_err)?;
            *imported += 1;
        }
    }
    Ok(())
}

/// Mount an image file and print its tree
fn list_image(image: &Path, page_size: usize) -> io::Result<()> {
    let data = fs::read(image)?;
    if page_size == 0 || data.len() % page_size != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("image size {} is not a multiple of the page size", data.len()),
        ));
    }
    let geometry = Geometry {
        page_size,
        page_count: data.len() / page_size,
        block_size: DEFAULT_BLOCK_SIZE,
    };
    let dev = RamFlash::from_image(data, geometry)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    let mut fs = FileSystem::mount(dev).map_err(fs_err)?;

    println!("SIZE        NAME");
    println!("----------  --------------------");
    list_dir(&mut fs, "")?;

    let stats = fs.stats().map_err(fs_err)?;
    println!(
        "\n{} of {} blocks free, {} awaiting recycle",
        stats.free_blocks, stats.total_blocks, stats.deleted_blocks
    );
    Ok(())
}

fn list_dir(fs: &mut FileSystem<RamFlash>, path: &str) -> io::Result<()> {
    let mut entries = fs.read_dir(path).map_err(fs_err)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for entry in entries {
        let full = if path.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", path, entry.name)
        };
        if entry.is_dir {
            println!("{:<10}  {}/", "-", full);
            list_dir(fs, &full)?;
        } else {
            println!("{:<10}  {}", entry.length, full);
        }
    }
    Ok(())
}

fn fs_err(e: FsError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("file system error: {}", e))
}
