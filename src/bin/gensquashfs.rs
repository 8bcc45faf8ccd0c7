//! Build a squashfs image from a directory tree.

// musl's malloc is slow under heavy small-allocation churn, use jemalloc instead.
#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use sqfsbuild::{FileSource, NodeHeader, NodeKind, SqfsWriter, Tree, WriterConfig};

fn parse_block_size(arg: &str) -> Result<u32, String> {
    let multiplier = if arg.ends_with('K') {
        1024
    } else if arg.ends_with('M') {
        1024 * 1024
    } else {
        1
    };
    arg.trim_end_matches(['K', 'M'])
        .parse::<u32>()
        .map(|n| n * multiplier)
        .map_err(|e| format!("invalid block size {arg}: {e}"))
}

fn parse_compressor(arg: &str) -> Result<sqfsbuild::Compressor, String> {
    match arg {
        "gzip" => Ok(sqfsbuild::Compressor::Gzip),
        "lzo" => Ok(sqfsbuild::Compressor::Lzo),
        "lz4" => Ok(sqfsbuild::Compressor::Lz4),
        "xz" => Ok(sqfsbuild::Compressor::Xz),
        "zstd" => Ok(sqfsbuild::Compressor::Zstd),
        _ => Err(format!("unknown compressor {arg}, expected one of: gzip, lzo, lz4, xz, zstd")),
    }
}

/// Pack a directory into a new squashfs image
#[derive(Parser)]
#[command(author, version, name = "gensquashfs")]
struct Args {
    /// Output squashfs image path
    image: PathBuf,

    /// Directory to pack; becomes the filesystem root
    #[arg(short = 'D', long = "pack-dir")]
    pack_dir: PathBuf,

    /// Compressor to use
    #[arg(short, long = "compressor", default_value = "xz", value_parser = parse_compressor)]
    compressor: sqfsbuild::Compressor,

    /// Block size used for data blocks. Accepts a K or M suffix
    #[arg(short = 'b', long = "block-size", default_value = "128K", value_parser = parse_block_size)]
    block_size: u32,

    /// Device block size to pad the image to. Accepts a K or M suffix
    #[arg(short = 'B', long = "dev-block-size", default_value = "4K", value_parser = parse_block_size)]
    dev_block_size: u32,

    /// Number of compressor worker threads
    #[arg(short = 'j', long = "num-jobs")]
    num_jobs: Option<usize>,

    /// Force the owning uid of every inode to this value
    #[arg(short = 'u', long = "set-uid")]
    set_uid: Option<u32>,

    /// Force the owning gid of every inode to this value
    #[arg(short = 'g', long = "set-gid")]
    set_gid: Option<u32>,

    /// Shorthand for --set-uid 0 --set-gid 0
    #[arg(long = "all-root")]
    all_root: bool,

    /// Generate an export table for NFS support
    #[arg(short, long)]
    exportable: bool,

    /// Do not store extended attributes
    #[arg(long = "no-xattrs")]
    no_xattrs: bool,

    /// Silence progress output
    #[arg(short, long)]
    quiet: bool,
}

fn push_path(
    tree: &mut Tree,
    rel: &[Vec<u8>],
    path: &Path,
    meta: &std::fs::Metadata,
    args: &Args,
) -> Result<(), sqfsbuild::BackhandError> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let mode = (meta.mode() & 0xfff) as u16;
    let uid = args.set_uid.unwrap_or(if args.all_root { 0 } else { meta.uid() });
    let gid = args.set_gid.unwrap_or(if args.all_root { 0 } else { meta.gid() });
    let mtime = meta.mtime() as u32;
    let header = NodeHeader { permissions: mode, uid, gid, mtime };

    let ftype = meta.file_type();
    let kind = if ftype.is_dir() {
        NodeKind::Directory { children: Default::default() }
    } else if ftype.is_file() {
        NodeKind::File { source: FileSource::Path(path.to_path_buf()) }
    } else if ftype.is_symlink() {
        let target = std::fs::read_link(path)?;
        NodeKind::Symlink { target: target.into_os_string().into_encoded_bytes() }
    } else if ftype.is_fifo() {
        NodeKind::Fifo
    } else if ftype.is_socket() {
        NodeKind::Socket
    } else if ftype.is_block_device() || ftype.is_char_device() {
        let device_number = meta.rdev() as u32;
        if ftype.is_block_device() {
            NodeKind::BlockDevice { device_number }
        } else {
            NodeKind::CharDevice { device_number }
        }
    } else {
        return Ok(());
    };

    if rel.is_empty() {
        // Root directory: merge attributes onto the tree's existing root rather
        // than inserting a new node.
        let root = tree.root();
        tree.node_mut(root).header = header;
        return Ok(());
    }
    tree.add_generic(rel, header, None, kind)?;
    Ok(())
}

fn walk(
    tree: &mut Tree,
    root: &Path,
    dir: &Path,
    args: &Args,
) -> Result<(), sqfsbuild::BackhandError> {
    let rel: Vec<Vec<u8>> = dir
        .strip_prefix(root)
        .unwrap_or(Path::new(""))
        .components()
        .map(|c| c.as_os_str().to_owned().into_encoded_bytes())
        .collect();
    let meta = std::fs::symlink_metadata(dir)?;
    push_path(tree, &rel, dir, &meta, args)?;

    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(tree, root, &path, args)?;
        } else {
            let mut child_rel = rel.clone();
            child_rel.push(entry.file_name().into_encoded_bytes());
            push_path(tree, &child_rel, &path, &meta, args)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    let pb = ProgressBar::new_spinner();
    if !args.quiet {
        pb.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("packing {}", args.pack_dir.display()));
    }

    let mut tree = Tree::new(NodeHeader { permissions: 0o755, uid: 0, gid: 0, mtime: 0 });
    if let Err(e) = walk(&mut tree, &args.pack_dir, &args.pack_dir, &args) {
        eprintln!("error walking {}: {e}", args.pack_dir.display());
        return ExitCode::FAILURE;
    }

    let config = WriterConfig {
        block_size: args.block_size,
        device_block_size: args.dev_block_size,
        compressor: args.compressor,
        compression_options: None,
        workers: args.num_jobs.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }),
        exportable: args.exportable,
        no_xattrs: args.no_xattrs,
        default_mtime: 0,
        warning_sink: None,
    }
    .with_source_date_epoch_env();

    // Opened read-write: the block writer reads back dedup candidates from the
    // same file handle to verify a fingerprint match before reusing it.
    let out = match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.image)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error creating {}: {e}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    let result = SqfsWriter::new(out, config, tree).and_then(SqfsWriter::finish);
    match result {
        Ok(_) => {
            if !args.quiet {
                pb.finish_with_message(format!("wrote {}", args.image.display()));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            if !args.quiet {
                pb.finish_and_clear();
            }
            eprintln!("error building {}: {e}", args.image.display());
            ExitCode::FAILURE
        }
    }
}
