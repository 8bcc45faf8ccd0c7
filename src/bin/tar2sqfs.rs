//! Read an uncompressed tar archive from stdin and turn it into a squashfs image.

#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sqfsbuild::{BackhandError, FileSource, NodeHeader, NodeKind, SqfsWriter, Tree, WriterConfig};
use tar::EntryType;

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

/// Turn an uncompressed tar stream (read from stdin) into a squashfs image
#[derive(Parser)]
#[command(author, version, name = "tar2sqfs")]
struct Args {
    /// Output squashfs image path
    image: PathBuf,

    #[arg(short, long = "compressor", default_value = "xz", value_parser = parse_compressor)]
    compressor: sqfsbuild::Compressor,

    #[arg(short = 'b', long = "block-size", default_value = "128K", value_parser = parse_block_size)]
    block_size: u32,

    #[arg(short = 'B', long = "dev-block-size", default_value = "4K", value_parser = parse_block_size)]
    dev_block_size: u32,

    #[arg(short = 'j', long = "num-jobs")]
    num_jobs: Option<usize>,

    /// Abort on the first tar record that cannot be read, instead of skipping it
    #[arg(short = 's', long = "no-skip")]
    no_skip: bool,

    /// Generate an export table for NFS support
    #[arg(short, long)]
    exportable: bool,

    /// Silence progress output
    #[arg(short, long)]
    quiet: bool,
}

fn split_path(path: &std::path::Path) -> Vec<Vec<u8>> {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::RootDir | std::path::Component::CurDir))
        .map(|c| c.as_os_str().to_owned().into_encoded_bytes())
        .collect()
}

fn push_entry(
    tree: &mut Tree,
    entry: &mut tar::Entry<impl Read>,
) -> Result<(), BackhandError> {
    let header = entry.header();
    let path = entry.path()?.into_owned();
    let rel = split_path(&path);
    if rel.is_empty() {
        return Ok(());
    }

    let node_header = NodeHeader {
        permissions: (header.mode().unwrap_or(0o644) & 0xfff) as u16,
        uid: header.uid().unwrap_or(0) as u32,
        gid: header.gid().unwrap_or(0) as u32,
        mtime: header.mtime().unwrap_or(0) as u32,
    };

    let kind = match header.entry_type() {
        EntryType::Directory => NodeKind::Directory { children: Default::default() },
        EntryType::Regular | EntryType::Continuous => {
            let mut data = Vec::with_capacity(header.size().unwrap_or(0) as usize);
            entry.read_to_end(&mut data)?;
            NodeKind::File { source: FileSource::Bytes(data) }
        }
        EntryType::Symlink => {
            let target = entry
                .link_name()?
                .ok_or(BackhandError::InvalidFilePath)?
                .into_owned()
                .into_os_string()
                .into_encoded_bytes();
            NodeKind::Symlink { target }
        }
        EntryType::Link => {
            let target = entry
                .link_name()?
                .ok_or(BackhandError::InvalidFilePath)?
                .into_owned();
            NodeKind::HardLink { target: split_path(&target), resolved: None }
        }
        EntryType::Fifo => NodeKind::Fifo,
        _ => return Ok(()),
    };

    tree.add_generic(&rel, node_header, None, kind)?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    let mut tree = Tree::new(NodeHeader { permissions: 0o755, uid: 0, gid: 0, mtime: 0 });
    let stdin = io::stdin();
    let mut archive = tar::Archive::new(stdin.lock());

    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("error reading tar stream: {e}");
            return ExitCode::FAILURE;
        }
    };

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if args.no_skip => {
                eprintln!("error reading tar record: {e}");
                return ExitCode::FAILURE;
            }
            Err(e) => {
                eprintln!("skipping unreadable tar record: {e}");
                continue;
            }
        };
        if let Err(e) = push_entry(&mut tree, &mut entry) {
            if args.no_skip {
                eprintln!("error packing tar record: {e}");
                return ExitCode::FAILURE;
            }
            eprintln!("skipping tar record: {e}");
        }
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
        no_xattrs: false,
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

    match SqfsWriter::new(out, config, tree).and_then(SqfsWriter::finish) {
        Ok(_) => {
            if !args.quiet {
                eprintln!("wrote {}", args.image.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error building {}: {e}", args.image.display());
            ExitCode::FAILURE
        }
    }
}
