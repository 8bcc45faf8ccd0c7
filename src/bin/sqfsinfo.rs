//! Print the superblock of a squashfs image.

#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sqfsbuild::{Flags, SqfsReader};

/// Print superblock and flag information for a squashfs image
#[derive(Parser)]
#[command(author, version, name = "sqfsinfo")]
struct Args {
    /// Input squashfs image
    image: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    let file = match File::open(&args.image) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("error opening {}: {e}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    let reader = match SqfsReader::open(BufReader::new(file)) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error reading {}: {e}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    let sb = &reader.superblock;
    println!("{sb:#08x?}");

    let flags = sb.flags();
    if flags.contains(Flags::INODES_STORED_UNCOMPRESSED) {
        println!("flag: inodes uncompressed");
    }
    if flags.contains(Flags::DATA_BLOCK_STORED_UNCOMPRESSED) {
        println!("flag: data blocks stored uncompressed");
    }
    if flags.contains(Flags::FRAGMENTS_STORED_UNCOMPRESSED) {
        println!("flag: fragments stored uncompressed");
    }
    if flags.contains(Flags::FRAGMENTS_ARE_NOT_USED) {
        println!("flag: fragments are not used");
    }
    if flags.contains(Flags::NFS_EXPORT_TABLE_EXISTS) {
        println!("flag: nfs export table exists");
    }
    if flags.contains(Flags::NO_XATTRS) {
        println!("flag: no xattrs stored");
    }
    if flags.contains(Flags::COMPRESSOR_OPTIONS_PRESENT) {
        println!("flag: compressor options are present");
    }

    println!();
    println!("Inodes: {}", sb.inode_count);
    println!("Block size: {}", sb.block_size);
    println!("Fragments: {}", sb.frag_count);
    println!("Ids: {}", sb.id_count);
    println!("Bytes used: {}", sb.bytes_used);

    ExitCode::SUCCESS
}
