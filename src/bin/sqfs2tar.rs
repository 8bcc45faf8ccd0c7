//! Read a squashfs image and turn it into a tar archive written to stdout.

#[cfg(all(target_env = "musl", target_pointer_width = "64"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use sqfsbuild::inode::InodeInner;
use sqfsbuild::{BackhandError, Inode, SqfsReader, TreeWalker};
use tar::{Builder, EntryType, Header};

/// Unpack a squashfs image into a tar stream on stdout
#[derive(Parser)]
#[command(author, version, name = "sqfs2tar")]
struct Args {
    /// Input squashfs image
    image: PathBuf,

    /// Do not copy extended attributes
    #[arg(short = 'X', long = "no-xattr")]
    no_xattr: bool,

    /// Abort if an entry cannot be stored in the tar archive, instead of skipping it
    #[arg(short = 's', long = "no-skip")]
    no_skip: bool,
}

fn run<W: Write>(args: &Args, tar: &mut Builder<W>) -> Result<(), BackhandError> {
    let file = File::open(&args.image)?;
    let mut reader = SqfsReader::open(BufReader::new(file))?;

    let mut walker = TreeWalker::new(&mut reader)?;
    while let Some((path, inode)) = walker.next_node()? {
        if path == Path::new("/") {
            continue;
        }
        if let Err(e) = emit(walker.reader_mut(), tar, &path, &inode, args.no_xattr) {
            if args.no_skip {
                return Err(e);
            }
            eprintln!("skipping {}: {e}", path.display());
        }
    }
    Ok(())
}

fn tar_path(path: &Path) -> std::path::PathBuf {
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}

fn emit<W: Write>(
    reader: &mut SqfsReader<BufReader<File>>,
    tar: &mut Builder<W>,
    path: &Path,
    inode: &Inode,
    no_xattr: bool,
) -> Result<(), BackhandError> {
    let mode = inode.header.permissions as u32;
    let uid = reader.lookup_id(inode.header.uid);
    let gid = reader.lookup_id(inode.header.gid);
    let mtime = inode.header.mtime as u64;

    let mut header = Header::new_gnu();
    header.set_mode(mode);
    header.set_uid(uid as u64);
    header.set_gid(gid as u64);
    header.set_mtime(mtime);

    let xattr_index = match &inode.inner {
        InodeInner::BasicFile(_)
        | InodeInner::BasicDirectory(_)
        | InodeInner::BasicSymlink(_)
        | InodeInner::BasicBlockDevice(_)
        | InodeInner::BasicCharacterDevice(_)
        | InodeInner::BasicFifo(_)
        | InodeInner::BasicSocket(_) => sqfsbuild::NO_XATTR,
        InodeInner::ExtendedFile(f) => f.xattr_index,
        InodeInner::ExtendedDirectory(d) => d.xattr_index,
        InodeInner::ExtendedSymlink(s) => s.xattr_index,
        InodeInner::ExtendedBlockDevice(d) | InodeInner::ExtendedCharDevice(d) => d.xattr_index,
        InodeInner::ExtendedFifo(i) | InodeInner::ExtendedSocket(i) => i.xattr_index,
    };

    if !no_xattr && xattr_index != sqfsbuild::NO_XATTR {
        let xattrs = reader.read_xattrs(xattr_index)?;
        if !xattrs.is_empty() {
            append_pax_xattrs(tar, &tar_path(path), &xattrs)?;
        }
    }

    match &inode.inner {
        InodeInner::BasicDirectory(_) | InodeInner::ExtendedDirectory(_) => {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            tar.append_data(&mut header, tar_path(path), io::empty())?;
        }
        InodeInner::BasicFile(f) => {
            let data = reader.read_file_data(
                f.blocks_start as u64,
                f.block_offset,
                f.frag_index,
                f.file_size as u64,
                &f.block_sizes,
            )?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(data.len() as u64);
            tar.append_data(&mut header, tar_path(path), data.as_slice())?;
        }
        InodeInner::ExtendedFile(f) => {
            let data = reader.read_file_data(
                f.blocks_start,
                f.block_offset,
                f.frag_index,
                f.file_size,
                &f.block_sizes,
            )?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(data.len() as u64);
            tar.append_data(&mut header, tar_path(path), data.as_slice())?;
        }
        InodeInner::BasicSymlink(s) => {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            tar.append_link(&mut header, tar_path(path), PathBuf::from(s.target()))?;
        }
        InodeInner::ExtendedSymlink(s) => {
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            let target = String::from_utf8_lossy(&s.target_path).into_owned();
            tar.append_link(&mut header, tar_path(path), PathBuf::from(target))?;
        }
        InodeInner::BasicBlockDevice(d) => {
            header.set_entry_type(EntryType::Block);
            header.set_device_major((d.device_number >> 8) & 0xfff);
            header.set_device_minor(d.device_number & 0xff);
            header.set_size(0);
            tar.append_data(&mut header, tar_path(path), io::empty())?;
        }
        InodeInner::ExtendedBlockDevice(d) => {
            header.set_entry_type(EntryType::Block);
            header.set_device_major((d.device_number >> 8) & 0xfff);
            header.set_device_minor(d.device_number & 0xff);
            header.set_size(0);
            tar.append_data(&mut header, tar_path(path), io::empty())?;
        }
        InodeInner::BasicCharacterDevice(d) => {
            header.set_entry_type(EntryType::Char);
            header.set_device_major((d.device_number >> 8) & 0xfff);
            header.set_device_minor(d.device_number & 0xff);
            header.set_size(0);
            tar.append_data(&mut header, tar_path(path), io::empty())?;
        }
        InodeInner::ExtendedCharDevice(d) => {
            header.set_entry_type(EntryType::Char);
            header.set_device_major((d.device_number >> 8) & 0xfff);
            header.set_device_minor(d.device_number & 0xff);
            header.set_size(0);
            tar.append_data(&mut header, tar_path(path), io::empty())?;
        }
        InodeInner::BasicFifo(_) | InodeInner::ExtendedFifo(_) => {
            header.set_entry_type(EntryType::Fifo);
            header.set_size(0);
            tar.append_data(&mut header, tar_path(path), io::empty())?;
        }
        InodeInner::BasicSocket(_) | InodeInner::ExtendedSocket(_) => {
            // tar has no socket entry type; skip, matching the reference unpacker.
            return Ok(());
        }
    }

    Ok(())
}

/// Emit a PAX extended header record (`SCHILY.xattr.<name>=<value>` per entry,
/// the convention GNU tar and libarchive use for squashfs/tar xattr round trips)
/// ahead of the entry it describes.
fn append_pax_xattrs<W: Write>(
    tar: &mut Builder<W>,
    path: &Path,
    xattrs: &[sqfsbuild::XattrEntry],
) -> Result<(), BackhandError> {
    let mut body = Vec::new();
    for entry in xattrs {
        let prefix = match entry.key.prefix {
            sqfsbuild::XattrPrefix::User => "user.",
            sqfsbuild::XattrPrefix::Trusted => "trusted.",
            sqfsbuild::XattrPrefix::Security => "security.",
        };
        let key = format!("SCHILY.xattr.{prefix}{}", String::from_utf8_lossy(&entry.key.name));
        // A pax record is "<len> <key>=<value>\n" where <len> is the record's own
        // decimal length, including itself and the trailing newline.
        let suffix_len = 1 + key.len() + 1 + entry.value.len() + 1;
        let mut len = suffix_len;
        loop {
            let full_len = len.to_string().len() + suffix_len;
            if full_len == len {
                break;
            }
            len = full_len;
        }
        body.extend_from_slice(len.to_string().as_bytes());
        body.push(b' ');
        body.extend_from_slice(key.as_bytes());
        body.push(b'=');
        body.extend_from_slice(&entry.value);
        body.push(b'\n');
    }

    let mut header = Header::new_ustar();
    header.set_entry_type(EntryType::XHeader);
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    tar.append_data(&mut header, path, body.as_slice())?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    let stdout = io::stdout();
    let mut tar = Builder::new(stdout.lock());
    let result = run(&args, &mut tar).and_then(|_| tar.finish().map_err(BackhandError::from));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
