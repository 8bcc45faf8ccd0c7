//! End-to-end build/read round trips.

use std::io::Cursor;

use sqfsbuild::{
    Compressor, FileSource, InodeInner, NodeHeader, NodeKind, SqfsReader, SqfsWriter, Tree,
    TreeWalker, WriterConfig,
};

fn header() -> NodeHeader {
    NodeHeader { permissions: 0o644, uid: 1000, gid: 1000, mtime: 0x1234_5678 }
}

fn build(tree: Tree, compressor: Compressor) -> Cursor<Vec<u8>> {
    let config = WriterConfig {
        block_size: 131072,
        device_block_size: 4096,
        compressor,
        compression_options: None,
        workers: 2,
        exportable: true,
        no_xattrs: false,
        default_mtime: 0,
        warning_sink: None,
    };
    let out = Cursor::new(Vec::new());
    SqfsWriter::new(out, config, tree).unwrap().finish().unwrap()
}

fn path(s: &str) -> Vec<Vec<u8>> {
    s.split('/').map(|c| c.as_bytes().to_vec()).collect()
}

#[test]
fn file_survives_a_build_and_read_round_trip() {
    let mut tree = Tree::new(header());
    tree.add_generic(
        &path("hello.txt"),
        header(),
        None,
        NodeKind::File { source: FileSource::Bytes(b"hello, squashfs".to_vec()) },
    )
    .unwrap();

    let image = build(tree, Compressor::Xz);
    let mut reader = SqfsReader::open(image).unwrap();
    let root = reader.read_root().unwrap();
    let (block_index, block_offset, file_size) = match &root.inner {
        InodeInner::BasicDirectory(d) => (d.block_index, d.block_offset, d.file_size as u32),
        InodeInner::ExtendedDirectory(d) => (d.block_index, d.block_offset, d.file_size),
        other => panic!("root is not a directory: {other:?}"),
    };
    let entries = reader.read_dir(block_index, block_offset, file_size).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, b"hello.txt");

    let file_inode = reader.read_inode(entries[0].inode_ref).unwrap();
    let data = match &file_inode.inner {
        InodeInner::BasicFile(f) => reader
            .read_file_data(
                f.blocks_start as u64,
                f.block_offset,
                f.frag_index,
                f.file_size as u64,
                &f.block_sizes,
            )
            .unwrap(),
        InodeInner::ExtendedFile(f) => reader
            .read_file_data(f.blocks_start, f.block_offset, f.frag_index, f.file_size, &f.block_sizes)
            .unwrap(),
        other => panic!("expected a file inode, got {other:?}"),
    };
    assert_eq!(data, b"hello, squashfs");
}

#[test]
fn nested_directories_and_nonzero_ids_roundtrip() {
    let mut tree = Tree::new(header());
    tree.add_generic(&path("a"), header(), None, NodeKind::Directory { children: Default::default() })
        .unwrap();
    tree.add_generic(
        &path("a/b"),
        NodeHeader { permissions: 0o600, uid: 4242, gid: 7, mtime: 1 },
        None,
        NodeKind::File { source: FileSource::Bytes(vec![0u8; 300_000]) },
    )
    .unwrap();

    let image = build(tree, Compressor::Xz);
    let mut reader = SqfsReader::open(image).unwrap();

    let mut walker = TreeWalker::new(&mut reader).unwrap();
    let mut seen = Vec::new();
    while let Some((path, inode)) = walker.next_node().unwrap() {
        seen.push((path, inode));
    }
    assert_eq!(seen.len(), 3); // root, a, a/b

    let (_, b_inode) = seen
        .iter()
        .find(|(p, _)| p.ends_with("b"))
        .expect("a/b should have been walked");
    assert_eq!(walker.reader_mut().lookup_id(b_inode.header.uid), 4242);
    assert_eq!(walker.reader_mut().lookup_id(b_inode.header.gid), 7);
}

#[test]
fn symlink_target_roundtrips() {
    let mut tree = Tree::new(header());
    tree.add_generic(
        &path("link"),
        header(),
        None,
        NodeKind::Symlink { target: b"/usr/bin/env".to_vec() },
    )
    .unwrap();

    let image = build(tree, Compressor::Gzip);
    let mut reader = SqfsReader::open(image).unwrap();
    let root = reader.read_root().unwrap();
    let (block_index, block_offset, file_size) = match &root.inner {
        InodeInner::BasicDirectory(d) => (d.block_index, d.block_offset, d.file_size as u32),
        InodeInner::ExtendedDirectory(d) => (d.block_index, d.block_offset, d.file_size),
        other => panic!("root is not a directory: {other:?}"),
    };
    let entries = reader.read_dir(block_index, block_offset, file_size).unwrap();
    let link = reader.read_inode(entries[0].inode_ref).unwrap();
    match &link.inner {
        InodeInner::BasicSymlink(s) => assert_eq!(s.target(), "/usr/bin/env"),
        InodeInner::ExtendedSymlink(s) => assert_eq!(s.target_path, b"/usr/bin/env"),
        other => panic!("expected a symlink inode, got {other:?}"),
    }
}

#[test]
fn writes_to_and_reads_back_from_a_real_file() {
    use std::fs::{File, OpenOptions};

    let mut tree = Tree::new(header());
    tree.add_generic(
        &path("data.bin"),
        header(),
        None,
        NodeKind::File { source: FileSource::Bytes(b"on disk this time".to_vec()) },
    )
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("out.sqfs");

    let config = WriterConfig {
        block_size: 131072,
        device_block_size: 4096,
        compressor: Compressor::Xz,
        compression_options: None,
        workers: 1,
        exportable: false,
        no_xattrs: false,
        default_mtime: 0,
        warning_sink: None,
    };
    let out = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&image_path)
        .unwrap();
    SqfsWriter::new(out, config, tree).unwrap().finish().unwrap();

    let file = File::open(&image_path).unwrap();
    let mut reader = SqfsReader::open(file).unwrap();
    let root = reader.read_root().unwrap();
    let (block_index, block_offset, file_size) = match &root.inner {
        InodeInner::BasicDirectory(d) => (d.block_index, d.block_offset, d.file_size as u32),
        InodeInner::ExtendedDirectory(d) => (d.block_index, d.block_offset, d.file_size),
        other => panic!("root is not a directory: {other:?}"),
    };
    let entries = reader.read_dir(block_index, block_offset, file_size).unwrap();
    assert_eq!(entries[0].name, b"data.bin");
}
