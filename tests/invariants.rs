//! Property tests for invariants that are easy to state but easy to silently break:
//! duplicated file content must still round-trip byte for byte through the dedup
//! path, and inode numbering must stay dense with no gaps or repeats.

use std::collections::HashSet;
use std::io::Cursor;

use proptest::prelude::*;

use sqfsbuild::{
    Compressor, FileSource, InodeInner, NodeHeader, NodeKind, SqfsReader, SqfsWriter, Tree,
    WriterConfig,
};

fn header() -> NodeHeader {
    NodeHeader { permissions: 0o644, uid: 0, gid: 0, mtime: 0 }
}

fn arb_header() -> impl Strategy<Value = NodeHeader> {
    (0u16..=0o777, 0u32..10, 0u32..10, any::<u32>())
        .prop_map(|(permissions, uid, gid, mtime)| NodeHeader { permissions, uid, gid, mtime })
}

fn read_file_bytes(reader: &mut SqfsReader<Cursor<Vec<u8>>>, inode: &sqfsbuild::Inode) -> Vec<u8> {
    match &inode.inner {
        InodeInner::BasicFile(f) => reader
            .read_file_data(f.blocks_start as u64, f.block_offset, f.frag_index, f.file_size as u64, &f.block_sizes)
            .unwrap(),
        InodeInner::ExtendedFile(f) => reader
            .read_file_data(f.blocks_start, f.block_offset, f.frag_index, f.file_size, &f.block_sizes)
            .unwrap(),
        other => panic!("expected a file inode, got {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Several files sharing identical content must all read back the exact same
    /// bytes, regardless of how `block.rs`'s fingerprint dedup decides to reuse
    /// (or not reuse) an earlier block.
    #[test]
    fn duplicated_file_content_round_trips_through_dedup(
        content in proptest::collection::vec(any::<u8>(), 0..6000),
        copies in 2usize..5,
    ) {
        let mut tree = Tree::new(header());
        for i in 0..copies {
            tree.add_generic(
                &[format!("f{i}").into_bytes()],
                header(),
                None,
                NodeKind::File { source: FileSource::Bytes(content.clone()) },
            ).unwrap();
        }

        let config = WriterConfig {
            block_size: 4096,
            device_block_size: 4096,
            compressor: Compressor::Xz,
            compression_options: None,
            workers: 2,
            exportable: false,
            no_xattrs: true,
            default_mtime: 0,
            warning_sink: None,
        };
        let image = SqfsWriter::new(Cursor::new(Vec::new()), config, tree).unwrap().finish().unwrap();

        let mut reader = SqfsReader::open(image).unwrap();
        let root = reader.read_root().unwrap();
        let (block_index, block_offset, file_size) = match &root.inner {
            InodeInner::BasicDirectory(d) => (d.block_index, d.block_offset, d.file_size as u32),
            InodeInner::ExtendedDirectory(d) => (d.block_index, d.block_offset, d.file_size),
            other => panic!("root is not a directory: {other:?}"),
        };
        let entries = reader.read_dir(block_index, block_offset, file_size).unwrap();
        prop_assert_eq!(entries.len(), copies);
        for entry in entries {
            let inode = reader.read_inode(entry.inode_ref).unwrap();
            let data = read_file_bytes(&mut reader, &inode);
            prop_assert_eq!(data, content.clone());
        }
    }

    /// `Tree::post_process` must assign every non-hard-link node a distinct inode
    /// number, and those numbers must densely cover `1..=inode_count` with no gaps.
    #[test]
    fn inode_numbers_are_dense_and_unique(
        names in proptest::collection::hash_set("[a-z][a-z0-9]{0,7}", 1..12),
        node_header in arb_header(),
    ) {
        let mut tree = Tree::new(node_header);
        for name in &names {
            tree.add_generic(
                &[name.as_bytes().to_vec()],
                node_header,
                None,
                NodeKind::File { source: FileSource::Bytes(name.as_bytes().to_vec()) },
            ).unwrap();
        }
        let processed = tree.post_process().unwrap();

        let mut seen = HashSet::new();
        for id in 0..tree.len() {
            let number = tree.node(id).inode_number;
            prop_assert!(seen.insert(number), "inode number {number} assigned more than once");
        }
        prop_assert_eq!(seen.len(), processed.inode_count as usize);

        let mut sorted: Vec<u32> = seen.into_iter().collect();
        sorted.sort_unstable();
        let expected: Vec<u32> = (1..=processed.inode_count).collect();
        prop_assert_eq!(sorted, expected);
    }
}
