//! # Store Operations Test
//!
//! End-to-end scenarios against the public API, with on-disk layout
//! assertions made by re-parsing the raw file through the storage types.
//! Covers:
//!
//! - Fresh-file skeleton: sizes, page kinds, meta pointers
//! - Set/get/remove round-trip laws across commits
//! - Bulk random inserts forcing a multi-level tree
//! - Freed-page recycling through the freelist
//! - Long-lived reader isolation across concurrent commits
//! - Corrupted-magic open failure
//!
//! If any test fails after making changes, it indicates a regression in
//! the commit pipeline or the page format. Do NOT weaken the expected
//! values; fix the underlying issue.

use std::collections::BTreeMap;
use std::path::Path;

use burrow::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use burrow::storage::{Meta, PageHeader, PageKind, PageRef};
use burrow::{Bytes, Db, StoreError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn open_db(dir: &tempfile::TempDir) -> Db {
    Db::open(dir.path().join("store.db")).unwrap()
}

/// Re-reads one logical page straight from the file bytes.
fn read_page(path: &Path, id: u32) -> PageRef {
    let data = std::fs::read(path).unwrap();
    let offset = id as usize * PAGE_SIZE;
    let header = PageHeader::from_bytes(&data[offset..offset + PAGE_SIZE]).unwrap();
    let span = header.span() as usize * PAGE_SIZE;
    PageRef::new(Bytes::copy_from_slice(&data[offset..offset + span])).unwrap()
}

/// Depth of the committed tree, walking leftmost children from the root.
fn tree_height(path: &Path) -> usize {
    let meta = Meta::read(&read_page(path, 0)).unwrap();
    let mut height = 1;
    let mut page = read_page(path, meta.root_page);
    while page.kind() == PageKind::Internal {
        height += 1;
        page = read_page(path, page.child_id_at(0).unwrap());
    }
    assert_eq!(page.kind(), PageKind::Leaf);
    height
}

mod fresh_file {
    use super::*;

    #[test]
    fn skeleton_is_three_pages_with_fixed_layout() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let path = db.path().to_path_buf();

        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            3 * PAGE_SIZE as u64
        );

        let meta_page = read_page(&path, 0);
        assert_eq!(meta_page.kind(), PageKind::Meta);
        let meta = Meta::read(&meta_page).unwrap();
        assert_eq!(meta.total_pages, 3);
        assert_eq!(meta.freelist_page, 1);
        assert_eq!(meta.root_page, 2);

        let freelist_page = read_page(&path, 1);
        assert_eq!(freelist_page.kind(), PageKind::Freelist);
        assert_eq!(freelist_page.count(), 0);

        let root_page = read_page(&path, 2);
        assert_eq!(root_page.kind(), PageKind::Leaf);
        assert_eq!(root_page.count(), 0);
    }

    #[test]
    fn every_page_has_exactly_one_kind_flag() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        for i in 0..300u32 {
            tx.set(format!("key{:04}", i).as_bytes(), b"some value bytes")
                .unwrap();
        }
        tx.commit().unwrap();

        let path = db.path().to_path_buf();
        let data = std::fs::read(&path).unwrap();
        let mut id = 0u32;
        while (id as usize) < data.len() / PAGE_SIZE {
            // Parsing validates the flags carry exactly one kind bit.
            let page = read_page(&path, id);
            id += page.overflow() + 1;
        }
    }
}

mod basic_ops {
    use super::*;

    #[test]
    fn set_commit_get_roundtrip() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"a", b"1").unwrap();
        tx.set(b"b", b"2").unwrap();
        tx.commit().unwrap();

        let mut reader = db.begin_read().unwrap();
        assert_eq!(reader.get(b"a").unwrap().as_deref(), Some(b"1".as_ref()));
        assert_eq!(reader.get(b"b").unwrap().as_deref(), Some(b"2".as_ref()));
        assert_eq!(reader.get(b"c").unwrap(), None);
    }

    #[test]
    fn last_write_wins_across_commits() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"k", b"v1").unwrap();
        tx.set(b"k", b"v2").unwrap();
        tx.commit().unwrap();

        let mut reader = db.begin_read().unwrap();
        assert_eq!(reader.get(b"k").unwrap().as_deref(), Some(b"v2".as_ref()));
    }

    #[test]
    fn remove_after_set_reads_as_absent() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"k", b"v").unwrap();
        tx.remove(b"k").unwrap();
        tx.commit().unwrap();

        let mut reader = db.begin_read().unwrap();
        assert_eq!(reader.get(b"k").unwrap(), None);
    }

    #[test]
    fn empty_value_roundtrips() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"empty", b"").unwrap();
        tx.commit().unwrap();

        let mut reader = db.begin_read().unwrap();
        assert_eq!(reader.get(b"empty").unwrap().as_deref(), Some(b"".as_ref()));
    }

    #[test]
    fn uncommitted_writes_are_invisible_to_readers() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"pending", b"x").unwrap();

        let mut reader = db.begin_read().unwrap();
        assert_eq!(reader.get(b"pending").unwrap(), None);

        tx.commit().unwrap();

        let mut reader = db.begin_read().unwrap();
        assert_eq!(reader.get(b"pending").unwrap().as_deref(), Some(b"x".as_ref()));
    }
}

mod bulk {
    use super::*;

    #[test]
    fn thousand_random_keys_build_a_multi_level_tree() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let mut rng = StdRng::seed_from_u64(0xB0B);

        let mut expected = BTreeMap::new();
        let mut tx = db.begin_write().unwrap();
        let mut serialized = 0usize;
        for i in 0..1000u32 {
            let key = format!("{:016x}-{:04}", rng.random::<u64>(), i);
            let value = format!("value-{:016x}", rng.random::<u64>());
            serialized += key.len() + value.len();
            tx.set(key.as_bytes(), value.as_bytes()).unwrap();
            expected.insert(key, value);
        }
        assert!(serialized > 10 * PAGE_SIZE);
        tx.commit().unwrap();

        let path = db.path().to_path_buf();
        let meta = db.meta();
        assert_eq!(read_page(&path, meta.root_page).kind(), PageKind::Internal);
        assert!(tree_height(&path) >= 2);

        let mut reader = db.begin_read().unwrap();
        for (key, value) in &expected {
            assert_eq!(
                reader.get(key.as_bytes()).unwrap().as_deref(),
                Some(value.as_bytes()),
                "lost {}",
                key
            );
        }
    }

    #[test]
    fn total_pages_never_decreases_across_commits() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);
        let mut rng = StdRng::seed_from_u64(7);

        let mut last_total = db.meta().total_pages;
        for round in 0..10u32 {
            let mut tx = db.begin_write().unwrap();
            for i in 0..100u32 {
                let key = format!("{:03}-{:08x}", i, rng.random::<u32>());
                tx.set(key.as_bytes(), b"round payload").unwrap();
            }
            tx.commit().unwrap();

            let total = db.meta().total_pages;
            assert!(
                total >= last_total,
                "total_pages shrank from {} to {} in round {}",
                last_total,
                total,
                round
            );
            last_total = total;
        }
    }

    #[test]
    fn ascending_and_descending_inserts_agree() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        for i in 0..250u32 {
            tx.set(format!("asc{:05}", i).as_bytes(), b"a").unwrap();
        }
        for i in (0..250u32).rev() {
            tx.set(format!("desc{:05}", i).as_bytes(), b"d").unwrap();
        }
        tx.commit().unwrap();

        let mut reader = db.begin_read().unwrap();
        for i in 0..250u32 {
            assert!(reader.get(format!("asc{:05}", i).as_bytes()).unwrap().is_some());
            assert!(reader.get(format!("desc{:05}", i).as_bytes()).unwrap().is_some());
        }
    }
}

mod page_recycling {
    use super::*;

    #[test]
    fn superseded_root_page_enters_the_freelist() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"k", b"v1").unwrap();
        tx.commit().unwrap();

        let page_holding_v1 = db.meta().root_page;

        let mut tx = db.begin_write().unwrap();
        tx.set(b"k", b"v2").unwrap();
        tx.commit().unwrap();

        assert!(
            db.free_pages().contains(&page_holding_v1),
            "page {} holding the superseded value is not free (freelist: {:?})",
            page_holding_v1,
            db.free_pages()
        );
    }

    #[test]
    fn steady_overwrites_do_not_grow_the_file_unboundedly() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"counter", b"0").unwrap();
        tx.commit().unwrap();
        let baseline = db.meta().total_pages;

        for i in 0..50u32 {
            let mut tx = db.begin_write().unwrap();
            tx.set(b"counter", format!("{}", i).as_bytes()).unwrap();
            tx.commit().unwrap();
        }

        assert!(db.meta().total_pages <= baseline + 4);
    }

    #[test]
    fn freelist_and_reachable_pages_partition_the_file() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        for i in 0..200u32 {
            tx.set(format!("key{:04}", i).as_bytes(), b"partition payload")
                .unwrap();
        }
        tx.commit().unwrap();
        let mut tx = db.begin_write().unwrap();
        for i in 0..100u32 {
            tx.remove(format!("key{:04}", i).as_bytes()).unwrap();
        }
        tx.commit().unwrap();

        let path = db.path().to_path_buf();
        let meta = db.meta();

        // Reachable set: meta page, freelist span, and the whole tree.
        let mut reachable = vec![0u32];
        let freelist_page = read_page(&path, meta.freelist_page);
        for i in 0..=freelist_page.overflow() {
            reachable.push(meta.freelist_page + i);
        }
        let mut stack = vec![meta.root_page];
        while let Some(id) = stack.pop() {
            let page = read_page(&path, id);
            for i in 0..=page.overflow() {
                reachable.push(id + i);
            }
            if page.kind() == PageKind::Internal {
                for i in 0..page.count() {
                    stack.push(page.child_id_at(i).unwrap());
                }
            }
        }

        let free = db.free_pages();
        for id in &reachable {
            assert!(!free.contains(id), "page {} is both reachable and free", id);
        }

        let mut all: Vec<u32> = reachable.clone();
        all.extend(&free);
        all.sort_unstable();
        all.dedup();
        assert_eq!(
            all,
            (0..meta.total_pages).collect::<Vec<_>>(),
            "reachable set and freelist must partition the file"
        );
    }
}

mod reader_isolation {
    use super::*;

    #[test]
    fn long_lived_reader_observes_pre_commit_state_throughout() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"k", b"v0").unwrap();
        tx.set(b"stable", b"s0").unwrap();
        tx.commit().unwrap();

        let mut reader = db.begin_read().unwrap();
        assert_eq!(reader.get(b"k").unwrap().as_deref(), Some(b"v0".as_ref()));

        let mut tx = db.begin_write().unwrap();
        tx.set(b"k", b"v1").unwrap();
        tx.commit().unwrap();

        assert_eq!(reader.get(b"k").unwrap().as_deref(), Some(b"v0".as_ref()));
        assert_eq!(reader.get(b"new1").unwrap(), None);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"k", b"v2").unwrap();
        tx.set(b"new1", b"n").unwrap();
        tx.commit().unwrap();

        assert_eq!(reader.get(b"k").unwrap().as_deref(), Some(b"v0".as_ref()));
        assert_eq!(reader.get(b"stable").unwrap().as_deref(), Some(b"s0".as_ref()));
        assert_eq!(reader.get(b"new1").unwrap(), None);

        let mut fresh = db.begin_read().unwrap();
        assert_eq!(fresh.get(b"k").unwrap().as_deref(), Some(b"v2".as_ref()));
        assert_eq!(fresh.get(b"new1").unwrap().as_deref(), Some(b"n".as_ref()));
    }

    #[test]
    fn reader_pins_its_meta_at_begin() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        tx.set(b"a", b"1").unwrap();
        tx.commit().unwrap();

        let reader = db.begin_read().unwrap();
        let pinned_root = db.meta().root_page;

        let mut tx = db.begin_write().unwrap();
        tx.set(b"b", b"2").unwrap();
        tx.commit().unwrap();

        assert_ne!(db.meta().root_page, pinned_root);
        drop(reader);
    }
}

mod corruption {
    use super::*;

    #[test]
    fn corrupted_magic_fails_open_with_typed_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let db = Db::open(&path).unwrap();
            let mut tx = db.begin_write().unwrap();
            tx.set(b"data", b"present").unwrap();
            tx.commit().unwrap();
        }

        let mut contents = std::fs::read(&path).unwrap();
        // The magic sits at the start of page 0's data area.
        contents[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        std::fs::write(&path, &contents).unwrap();

        let err = Db::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::MagicMismatch { .. })
        ));

        assert_eq!(
            std::fs::read(&path).unwrap(),
            contents,
            "failed open must not mutate the file"
        );
    }
}

mod structure {
    use super::*;

    #[test]
    fn mass_delete_reduces_tree_height() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        for i in 0..700u32 {
            tx.set(format!("key{:05}", i).as_bytes(), b"twenty-byte-payload!")
                .unwrap();
        }
        tx.commit().unwrap();

        let path = db.path().to_path_buf();
        let tall = tree_height(&path);
        assert!(tall >= 2);

        let mut tx = db.begin_write().unwrap();
        for i in 5..700u32 {
            assert!(tx.remove(format!("key{:05}", i).as_bytes()).unwrap().is_some());
        }
        tx.commit().unwrap();

        assert_eq!(tree_height(&path), 1);

        let mut reader = db.begin_read().unwrap();
        for i in 0..5u32 {
            assert!(reader.get(format!("key{:05}", i).as_bytes()).unwrap().is_some());
        }
        assert_eq!(reader.get(b"key00005").unwrap(), None);
    }

    #[test]
    fn internal_nodes_route_by_subtree_minimum() {
        let dir = tempdir().unwrap();
        let db = open_db(&dir);

        let mut tx = db.begin_write().unwrap();
        for i in 0..400u32 {
            tx.set(format!("route{:05}", i).as_bytes(), b"routing-check-payload")
                .unwrap();
        }
        tx.commit().unwrap();

        let path = db.path().to_path_buf();
        let meta = db.meta();
        let root = read_page(&path, meta.root_page);
        assert_eq!(root.kind(), PageKind::Internal);

        for i in 0..root.count() {
            let separator = root.key_at(i).unwrap();
            let child = read_page(&path, root.child_id_at(i).unwrap());
            assert!(child.count() > 0);
            let first_key = child.key_at(0).unwrap();
            assert!(
                separator.as_ref() <= first_key.as_ref(),
                "separator {:?} exceeds child minimum {:?}",
                separator,
                first_key
            );
            if i > 0 {
                let prev_child = read_page(&path, root.child_id_at(i - 1).unwrap());
                let prev_last = prev_child.key_at(prev_child.count() - 1).unwrap();
                assert!(
                    separator.as_ref() > prev_last.as_ref(),
                    "separator {:?} does not exceed left sibling maximum {:?}",
                    separator,
                    prev_last
                );
            }
        }
    }
}
