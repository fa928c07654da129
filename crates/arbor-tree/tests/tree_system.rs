//! End-to-end tests of the tree through its public API.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use arbor_common::{AreaId, ArborError, Key, NodeId, TreeConfig};
use arbor_storage::{AreaStore, FileAreaStore, MemoryAreaStore};
use arbor_tree::node::StoredNode;
use arbor_tree::store::{BatchNode, WriteBatch};
use arbor_tree::{AccessMode, Transaction, TreeStore, TreeSystem};

fn key(n: i64) -> Key {
    Key::new(1, 0, n)
}

fn new_system(config: TreeConfig) -> (Arc<MemoryAreaStore>, TreeSystem) {
    let areas = Arc::new(MemoryAreaStore::new());
    let system = TreeSystem::create(areas.clone(), config).unwrap();
    (areas, system)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn write_at(tx: &mut Transaction, k: Key, pos: u64, data: &[u8]) {
    let mut file = tx.get_file(k, AccessMode::ReadWrite).unwrap();
    file.set_position(pos);
    file.write(data).unwrap();
}

fn read_all(tx: &mut Transaction, k: Key) -> Vec<u8> {
    let len = tx.file_length(k).unwrap();
    let mut file = tx.get_file(k, AccessMode::Read).unwrap();
    file.read_vec(len as usize).unwrap()
}

// =========================================================================
// Round trips and scenarios
// =========================================================================

#[test]
fn test_write_read_round_trip() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let data = pattern(1000, 3);

    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &data);
    assert_eq!(read_all(&mut tx, key(1)), data);
    tx.check_integrity().unwrap();
    system.commit(tx).unwrap();

    let mut snapshot = system.create_snapshot().unwrap();
    assert_eq!(read_all(&mut snapshot, key(1)), data);
    snapshot.check_integrity().unwrap();
}

#[test]
fn test_overwrite_and_extend() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &[1; 100]);
    write_at(&mut tx, key(1), 90, &[2; 20]);

    let mut expected = vec![1; 90];
    expected.extend_from_slice(&[2; 20]);
    assert_eq!(read_all(&mut tx, key(1)), expected);
    tx.check_integrity().unwrap();
}

#[test]
fn test_shift_removes_middle() {
    let (_, system) = new_system(TreeConfig::default());
    let k = Key::new(0, 1, 100);
    let data = pattern(5000, 11);

    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, k, 0, &data);
    {
        let mut file = tx.get_file(k, AccessMode::ReadWrite).unwrap();
        file.set_position(2500);
        file.shift(-2000).unwrap();
        assert_eq!(file.length().unwrap(), 3000);
    }
    let content = read_all(&mut tx, k);
    assert_eq!(&content[..2500], &data[..2500]);
    assert_eq!(&content[2500..], &data[4500..]);
    system.commit(tx).unwrap();

    let mut snapshot = system.create_snapshot().unwrap();
    assert_eq!(read_all(&mut snapshot, k), content);
}

#[test]
fn test_shift_inserts_zeros() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &[7; 50]);
    {
        let mut file = tx.get_file(key(1), AccessMode::ReadWrite).unwrap();
        file.set_position(20);
        file.shift(300).unwrap();
    }
    let content = read_all(&mut tx, key(1));
    assert_eq!(content.len(), 350);
    assert!(content[..20].iter().all(|&b| b == 7));
    assert!(content[20..320].iter().all(|&b| b == 0));
    assert!(content[320..].iter().all(|&b| b == 7));
    tx.check_integrity().unwrap();
}

#[test]
fn test_delete_neighbour_keeps_other_key() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let (k1, k2) = (key(1), key(2));
    let first = pattern(10_000, 1);
    let second = pattern(10_000, 2);

    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, k1, 0, &first);
    write_at(&mut tx, k2, 0, &second);
    system.commit(tx).unwrap();

    let mut tx = system.create_transaction().unwrap();
    tx.get_file(k1, AccessMode::ReadWrite).unwrap().delete().unwrap();
    assert!(!tx.file_exists(k1).unwrap());
    assert_eq!(tx.file_length(k2).unwrap(), 10_000);
    assert_eq!(read_all(&mut tx, k2), second);
    tx.check_integrity().unwrap();
    system.commit(tx).unwrap();

    let mut snapshot = system.create_snapshot().unwrap();
    assert_eq!(read_all(&mut snapshot, k2), second);
    snapshot.check_integrity().unwrap();
}

#[test]
fn test_set_length_reads_zeros() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &[9; 10]);
    tx.get_file(key(1), AccessMode::ReadWrite).unwrap().set_length(1000).unwrap();

    let content = read_all(&mut tx, key(1));
    assert_eq!(content.len(), 1000);
    assert!(content[..10].iter().all(|&b| b == 9));
    assert!(content[10..].iter().all(|&b| b == 0));

    // Explicit zeros and sparse growth read the same.
    write_at(&mut tx, key(2), 0, &vec![0; 1000]);
    assert_eq!(read_all(&mut tx, key(2))[10..], content[10..]);

    tx.get_file(key(1), AccessMode::ReadWrite).unwrap().set_length(5).unwrap();
    assert_eq!(read_all(&mut tx, key(1)), vec![9; 5]);
    tx.check_integrity().unwrap();
    system.commit(tx).unwrap();
}

#[test]
fn test_key_isolation() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &pattern(300, 1));
    write_at(&mut tx, key(3), 0, &pattern(300, 3));

    write_at(&mut tx, key(2), 0, &pattern(500, 2));
    tx.get_file(key(2), AccessMode::ReadWrite).unwrap().set_length(20).unwrap();
    {
        let mut file = tx.get_file(key(2), AccessMode::ReadWrite).unwrap();
        file.set_position(0);
        file.shift(200).unwrap();
    }

    assert_eq!(read_all(&mut tx, key(1)), pattern(300, 1));
    assert_eq!(read_all(&mut tx, key(3)), pattern(300, 3));
    assert_eq!(tx.file_length(key(2)).unwrap(), 220);
    tx.check_integrity().unwrap();
}

// =========================================================================
// Errors
// =========================================================================

#[test]
fn test_out_of_bounds() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &[1; 10]);

    let mut file = tx.get_file(key(1), AccessMode::ReadWrite).unwrap();
    file.set_position(8);
    let mut buf = [0; 4];
    assert!(matches!(file.read(&mut buf), Err(ArborError::OutOfBounds { .. })));
    file.set_position(11);
    assert!(matches!(file.write(&[1]), Err(ArborError::OutOfBounds { .. })));
    file.set_position(5);
    assert!(matches!(file.shift(-6), Err(ArborError::OutOfBounds { .. })));
    drop(file);

    assert!(!system.is_poisoned());
    assert_eq!(read_all(&mut tx, key(1)), vec![1; 10]);
}

#[test]
fn test_read_only_violations() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut snapshot = system.create_snapshot().unwrap();
    assert!(matches!(
        snapshot.get_file(key(1), AccessMode::ReadWrite),
        Err(ArborError::ReadOnly { .. })
    ));

    let mut tx = system.create_transaction().unwrap();
    let mut file = tx.get_file(key(1), AccessMode::Read).unwrap();
    assert!(matches!(file.write(b"x"), Err(ArborError::ReadOnly { .. })));
    drop(file);
    assert!(!system.is_poisoned());
}

#[test]
fn test_copy_to_needs_writable_file() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, b"abcdef");

    let mut file = tx.get_file(key(1), AccessMode::Read).unwrap();
    assert!(matches!(file.copy_to(key(2), 0, 3), Err(ArborError::ReadOnly { .. })));
    drop(file);
    assert!(!tx.file_exists(key(2)).unwrap());

    let mut file = tx.get_file(key(1), AccessMode::ReadWrite).unwrap();
    file.copy_to(key(2), 0, 3).unwrap();
    drop(file);
    assert_eq!(read_all(&mut tx, key(2)), b"abc".to_vec());
}

#[test]
fn test_huge_offsets_are_out_of_bounds() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, b"abcdef");

    let mut file = tx.get_file(key(1), AccessMode::ReadWrite).unwrap();
    file.set_position(u64::MAX);
    assert!(matches!(file.read_vec(1), Err(ArborError::OutOfBounds { .. })));
    assert!(matches!(file.write(b"x"), Err(ArborError::OutOfBounds { .. })));
    file.set_position(2);
    assert!(matches!(file.shift(i64::MIN), Err(ArborError::OutOfBounds { .. })));
    assert!(matches!(file.copy_to(key(2), 0, u64::MAX), Err(ArborError::OutOfBounds { .. })));
    assert!(matches!(file.set_length(u64::MAX), Err(ArborError::OutOfBounds { .. })));
    drop(file);

    assert!(matches!(
        tx.copy_data(key(1), 2, key(2), 0, u64::MAX),
        Err(ArborError::OutOfBounds { .. })
    ));
    assert!(matches!(
        tx.copy_data(key(1), u64::MAX, key(2), 0, 1),
        Err(ArborError::OutOfBounds { .. })
    ));
    assert!(!system.is_poisoned());
    assert_eq!(read_all(&mut tx, key(1)), b"abcdef".to_vec());
    assert!(!tx.file_exists(key(2)).unwrap());
    tx.check_integrity().unwrap();
}

#[test]
fn test_reserved_keys_rejected() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    assert!(matches!(
        tx.get_file(Key::TAIL, AccessMode::Read),
        Err(ArborError::ReservedKey { .. })
    ));
    assert!(matches!(
        tx.get_file(Key::HEAD, AccessMode::Read),
        Err(ArborError::ReservedKey { .. })
    ));
    assert!(matches!(
        tx.get_file(Key::new(0x7F80, 0, 0), AccessMode::Read),
        Err(ArborError::ReservedKey { .. })
    ));
    assert!(tx.get_range(Key::HEAD, Key::TAIL).is_ok());
}

#[test]
fn test_commit_out_of_sequence() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut first = system.create_transaction().unwrap();
    let mut second = system.create_transaction().unwrap();
    write_at(&mut first, key(1), 0, b"first");
    write_at(&mut second, key(1), 0, b"second");

    system.commit(first).unwrap();
    assert!(matches!(
        system.commit(second),
        Err(ArborError::VersionOutOfSequence { .. })
    ));
    assert!(!system.is_poisoned());
    assert_eq!(system.version_count(), 1);
}

#[test]
fn test_write_failure_poisons_store() {
    let (areas, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &[1; 200]);

    areas.fail_writes(true);
    assert!(matches!(system.commit(tx), Err(ArborError::Io { .. })));
    assert!(system.is_poisoned());

    areas.fail_writes(false);
    assert!(matches!(
        system.create_transaction(),
        Err(ArborError::Poisoned { .. })
    ));
    assert!(matches!(system.checkpoint(), Err(ArborError::Poisoned { .. })));
}

// =========================================================================
// Versions
// =========================================================================

#[test]
fn test_versions_are_monotonic() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let v0 = system.tip_version().unwrap();

    let mut pins = Vec::new();
    for i in 0..5 {
        pins.push(system.create_snapshot().unwrap());
        let mut tx = system.create_transaction().unwrap();
        write_at(&mut tx, key(i), 0, &pattern(100, i as u8));
        let version = system.commit(tx).unwrap();
        assert_eq!(version.as_u64(), v0.as_u64() + i as u64 + 1);
    }

    let versions = system.versions();
    assert_eq!(versions.len(), 6);
    for pair in versions.windows(2) {
        assert_eq!(pair[1].id, pair[0].id.next());
        assert_ne!(pair[1].root, pair[0].root);
    }

    for pin in pins {
        system.dispose(pin).unwrap();
    }
    assert_eq!(system.version_count(), 1);
}

#[test]
fn test_empty_commit_keeps_root() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let tx = system.create_transaction().unwrap();
    let before = system.versions()[0].root;
    system.commit(tx).unwrap();
    assert_eq!(system.versions().last().unwrap().root, before);
}

#[test]
fn test_snapshot_isolation() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &[1; 300]);
    system.commit(tx).unwrap();

    let mut snapshot = system.create_snapshot().unwrap();

    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 100, &[2; 300]);
    write_at(&mut tx, key(2), 0, &[3; 50]);
    system.commit(tx).unwrap();

    assert_eq!(read_all(&mut snapshot, key(1)), vec![1; 300]);
    assert!(!snapshot.file_exists(key(2)).unwrap());
    assert_eq!(system.version_count(), 2);

    let base = snapshot.version();
    assert_eq!(system.commit(snapshot).unwrap(), base);
    assert_eq!(system.version_count(), 1);
}

#[test]
fn test_rollback_discards_changes() {
    let (areas, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &[1; 100]);
    system.commit(tx).unwrap();
    let areas_before = areas.area_count();

    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &[9; 500]);
    system.dispose(tx).unwrap();

    {
        let mut tx = system.create_transaction().unwrap();
        tx.get_file(key(1), AccessMode::ReadWrite).unwrap().delete().unwrap();
        // Dropped without commit.
    }

    let mut snapshot = system.create_snapshot().unwrap();
    assert_eq!(read_all(&mut snapshot, key(1)), vec![1; 100]);
    drop(snapshot);
    assert_eq!(areas.area_count(), areas_before);
}

#[test]
fn test_heap_flush_and_rollback_reclaims_areas() {
    let config = TreeConfig::for_testing().with_heap_memory_budget(4 * 1024);
    let (areas, system) = new_system(config);
    let baseline = areas.area_count();

    let mut tx = system.create_transaction().unwrap();
    for i in 0..40 {
        write_at(&mut tx, key(i), 0, &pattern(256, i as u8));
    }
    assert!(system.stats().unwrap().heap_flushes > 0);
    for i in 0..40 {
        assert_eq!(read_all(&mut tx, key(i)), pattern(256, i as u8));
    }
    tx.check_integrity().unwrap();
    system.dispose(tx).unwrap();
    assert_eq!(areas.area_count(), baseline);
}

#[test]
fn test_heap_flush_then_commit() {
    let config = TreeConfig::for_testing().with_heap_memory_budget(4 * 1024);
    let (_, system) = new_system(config);

    let mut tx = system.create_transaction().unwrap();
    for i in 0..40 {
        write_at(&mut tx, key(i), 0, &pattern(200, i as u8));
    }
    for i in (0..40).step_by(3) {
        write_at(&mut tx, key(i), 50, &[0xEE; 20]);
    }
    system.commit(tx).unwrap();

    let mut snapshot = system.create_snapshot().unwrap();
    for i in 0..40 {
        let mut expected = pattern(200, i as u8);
        if i % 3 == 0 {
            expected[50..70].fill(0xEE);
        }
        assert_eq!(read_all(&mut snapshot, key(i)), expected);
    }
    snapshot.check_integrity().unwrap();

    let cache = system.stats().unwrap().branch_cache;
    assert!(cache.hits > 0);
    assert!(cache.hit_ratio() > 0.0);
}

// =========================================================================
// Reference counting and copies
// =========================================================================

#[test]
fn test_leaf_reference_counting() {
    let (areas, system) = new_system(TreeConfig::for_testing());
    let store = system.store();
    let mut batch = WriteBatch::new();
    batch.push(BatchNode::Leaf(bytes::Bytes::from_static(b"shared")));
    let area = store.persist(&batch).unwrap()[0];

    const LINKS: u32 = 4;
    for _ in 0..LINKS {
        store.link_leaf(area).unwrap();
    }
    assert_eq!(store.leaf_ref_count(area).unwrap(), LINKS + 1);
    for _ in 0..LINKS {
        store.dispose_node(arbor_common::NodeId::Stored(area)).unwrap();
        assert!(areas.contains(area));
    }
    store.dispose_node(arbor_common::NodeId::Stored(area)).unwrap();
    assert!(!areas.contains(area));
}

#[test]
fn test_copy_data_shares_stored_leaves() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let source = pattern(640, 5);

    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(1), 0, &source);
    system.commit(tx).unwrap();

    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(2), 0, b"head-tail");
    tx.copy_data(key(1), 0, key(2), 4, 640).unwrap();
    {
        let mut file = tx.get_file(key(1), AccessMode::Read).unwrap();
        file.set_position(10);
        file.copy_to(key(3), 0, 100).unwrap();
    }

    let mut expected = b"head".to_vec();
    expected.extend_from_slice(&source);
    expected.extend_from_slice(b"-tail");
    assert_eq!(read_all(&mut tx, key(2)), expected);
    assert_eq!(read_all(&mut tx, key(3)), source[10..110].to_vec());
    tx.check_integrity().unwrap();
    system.commit(tx).unwrap();

    // Changing the copy leaves the source alone.
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(2), 4, &[0; 64]);
    system.commit(tx).unwrap();

    let mut snapshot = system.create_snapshot().unwrap();
    assert_eq!(read_all(&mut snapshot, key(1)), source);
    snapshot.check_integrity().unwrap();
}

// =========================================================================
// Ranges
// =========================================================================

#[test]
fn test_range_queries_and_delete() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    for i in 1..=6 {
        write_at(&mut tx, key(i), 0, &pattern(100 * i as usize, i as u8));
    }

    {
        let mut all = tx.get_range(Key::HEAD, Key::TAIL).unwrap();
        assert_eq!(all.key_count().unwrap(), 6);
        assert_eq!(all.size().unwrap(), 2100);
        assert_eq!(all.first_key().unwrap(), Some(key(1)));
        assert_eq!(all.last_key().unwrap(), Some(key(6)));
    }
    {
        let mut middle = tx.get_range(key(2), key(4)).unwrap();
        assert_eq!(middle.keys().unwrap(), vec![key(2), key(3), key(4)]);
        middle.delete().unwrap();
    }
    let mut all = tx.get_range(Key::HEAD, Key::TAIL).unwrap();
    assert_eq!(all.keys().unwrap(), vec![key(1), key(5), key(6)]);
    drop(all);
    assert_eq!(read_all(&mut tx, key(5)), pattern(500, 5));
    tx.check_integrity().unwrap();

    let mut empty = tx.get_range(key(2), key(4)).unwrap();
    assert_eq!(empty.first_key().unwrap(), None);
    assert_eq!(empty.size().unwrap(), 0);
}

#[test]
fn test_replicate_range() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut tx = system.create_transaction().unwrap();
    for i in 1..=3 {
        write_at(&mut tx, key(i), 0, &pattern(200, i as u8));
    }
    system.commit(tx).unwrap();

    let mut snapshot = system.create_snapshot().unwrap();
    let mut tx = system.create_transaction().unwrap();
    write_at(&mut tx, key(2), 0, &[0xAA; 500]);
    write_at(&mut tx, key(4), 0, &[0xBB; 10]);

    let copied = snapshot
        .get_range(key(1), key(3))
        .unwrap()
        .replicate_to(&mut tx)
        .unwrap();
    assert_eq!(copied, 3);
    assert_eq!(read_all(&mut tx, key(2)), pattern(200, 2));
    assert_eq!(read_all(&mut tx, key(4)), vec![0xBB; 10]);
    tx.check_integrity().unwrap();
    system.dispose(snapshot).unwrap();
    system.commit(tx).unwrap();
}

// =========================================================================
// Model check and scale
// =========================================================================

#[test]
fn test_random_operations_match_model() {
    let (_, system) = new_system(TreeConfig::for_testing());
    let mut rng = StdRng::seed_from_u64(0xA4B0);
    let keys = [key(10), key(20), key(30)];
    let mut model: Vec<Vec<u8>> = vec![Vec::new(); keys.len()];

    let mut tx = system.create_transaction().unwrap();
    for step in 0..600 {
        let k = rng.gen_range(0..keys.len());
        let len = model[k].len() as u64;
        let mut file = tx.get_file(keys[k], AccessMode::ReadWrite).unwrap();
        match rng.gen_range(0..6) {
            0 | 1 => {
                let pos = rng.gen_range(0..=len);
                let data: Vec<u8> = (0..rng.gen_range(1..300)).map(|_| rng.gen()).collect();
                file.set_position(pos);
                file.write(&data).unwrap();
                let pos = pos as usize;
                let end = (pos + data.len()).min(model[k].len());
                model[k].splice(pos..end, data);
            }
            2 => {
                let new_len = rng.gen_range(0..len + 200);
                file.set_length(new_len).unwrap();
                model[k].resize(new_len as usize, 0);
            }
            3 => {
                let pos = rng.gen_range(0..=len);
                let delta = rng.gen_range(1..700);
                file.set_position(pos);
                file.shift(delta).unwrap();
                let pos = pos as usize;
                model[k].splice(pos..pos, std::iter::repeat(0).take(delta as usize));
            }
            4 if len > 0 => {
                let pos = rng.gen_range(0..len);
                let count = rng.gen_range(1..=len - pos);
                file.set_position(pos);
                file.shift(-(count as i64)).unwrap();
                model[k].drain(pos as usize..(pos + count) as usize);
            }
            _ => {
                drop(file);
                let src = rng.gen_range(0..keys.len());
                let src_len = model[src].len() as u64;
                if src_len > 0 {
                    let src_pos = rng.gen_range(0..src_len);
                    let count = rng.gen_range(1..=src_len - src_pos);
                    let dst_pos = rng.gen_range(0..=len);
                    tx.copy_data(keys[src], src_pos, keys[k], dst_pos, count).unwrap();
                    let copied: Vec<u8> = model[src][src_pos as usize..(src_pos + count) as usize].to_vec();
                    let at = dst_pos as usize;
                    model[k].splice(at..at, copied);
                }
            }
        }

        if step % 25 == 0 {
            tx.check_integrity().unwrap();
            for (i, &k) in keys.iter().enumerate() {
                assert_eq!(read_all(&mut tx, k), model[i], "key {i} at step {step}");
            }
        }
        if step % 100 == 99 {
            system.commit(tx).unwrap();
            tx = system.create_transaction().unwrap();
        }
    }

    tx.check_integrity().unwrap();
    for (i, &k) in keys.iter().enumerate() {
        assert_eq!(read_all(&mut tx, k), model[i]);
    }
    system.commit(tx).unwrap();
}

/// Adds every stored area below `node` to `seen`.
fn reachable_areas(store: &TreeStore, node: NodeId, seen: &mut HashSet<AreaId>) {
    let NodeId::Stored(area) = node else {
        return;
    };
    if !seen.insert(area) {
        return;
    }
    if let StoredNode::Branch(branch) = store.fetch_node(area).unwrap() {
        for &child in branch.children() {
            reachable_areas(store, child, seen);
        }
    }
}

/// Counts the branch slots pointing at each stored leaf below `node`.
fn leaf_references(store: &TreeStore, node: NodeId, refs: &mut HashMap<AreaId, u32>) {
    let NodeId::Stored(area) = node else {
        return;
    };
    match store.fetch_node(area).unwrap() {
        StoredNode::Branch(branch) => {
            for &child in branch.children() {
                leaf_references(store, child, refs);
            }
        }
        StoredNode::Leaf(_) => *refs.entry(area).or_default() += 1,
    }
}

/// With no write transaction open, the store holds the header, the version
/// list, one record per version and the nodes those versions reach.
fn assert_areas_accounted(system: &TreeSystem, areas: &MemoryAreaStore) {
    let store = system.store();
    let versions = system.versions();
    let mut seen = HashSet::new();
    for version in &versions {
        reachable_areas(store, version.root, &mut seen);
    }
    assert_eq!(areas.area_count(), seen.len() + 2 + versions.len());

    if let [tip] = versions.as_slice() {
        let mut refs = HashMap::new();
        leaf_references(store, tip.root, &mut refs);
        for (area, count) in refs {
            assert_eq!(store.leaf_ref_count(area).unwrap(), count, "leaf {area}");
        }
    }
}

#[test]
fn test_random_operations_under_memory_pressure() {
    let config = TreeConfig::for_testing().with_heap_memory_budget(2 * 1024);
    let threshold = config.bulk_delete_threshold;
    let (areas, system) = new_system(config);
    let mut rng = StdRng::seed_from_u64(0x6C0D);
    let keys: Vec<Key> = (0..24).map(|i| key(i * 10)).collect();
    let mut committed: Vec<Vec<u8>> = vec![Vec::new(); keys.len()];
    let mut snapshots: Vec<(Transaction, Vec<Vec<u8>>)> = Vec::new();
    let mut bulk_removals = 0;

    for round in 0..40 {
        let mut model = committed.clone();
        let mut tx = system.create_transaction().unwrap();
        for _ in 0..30 {
            let k = rng.gen_range(0..keys.len());
            let len = model[k].len() as u64;
            match rng.gen_range(0..7) {
                0 | 1 => {
                    let pos = rng.gen_range(0..=len);
                    let data: Vec<u8> = (0..rng.gen_range(1..800)).map(|_| rng.gen()).collect();
                    write_at(&mut tx, keys[k], pos, &data);
                    let pos = pos as usize;
                    let end = (pos + data.len()).min(model[k].len());
                    model[k].splice(pos..end, data);
                }
                2 => {
                    let pos = rng.gen_range(0..=len);
                    let delta = rng.gen_range(1..1200);
                    let mut file = tx.get_file(keys[k], AccessMode::ReadWrite).unwrap();
                    file.set_position(pos);
                    file.shift(delta).unwrap();
                    let pos = pos as usize;
                    model[k].splice(pos..pos, std::iter::repeat(0).take(delta as usize));
                }
                3 if len > 0 => {
                    let pos = rng.gen_range(0..len);
                    let count = rng.gen_range(1..=len - pos);
                    if count > threshold {
                        bulk_removals += 1;
                    }
                    let mut file = tx.get_file(keys[k], AccessMode::ReadWrite).unwrap();
                    file.set_position(pos);
                    file.shift(-(count as i64)).unwrap();
                    model[k].drain(pos as usize..(pos + count) as usize);
                }
                4 => {
                    let src = rng.gen_range(0..keys.len());
                    let src_len = model[src].len() as u64;
                    if src_len > 0 {
                        let src_pos = rng.gen_range(0..src_len);
                        let count = rng.gen_range(1..=(src_len - src_pos).min(2000));
                        let dst_pos = rng.gen_range(0..=len);
                        tx.copy_data(keys[src], src_pos, keys[k], dst_pos, count).unwrap();
                        let copied = model[src][src_pos as usize..(src_pos + count) as usize].to_vec();
                        let at = dst_pos as usize;
                        model[k].splice(at..at, copied);
                    }
                }
                5 => {
                    let last = (k + rng.gen_range(0..3)).min(keys.len() - 1);
                    if model[k..=last].iter().map(Vec::len).sum::<usize>() as u64 > threshold {
                        bulk_removals += 1;
                    }
                    tx.get_range(keys[k], keys[last]).unwrap().delete().unwrap();
                    for file in &mut model[k..=last] {
                        file.clear();
                    }
                }
                _ => {
                    let new_len = rng.gen_range(0..len + 600);
                    tx.get_file(keys[k], AccessMode::ReadWrite)
                        .unwrap()
                        .set_length(new_len)
                        .unwrap();
                    model[k].resize(new_len as usize, 0);
                }
            }
        }

        tx.check_integrity().unwrap();
        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(read_all(&mut tx, k), model[i], "key {i} in round {round}");
        }
        if rng.gen_bool(0.75) {
            system.commit(tx).unwrap();
            committed = model;
        } else {
            system.dispose(tx).unwrap();
        }
        assert_areas_accounted(&system, &areas);

        if rng.gen_bool(0.3) {
            snapshots.push((system.create_snapshot().unwrap(), committed.clone()));
        }
        if snapshots.len() > 3 || (!snapshots.is_empty() && rng.gen_bool(0.2)) {
            let at = rng.gen_range(0..snapshots.len());
            let (mut snapshot, expected) = snapshots.remove(at);
            for (i, &k) in keys.iter().enumerate() {
                assert_eq!(read_all(&mut snapshot, k), expected[i], "snapshot key {i}");
            }
            system.dispose(snapshot).unwrap();
            assert_areas_accounted(&system, &areas);
        }
    }

    for (snapshot, _) in snapshots.drain(..) {
        system.dispose(snapshot).unwrap();
    }
    assert_eq!(system.version_count(), 1);
    assert_areas_accounted(&system, &areas);
    assert!(system.stats().unwrap().heap_flushes > 0);
    assert!(bulk_removals > 0);
}

#[test]
fn test_deep_tree() {
    let handle = std::thread::Builder::new()
        .stack_size(512 * 1024)
        .spawn(|| {
            let config = TreeConfig::for_testing().with_max_leaf_byte_size(4);
            let (_, system) = new_system(config);
            let mut tx = system.create_transaction().unwrap();

            let chunk = pattern(4096, 1);
            let mut written = Vec::new();
            while tx.tree_height().unwrap() < 10 {
                assert!(written.len() < 64 * chunk.len(), "tree stopped growing");
                write_at(&mut tx, key(1), written.len() as u64, &chunk);
                written.extend_from_slice(&chunk);
            }
            tx.check_integrity().unwrap();
            system.commit(tx).unwrap();

            let mut snapshot = system.create_snapshot().unwrap();
            snapshot.check_integrity().unwrap();
            assert_eq!(read_all(&mut snapshot, key(1)), written);
            drop(snapshot);

            let mut tx = system.create_transaction().unwrap();
            tx.get_file(key(1), AccessMode::ReadWrite).unwrap().delete().unwrap();
            tx.check_integrity().unwrap();
            system.commit(tx).unwrap();
            assert_eq!(system.create_snapshot().unwrap().tree_height().unwrap(), 2);
        })
        .unwrap();
    handle.join().unwrap();
}

#[test]
fn test_file_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(3000, 8);
    {
        let areas = Arc::new(FileAreaStore::open_dir(dir.path()).unwrap());
        let system = TreeSystem::create(areas, TreeConfig::for_testing()).unwrap();
        let mut tx = system.create_transaction().unwrap();
        write_at(&mut tx, key(1), 0, &data);
        system.commit(tx).unwrap();

        let mut tx = system.create_transaction().unwrap();
        write_at(&mut tx, key(2), 0, b"second");
        system.commit(tx).unwrap();
        system.checkpoint().unwrap();
    }

    let areas = Arc::new(FileAreaStore::open_dir(dir.path()).unwrap());
    let system = TreeSystem::open(areas, TreeConfig::for_testing()).unwrap();
    assert_eq!(system.tip_version().unwrap().as_u64(), 2);
    assert_eq!(system.version_count(), 1);

    let mut snapshot = system.create_snapshot().unwrap();
    assert_eq!(read_all(&mut snapshot, key(1)), data);
    assert_eq!(read_all(&mut snapshot, key(2)), b"second".to_vec());
    snapshot.check_integrity().unwrap();
}
