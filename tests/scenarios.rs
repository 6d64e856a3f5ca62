//! End-to-end coverage driven against the public `Store`/`HatTrie`/`Bitmap`
//! surface, each named after the concrete I/O sequence it exercises.

use qps::consistency;
use qps::hat::{HatTrie, ValueWidth};
use qps::bitmap::Bitmap;
use qps::Store;

fn open_store(dir: &tempfile::TempDir) -> Store {
    let _ = env_logger::builder().is_test(true).try_init();
    Store::create(dir.path(), "scenarios", b"").expect("create store")
}

/// Scenario A: a non-nullable 32-bit-value trie treats the zero value as a
/// synonym for absence, so `set(7)=0` removes key 7 from the map entirely —
/// `get(7)` and enumeration both behave as if it had never been set.
#[test]
fn scenario_a_non_nullable_zero_is_absence() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let trie = HatTrie::create(&store, 4, false).unwrap();

    trie.set(7, &100u32.to_le_bytes()).unwrap();
    trie.set(1, &7u32.to_le_bytes()).unwrap();
    trie.set(7, &0u32.to_le_bytes()).unwrap();

    assert_eq!(trie.get(7).unwrap(), None);
    assert_eq!(trie.get(1).unwrap(), Some(7u32.to_le_bytes().to_vec()));

    let mut seen = Vec::new();
    let mut it = trie.enumerate_from(0);
    while let Some((k, v)) = it.next().unwrap() {
        seen.push((k, v));
    }
    assert_eq!(seen, vec![(1, 7u32.to_le_bytes().to_vec())]);
}

/// Scenario B: a nullable 8-bit-value trie keeps "set to zero" and "absent"
/// distinct, since a companion presence bitmap tracks explicit set-ness
/// independently of the stored bytes.
#[test]
fn scenario_b_nullable_zero_is_present() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let trie = HatTrie::create(&store, 1, true).unwrap();

    trie.set(42, &[0]).unwrap();
    assert!(!trie.is_null(42).unwrap());
    assert_eq!(trie.get(42).unwrap(), Some(vec![0]));

    trie.set(42, &[5]).unwrap();
    assert_eq!(trie.get(42).unwrap(), Some(vec![5]));

    trie.remove(42).unwrap();
    assert!(trie.is_null(42).unwrap());
}

/// Scenario C: a non-nullable bitmap enumeration started mid-stream keeps
/// producing keys in order across the 1024-key leaf boundary even as more
/// keys are set after the enumerator has already started.
#[test]
fn scenario_c_bitmap_enumeration_across_leaf_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let bitmap = Bitmap::create(&store, false).unwrap();

    for k in 1..99u32 {
        bitmap.set(k, true).unwrap();
    }

    let mut it = bitmap.enumerate_from(80);

    for k in 100..1025u32 {
        bitmap.set(k, true).unwrap();
    }

    let mut visited = Vec::new();
    while let Some((k, v)) = it.next().unwrap() {
        assert!(v);
        visited.push(k);
    }

    let expected: Vec<u32> = (80..99).chain(100..1025).collect();
    assert_eq!(visited, expected);
}

/// Scenario D: a trie survives a snapshot, a close, and a reopen with every
/// entry intact.
#[test]
fn scenario_d_snapshot_reopen_preserves_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();

    const N: u32 = 10_000;
    // A multiplicative hash that is a bijection on u32 (the constant is odd,
    // hence coprime to 2^32), used to get a spread of "random" keys from a
    // dense counter without pulling in a random-number crate.
    let key_of = |i: u32| i.wrapping_mul(2_654_435_761);
    let value_of = |i: u32| (i + 1).to_le_bytes();

    let root = {
        let store = Store::create(&path, "scenarios-d", b"").unwrap();
        let trie = HatTrie::create(&store, 4, false).unwrap();
        for i in 0..N {
            trie.set(key_of(i), &value_of(i)).unwrap();
        }
        let root = trie.root();
        store.snapshot().unwrap();
        assert!(store.snapshot_wait().unwrap());
        store.close().unwrap();
        root
    };

    let (store, _preamble) = Store::open(&path).unwrap();
    let trie = HatTrie::open(&store, root).unwrap();
    assert_eq!(trie.compute_counts().unwrap(), N as u64);
    for i in 0..N {
        assert_eq!(trie.get(key_of(i)).unwrap(), Some(value_of(i).to_vec()));
    }
}

/// Scenario E: a leaf node that flattens under enough dense inserts shrinks
/// back to a compact array once enough of its entries are removed, rather
/// than permanently paying for a `QHAT_COUNT`-wide dense array.
#[test]
fn scenario_e_flatten_then_unflatten() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let trie = HatTrie::create(&store, 8, false).unwrap();

    let threshold = ValueWidth::W8.split_compact_threshold();
    for k in 1..=threshold {
        trie.set(k, &(k as u64).to_le_bytes()).unwrap();
        trie.check_consistency().unwrap();
    }
    let compact_memory = trie.compute_memory().unwrap();

    // One more entry tips this leaf node over the threshold and flattens it.
    trie.set(threshold + 1, &((threshold + 1) as u64).to_le_bytes()).unwrap();
    trie.check_consistency().unwrap();
    let flat_memory = trie.compute_memory().unwrap();
    assert!(flat_memory > compact_memory, "flattening should grow the node's footprint");

    // Remove down to a handful of entries, comfortably below the unflatten
    // hysteresis line (half the flatten threshold).
    for k in (6..=(threshold + 1)).rev() {
        trie.remove(k).unwrap();
        trie.check_consistency().unwrap();
    }

    let shrunk_memory = trie.compute_memory().unwrap();
    assert!(
        shrunk_memory < flat_memory,
        "a mostly-empty flat node should unflatten back down"
    );

    for k in 1..=5 {
        assert_eq!(trie.get(k).unwrap(), Some((k as u64).to_le_bytes().to_vec()));
    }
    for k in 6..=(threshold + 1) {
        assert_eq!(trie.get(k).unwrap(), None);
    }
}

fn map_file_names(dir: &std::path::Path) -> std::collections::BTreeSet<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("pg.") || n.starts_with("mem."))
        .collect()
}

fn read_header(dir: &std::path::Path, file_name: &str) -> Vec<u8> {
    use std::io::Read;
    let mut buf = vec![0u8; 64];
    let mut f = std::fs::File::open(dir.join(file_name)).unwrap();
    f.read_exact(&mut buf).unwrap();
    buf
}

/// Scenario F: a write reaching a map that a snapshot just froze forks that
/// map onto a brand new sibling file at the next generation rather than
/// mutating the frozen one in place, and that fork is not itself durable
/// until a later snapshot commits a catalogue that references it.
#[test]
fn scenario_f_write_after_snapshot_forks_instead_of_mutating_frozen_map() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();

    let root = {
        let store = Store::create(&path, "scenarios-f", b"").unwrap();
        let trie = HatTrie::create(&store, 4, false).unwrap();
        trie.set(1, &10u32.to_le_bytes()).unwrap();

        store.snapshot().unwrap();
        assert!(store.snapshot_wait().unwrap());

        let frozen_files = map_file_names(&path);
        let frozen_headers: Vec<(String, Vec<u8>)> = frozen_files
            .iter()
            .map(|name| (name.clone(), read_header(&path, name)))
            .collect();

        // Written after the snapshot committed: reaches at least one frozen
        // map, which must fork onto a new sibling rather than mutate in
        // place. The live trie sees the new value immediately.
        trie.set(1, &20u32.to_le_bytes()).unwrap();
        assert_eq!(trie.get(1).unwrap(), Some(20u32.to_le_bytes().to_vec()));

        let post_write_files = map_file_names(&path);
        assert!(
            frozen_files.is_subset(&post_write_files),
            "every file frozen by the snapshot must still be present after the write"
        );
        assert!(
            post_write_files.len() > frozen_files.len(),
            "a write to a frozen map must fork a new sibling file, not mutate in place"
        );
        for (name, before) in &frozen_headers {
            assert_eq!(
                &read_header(&path, name),
                before,
                "a frozen map's on-disk header must be untouched by a write that forked it"
            );
        }

        let root = trie.root();
        store.close().unwrap();
        root
    };

    // The fork above was never committed by a snapshot, so a reopen still
    // sees exactly the state as of the one commit that did happen.
    let (store, _preamble) = Store::open(&path).unwrap();
    let trie = HatTrie::open(&store, root).unwrap();
    assert_eq!(trie.get(1).unwrap(), Some(10u32.to_le_bytes().to_vec()));
}

/// Testable property 1/2: round-trip and idempotence. Enumerating after an
/// arbitrary sequence of sets and removes yields exactly the present keys in
/// order, and re-`set`-ting an already-present key to the same value doesn't
/// change the entry count.
#[test]
fn property_round_trip_and_idempotence() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let trie = HatTrie::create(&store, 4, false).unwrap();

    let keys = [5u32, 1, 2049, 2050, 17, 2049];
    for &k in &keys {
        trie.set(k, &(k + 1).to_le_bytes()).unwrap();
    }
    trie.remove(17).unwrap();

    let before = trie.compute_counts().unwrap();
    trie.set(1, &2u32.to_le_bytes()).unwrap();
    assert_eq!(trie.compute_counts().unwrap(), before);
    assert_eq!(trie.get(1).unwrap(), Some(2u32.to_le_bytes().to_vec()));

    let mut expected: Vec<u32> = vec![5, 1, 2049, 2050];
    expected.sort_unstable();
    expected.dedup();

    let mut seen = Vec::new();
    let mut it = trie.enumerate_from(0);
    while let Some((k, _)) = it.next().unwrap() {
        seen.push(k);
    }
    assert_eq!(seen, expected);
}

/// Testable property 4: an enumerator started before a burst of interleaved
/// inserts/removes still produces strictly ascending keys with no repeats.
#[test]
fn property_enumerator_safety_under_interleaved_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let trie = HatTrie::create(&store, 4, false).unwrap();

    for k in (0..200u32).step_by(2) {
        trie.set(k, &(k + 1).to_le_bytes()).unwrap();
    }

    let mut it = trie.enumerate_from(0);
    let mut seen = Vec::new();
    let mut last: Option<u32> = None;
    let mut steps = 0;
    while let Some((k, _)) = it.next().unwrap() {
        if let Some(l) = last {
            assert!(k > l, "enumerator must never revisit or go backwards");
        }
        last = Some(k);
        seen.push(k);

        // Mutate the trie out from under the enumerator partway through.
        steps += 1;
        if steps == 20 {
            trie.remove(0).unwrap();
            trie.set(5000, &6u32.to_le_bytes()).unwrap();
        }
    }
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

/// C8: a trie with a presence bitmap reports no leaks and no live-but-free
/// blocks after a run of inserts and removes.
#[test]
fn consistency_check_reports_clean_after_mixed_workload() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let trie = HatTrie::create(&store, 2, true).unwrap();

    for k in 0..500u32 {
        trie.set(k, &(k as u16).to_le_bytes()).unwrap();
    }
    for k in (0..500u32).step_by(3) {
        trie.remove(k).unwrap();
    }

    let report = consistency::check_leaks(&store, &[qps::hat::roots(&trie).unwrap()]).unwrap();
    assert!(report.is_clean(), "{:?}", report);
}
