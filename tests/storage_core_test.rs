//! End-to-end scenarios for the storage core: insert/read round trips,
//! page splits, overflow items, and column-store RLE behavior.

use std::sync::Arc;

use rusty_kv::page::codec::{CellIter, CellType, PageHeader};
use rusty_kv::{Btree, BtreeConfig, Connection, ConnectionConfig, Error, TreeType};
use tempfile::TempDir;

fn open_conn() -> Arc<Connection> {
    Connection::open(ConnectionConfig::default()).unwrap()
}

fn small_leaf_config() -> BtreeConfig {
    BtreeConfig {
        allocation_size: 512,
        leaf_page_max: 512,
        internal_page_max: 512,
        split_pct: 50,
        ..Default::default()
    }
}

fn create_and_open(
    conn: &Arc<Connection>,
    dir: &TempDir,
    name: &str,
    config: &BtreeConfig,
) -> Arc<Btree> {
    let path = dir.path().join(name);
    conn.create_btree(&path, config).unwrap();
    conn.open_btree(name, &path, config.clone()).unwrap()
}

#[test]
fn test_insert_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = BtreeConfig::default();
    let btree = create_and_open(&conn, &dir, "roundtrip.db", &config);
    let session = conn.open_session().unwrap();

    for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
        btree.insert(&session, k.as_bytes(), v.as_bytes()).unwrap();
    }
    btree.sync().unwrap();
    conn.close_btree(&btree).unwrap();

    let btree = conn
        .open_btree("roundtrip.db", &dir.path().join("roundtrip.db"), config)
        .unwrap();
    let scanned = btree.scan(&session).unwrap();
    assert_eq!(
        scanned,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );
    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
    assert_eq!(conn.cache().bytes_inuse(), 0);
}

#[test]
fn test_split_parent_holds_ordered_refs() {
    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = small_leaf_config();
    let btree = create_and_open(&conn, &dir, "split.db", &config);
    let session = conn.open_session().unwrap();

    for i in 0..200 {
        btree
            .insert(&session, format!("k{i:03}").as_bytes(), b"12345678")
            .unwrap();
    }
    btree.sync().unwrap();
    conn.close_btree(&btree).unwrap();

    // Reopen: the root must reference at least two leaves with
    // strictly increasing promoted keys, every leaf image within the
    // maximum.
    let btree = conn
        .open_btree("split.db", &dir.path().join("split.db"), config)
        .unwrap();
    let root = btree
        .arena
        .get(btree.root_ref().page_id().unwrap())
        .unwrap();
    let refs = root.refs();
    assert!(refs.len() >= 2, "expected a split, got {} refs", refs.len());

    let mut prev: Option<Vec<u8>> = None;
    for (i, r) in refs.iter().enumerate() {
        let key = r.key.row().to_vec();
        if i > 1 {
            assert!(prev.as_ref().unwrap() < &key, "promoted keys out of order");
        }
        prev = Some(key);

        let img = btree.block.read(&r.addr().unwrap()).unwrap();
        let hdr = PageHeader::parse(&img).unwrap();
        assert!(hdr.size <= 512);
    }

    let scanned = btree.scan(&session).unwrap();
    assert_eq!(scanned.len(), 200);
    assert_eq!(scanned[0].0, b"k000".to_vec());
    assert_eq!(scanned[199].0, b"k199".to_vec());
    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

#[test]
fn test_overflow_key_round_trip() {
    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = BtreeConfig {
        allocation_size: 512,
        leaf_page_max: 512,
        internal_page_max: 512,
        leaf_item_max: 40,
        internal_item_max: 40,
        split_pct: 75,
        ..Default::default()
    };
    let btree = create_and_open(&conn, &dir, "ovfl.db", &config);
    let session = conn.open_session().unwrap();

    let big_key = vec![0x5a; 2048];
    btree.insert(&session, &big_key, b"payload").unwrap();
    btree.sync().unwrap();
    conn.close_btree(&btree).unwrap();

    let btree = conn
        .open_btree("ovfl.db", &dir.path().join("ovfl.db"), config)
        .unwrap();
    assert_eq!(btree.search(&session, &big_key).unwrap(), b"payload");

    // The leaf's in-image key cell is an overflow reference.
    let root = btree
        .arena
        .get(btree.root_ref().page_id().unwrap())
        .unwrap();
    let leaf_addr = root.refs()[0].addr().unwrap();
    let img = btree.block.read(&leaf_addr).unwrap();
    let hdr = PageHeader::parse(&img).unwrap();
    let (_, first) = CellIter::new(&img, hdr.size as usize)
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(first.cell_type, CellType::KeyOvfl);

    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

#[test]
fn test_col_var_rle_single_cell() {
    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = BtreeConfig {
        tree_type: TreeType::ColVar,
        allocation_size: 512,
        leaf_page_max: 64 * 1024,
        internal_page_max: 2048,
        ..Default::default()
    };
    let btree = create_and_open(&conn, &dir, "rle.db", &config);
    let session = conn.open_session().unwrap();

    for _ in 0..1000 {
        btree.col_append(&session, &[0x42]).unwrap();
    }
    btree.sync().unwrap();
    conn.close_btree(&btree).unwrap();

    let btree = conn
        .open_btree("rle.db", &dir.path().join("rle.db"), config)
        .unwrap();
    for recno in [1u64, 500, 1000] {
        assert_eq!(btree.col_read(&session, recno).unwrap(), vec![0x42]);
    }
    assert!(matches!(
        btree.col_read(&session, 1001),
        Err(Error::NotFound)
    ));

    // One value cell, RLE of 1000.
    let root = btree
        .arena
        .get(btree.root_ref().page_id().unwrap())
        .unwrap();
    let leaf_addr = root.refs()[0].addr().unwrap();
    let img = btree.block.read(&leaf_addr).unwrap();
    let hdr = PageHeader::parse(&img).unwrap();
    assert_eq!(hdr.entries, 1);
    let (_, cell) = CellIter::new(&img, hdr.size as usize)
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(cell.cell_type, CellType::Value);
    assert_eq!(cell.rle(), 1000);

    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

#[test]
fn test_col_fix_round_trip_after_reopen() {
    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = BtreeConfig {
        tree_type: TreeType::ColFix { bitcnt: 8 },
        allocation_size: 512,
        leaf_page_max: 512,
        internal_page_max: 512,
        ..Default::default()
    };
    let btree = create_and_open(&conn, &dir, "fix.db", &config);
    let session = conn.open_session().unwrap();

    for i in 0..300u64 {
        btree.col_append(&session, &[(i % 200) as u8]).unwrap();
    }
    btree.col_update(&session, 7, Some(&[0xff])).unwrap();
    btree.sync().unwrap();
    conn.close_btree(&btree).unwrap();

    let btree = conn
        .open_btree("fix.db", &dir.path().join("fix.db"), config)
        .unwrap();
    assert_eq!(btree.col_read(&session, 7).unwrap(), vec![0xff]);
    for i in [1u64, 100, 300] {
        assert_eq!(
            btree.col_read(&session, i).unwrap(),
            vec![((i - 1) % 200) as u8]
        );
    }
    // Appends continue from the recovered last record number.
    let next = btree.col_append(&session, &[9]).unwrap();
    assert_eq!(next, 301);

    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

#[test]
fn test_updates_and_deletes_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = small_leaf_config();
    let btree = create_and_open(&conn, &dir, "upd.db", &config);
    let session = conn.open_session().unwrap();

    let mut model = std::collections::BTreeMap::new();
    for i in 0..300 {
        let k = format!("key{i:04}").into_bytes();
        let v = format!("val{i}").into_bytes();
        btree.insert(&session, &k, &v).unwrap();
        model.insert(k, v);
    }
    // Overwrite some, delete others.
    for i in (0..300).step_by(3) {
        let k = format!("key{i:04}").into_bytes();
        let v = b"rewritten".to_vec();
        btree.insert(&session, &k, &v).unwrap();
        model.insert(k, v);
    }
    for i in (0..300).step_by(7) {
        let k = format!("key{i:04}").into_bytes();
        btree.remove(&session, &k).unwrap();
        model.remove(&k);
    }

    btree.sync().unwrap();
    conn.close_btree(&btree).unwrap();

    let btree = conn
        .open_btree("upd.db", &dir.path().join("upd.db"), config)
        .unwrap();
    let scanned = btree.scan(&session).unwrap();
    let expect: Vec<(Vec<u8>, Vec<u8>)> =
        model.into_iter().collect();
    assert_eq!(scanned, expect);

    // Point lookups agree with the scan.
    assert!(matches!(
        btree.search(&session, b"key0000"),
        Err(Error::NotFound)
    ));
    assert_eq!(btree.search(&session, b"key0001").unwrap(), b"val1");

    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

#[test]
fn test_zero_length_value_round_trip() {
    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = BtreeConfig::default();
    let btree = create_and_open(&conn, &dir, "zlen.db", &config);
    let session = conn.open_session().unwrap();

    btree.insert(&session, b"only", b"").unwrap();
    btree.sync().unwrap();
    conn.close_btree(&btree).unwrap();

    let btree = conn
        .open_btree("zlen.db", &dir.path().join("zlen.db"), config)
        .unwrap();
    assert_eq!(btree.search(&session, b"only").unwrap(), b"");
    assert_eq!(
        btree.scan(&session).unwrap(),
        vec![(b"only".to_vec(), Vec::new())]
    );
    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

#[test]
fn test_randomized_workload_matches_model() {
    use rand::Rng;

    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = small_leaf_config();
    let btree = create_and_open(&conn, &dir, "rand.db", &config);
    let session = conn.open_session().unwrap();

    let mut rng = rand::rng();
    let mut model = std::collections::BTreeMap::new();
    for _ in 0..2000 {
        let key = format!("r{:05}", rng.random_range(0..800u32)).into_bytes();
        if rng.random_range(0..5u8) == 0 {
            btree.remove(&session, &key).unwrap();
            model.remove(&key);
        } else {
            let value = vec![rng.random_range(0..=255u8); rng.random_range(1..60usize)];
            btree.insert(&session, &key, &value).unwrap();
            model.insert(key, value);
        }
    }

    btree.sync().unwrap();
    conn.close_btree(&btree).unwrap();

    let btree = conn
        .open_btree("rand.db", &dir.path().join("rand.db"), config)
        .unwrap();
    let scanned = btree.scan(&session).unwrap();
    let expect: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
    assert_eq!(scanned, expect);
    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

#[test]
fn test_bulk_load_round_trip() {
    let dir = TempDir::new().unwrap();
    let conn = open_conn();
    let config = small_leaf_config();
    let btree = create_and_open(&conn, &dir, "bulk.db", &config);
    let session = conn.open_session().unwrap();

    let mut bulk = rusty_kv::reconcile::BulkLoader::new(&btree).unwrap();
    for i in 0..1000 {
        bulk.insert(format!("row{i:05}").as_bytes(), b"bulk-value")
            .unwrap();
    }
    bulk.finish().unwrap();
    conn.close_btree(&btree).unwrap();

    let btree = conn
        .open_btree("bulk.db", &dir.path().join("bulk.db"), config)
        .unwrap();
    let scanned = btree.scan(&session).unwrap();
    assert_eq!(scanned.len(), 1000);
    assert_eq!(
        btree.search(&session, b"row00500").unwrap(),
        b"bulk-value"
    );
    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}
