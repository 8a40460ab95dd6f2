use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use rusty_kv::{Btree, BtreeConfig, Connection, ConnectionConfig};
use tempfile::TempDir;

fn setup(dir: &TempDir) -> (Arc<Connection>, Arc<Btree>) {
    let conn = Connection::open(ConnectionConfig::default()).unwrap();
    let config = BtreeConfig {
        allocation_size: 512,
        leaf_page_max: 32 * 1024,
        internal_page_max: 4096,
        ..Default::default()
    };
    let path = dir.path().join("bench.db");
    conn.create_btree(&path, &config).unwrap();
    let btree = conn.open_btree("bench.db", &path, config).unwrap();
    (conn, btree)
}

fn bench_insert(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (conn, btree) = setup(&dir);
    let session = conn.open_session().unwrap();

    let mut i = 0u64;
    c.bench_function("row_insert", |b| {
        b.iter(|| {
            let key = format!("bench{i:012}");
            btree.insert(&session, key.as_bytes(), b"benchmark-value").unwrap();
            i += 1;
        })
    });

    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

fn bench_search(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (conn, btree) = setup(&dir);
    let session = conn.open_session().unwrap();

    let n = 10_000u64;
    for i in 0..n {
        let key = format!("bench{i:012}");
        btree.insert(&session, key.as_bytes(), b"benchmark-value").unwrap();
    }
    btree.sync().unwrap();

    let mut i = 0u64;
    c.bench_function("row_search", |b| {
        b.iter(|| {
            let key = format!("bench{:012}", i % n);
            btree.search(&session, key.as_bytes()).unwrap();
            i += 1;
        })
    });

    conn.close_btree(&btree).unwrap();
    conn.close().unwrap();
}

criterion_group!(benches, bench_insert, bench_search);
criterion_main!(benches);
