//! Cross-call radix tree scenarios: ordered iteration over a large key set,
//! restart recovery, and MT-mode single writer racing concurrent readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use triton::pool::memory::MemoryPool;
use triton::restart::RuntimeInit;
use triton::RadixTree;

mod common;

fn pool() -> Arc<MemoryPool> {
    Arc::new(MemoryPool::new(1))
}

#[test]
fn iteration_stays_ordered_over_many_keys() {
    common::init_tracing();
    let tree: RadixTree<u64, MemoryPool> = RadixTree::new(pool());
    for i in 0..800u64 {
        tree.insert(format!("k{i:05}").as_bytes(), i).unwrap();
    }
    let keys: Vec<Vec<u8>> = tree.iter().map(|e| e.key.to_vec()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert_eq!(keys.len(), 800);
}

#[test]
fn restart_resets_runtime_state_without_losing_entries() {
    common::init_tracing();
    let pool = pool();
    let tree: RadixTree<u64, MemoryPool> = RadixTree::new(Arc::clone(&pool));
    for i in 0..100u64 {
        tree.insert(format!("item-{i}").as_bytes(), i).unwrap();
    }

    tree.runtime_initialize(&pool).unwrap();

    assert!(!tree.mt_enabled());
    assert_eq!(tree.size(), 100);
    for i in 0..100u64 {
        assert_eq!(tree.find(format!("item-{i}").as_bytes()).map(|e| *e.value), Some(i));
    }
}

#[test]
fn mt_mode_single_writer_races_concurrent_readers() {
    // MT mode is multi-reader/single-writer: the one writer thread below
    // inserts while several reader threads concurrently look entries up
    // and iterate, never themselves mutating.
    common::init_tracing();
    let tree: RadixTree<u64, MemoryPool> = RadixTree::new(pool());
    tree.runtime_initialize_mt().unwrap();
    let stop = AtomicBool::new(false);

    crossbeam::thread::scope(|scope| {
        for _ in 0..4 {
            let tree = &tree;
            let stop = &stop;
            scope.spawn(move |_| {
                while !stop.load(Ordering::Acquire) {
                    let _ = tree.find(b"key-0300");
                    let _: Vec<_> = tree.iter().take(10).collect();
                }
            });
        }

        scope
            .spawn(|_| {
                for key in 0..600u64 {
                    tree.insert(format!("key-{key:04}").as_bytes(), key).unwrap();
                }
            })
            .join()
            .unwrap();
        stop.store(true, Ordering::Release);
    })
    .unwrap();

    assert_eq!(tree.size(), 600);
    for key in 0..600u64 {
        assert_eq!(
            tree.find(format!("key-{key:04}").as_bytes()).map(|e| *e.value),
            Some(key)
        );
    }
}

#[test]
fn mt_mode_erase_races_concurrent_readers() {
    common::init_tracing();
    let tree: RadixTree<u64, MemoryPool> = RadixTree::new(pool());
    for key in 0..256u64 {
        tree.insert(format!("k{key:03}").as_bytes(), key).unwrap();
    }
    tree.runtime_initialize_mt().unwrap();

    crossbeam::thread::scope(|scope| {
        for _ in 0..4 {
            let tree = &tree;
            scope.spawn(move |_| {
                for key in 0..256u64 {
                    // A concurrent reader must only ever observe the
                    // correct value or a clean miss, never a torn or
                    // partially-unlinked entry.
                    if let Some(entry) = tree.find(format!("k{key:03}").as_bytes()) {
                        assert_eq!(*entry.value, key);
                    }
                }
            });
        }

        scope
            .spawn(|_| {
                for key in 0..256u64 {
                    tree.erase(format!("k{key:03}").as_bytes()).unwrap();
                }
            })
            .join()
            .unwrap();
    })
    .unwrap();

    assert_eq!(tree.size(), 0);
    tree.garbage_collect().unwrap();
}
