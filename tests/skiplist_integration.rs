//! Cross-call skip list scenarios mirroring the radix tree's: ordered
//! iteration over a large key set, restart recovery, and MT-mode single
//! writer racing concurrent readers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use triton::pool::memory::MemoryPool;
use triton::restart::RuntimeInit;
use triton::SkipList;

mod common;

fn pool() -> Arc<MemoryPool> {
    Arc::new(MemoryPool::new(1))
}

#[test]
fn iteration_stays_ordered_over_many_keys() {
    common::init_tracing();
    let list: SkipList<u64, MemoryPool> = SkipList::new(pool());
    for i in 0..800u64 {
        list.insert(format!("k{i:05}").as_bytes(), i).unwrap();
    }
    let keys: Vec<Vec<u8>> = list.iter().map(|e| e.key.to_vec()).collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted);
    assert_eq!(keys.len(), 800);
}

#[test]
fn restart_resets_runtime_state_without_losing_entries() {
    common::init_tracing();
    let pool = pool();
    let list: SkipList<u64, MemoryPool> = SkipList::new(Arc::clone(&pool));
    for i in 0..100u64 {
        list.insert(format!("item-{i}").as_bytes(), i).unwrap();
    }

    list.runtime_initialize(&pool).unwrap();

    assert!(!list.mt_enabled());
    assert_eq!(list.size(), 100);
    for i in 0..100u64 {
        assert_eq!(list.find(format!("item-{i}").as_bytes()).map(|e| *e.value), Some(i));
    }
}

#[test]
fn mt_mode_single_writer_races_concurrent_readers() {
    common::init_tracing();
    let list: SkipList<u64, MemoryPool> = SkipList::new(pool());
    list.runtime_initialize_mt().unwrap();
    let stop = AtomicBool::new(false);

    crossbeam::thread::scope(|scope| {
        for _ in 0..4 {
            let list = &list;
            let stop = &stop;
            scope.spawn(move |_| {
                while !stop.load(Ordering::Acquire) {
                    let _ = list.find(b"key-0300");
                    let _: Vec<_> = list.iter().take(10).collect();
                    let _ = list.lower_bound(b"key-0100");
                }
            });
        }

        scope
            .spawn(|_| {
                for key in 0..600u64 {
                    list.insert(format!("key-{key:04}").as_bytes(), key).unwrap();
                }
            })
            .join()
            .unwrap();
        stop.store(true, Ordering::Release);
    })
    .unwrap();

    assert_eq!(list.size(), 600);
    for key in 0..600u64 {
        assert_eq!(
            list.find(format!("key-{key:04}").as_bytes()).map(|e| *e.value),
            Some(key)
        );
    }
}

#[test]
fn mt_mode_erase_races_concurrent_readers() {
    common::init_tracing();
    let list: SkipList<u64, MemoryPool> = SkipList::new(pool());
    for key in 0..256u64 {
        list.insert(format!("k{key:03}").as_bytes(), key).unwrap();
    }
    list.runtime_initialize_mt().unwrap();

    crossbeam::thread::scope(|scope| {
        for _ in 0..4 {
            let list = &list;
            scope.spawn(move |_| {
                for key in 0..256u64 {
                    if let Some(entry) = list.find(format!("k{key:03}").as_bytes()) {
                        assert_eq!(*entry.value, key);
                    }
                }
            });
        }

        scope
            .spawn(|_| {
                for key in 0..256u64 {
                    list.erase(format!("k{key:03}").as_bytes()).unwrap();
                }
            })
            .join()
            .unwrap();
    })
    .unwrap();

    assert_eq!(list.size(), 0);
    list.garbage_collect().unwrap();
}
