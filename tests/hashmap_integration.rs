//! Cross-call hash map scenarios that don't fit inside a single unit test:
//! growth under concurrent load, restart recovery, and erase racing insert.

use std::sync::Arc;

use triton::pool::memory::MemoryPool;
use triton::restart::RuntimeInit;
use triton::HashMap;

mod common;

fn pool() -> Arc<MemoryPool> {
    Arc::new(MemoryPool::new(1))
}

#[test]
fn grows_across_many_segments_under_concurrent_inserts() {
    common::init_tracing();
    let map: HashMap<u64, u64, MemoryPool> = HashMap::new(pool());

    crossbeam::thread::scope(|scope| {
        for t in 0..8u64 {
            let map = &map;
            scope.spawn(move |_| {
                for i in 0..500u64 {
                    let key = t * 500 + i;
                    map.insert(key, key * 2).unwrap();
                }
            });
        }
    })
    .unwrap();

    assert_eq!(map.size(), 4000);
    for t in 0..8u64 {
        for i in 0..500u64 {
            let key = t * 500 + i;
            let found = map.find(&key).expect("key must be present after growth");
            assert_eq!(*found.value(), key * 2);
        }
    }
}

#[test]
fn restart_resets_runtime_state_without_losing_entries() {
    common::init_tracing();
    let pool = pool();
    let map: HashMap<String, u64, MemoryPool> = HashMap::new(Arc::clone(&pool));
    for i in 0..200u64 {
        map.insert(format!("key-{i}"), i).unwrap();
    }

    map.runtime_initialize(&pool).unwrap();

    assert_eq!(map.size(), 200);
    for i in 0..200u64 {
        let found = map.find(&format!("key-{i}")).unwrap();
        assert_eq!(*found.value(), i);
    }
}

#[test]
fn erase_races_insert_without_losing_unrelated_keys() {
    common::init_tracing();
    let map: HashMap<u64, u64, MemoryPool> = HashMap::new(pool());
    for i in 0..1000u64 {
        map.insert(i, i).unwrap();
    }

    crossbeam::thread::scope(|scope| {
        scope.spawn(|_| {
            for i in (0..1000u64).step_by(2) {
                map.erase(&i);
            }
        });
        scope.spawn(|_| {
            for i in 1000..1500u64 {
                map.insert(i, i).unwrap();
            }
        });
    })
    .unwrap();

    for i in (0..1000u64).step_by(2) {
        assert!(map.find(&i).is_none());
    }
    for i in (1..1000u64).step_by(2) {
        assert!(map.find(&i).is_some());
    }
    for i in 1000..1500u64 {
        assert!(map.find(&i).is_some());
    }
}
