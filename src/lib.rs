//! Persistent-memory-resident concurrent containers: a hash map, a radix
//! (PATRICIA) tree, and a skip list, all written against a pool/transaction
//! abstraction rather than any one allocator, so a real pmem-backed pool
//! manager can be substituted without touching container code.

pub mod concurrency;
pub mod error;
pub mod hashmap;
pub mod layout;
pub mod pool;
pub mod radix;
pub mod relptr;
pub mod restart;
pub mod segment;
pub mod skiplist;
pub mod tls;

pub use error::{CoreError, Result};
pub use hashmap::HashMap;
pub use radix::RadixTree;
pub use restart::RuntimeInit;
pub use skiplist::SkipList;
