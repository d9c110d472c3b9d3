//! Provides a size constrained LRU cache.
//!
//! An LRU cache drops the least recently used entry if it is about to grow beyond its memory
//! budget. In contrast to prominent caches like Redis itself or memcached, this implementation
//! is a plain in-process data structure: it is the storage layer underneath each cache
//! [Group](crate::group::Group), which serializes all access to it behind a mutex. The cache
//! itself is therefore deliberately **not** thread-safe - keeping the locking out of the data
//! structure keeps it trivially testable and leaves the locking granularity to the owner.
//!
//! The cache accounts its size in bytes (length of each key plus the
//! [allocated size](ByteSize::allocated_size) of its value) rather than in entries, as the
//! values being cached vary wildly in size and a fixed entry count would make the actual memory
//! consumption unpredictable. An optional eviction listener is notified exactly once for every
//! entry which is dropped to enforce the budget - this is e.g. the place to release external
//! resources or to update metrics.
pub mod cache;

pub use cache::ByteSize;
pub use cache::LruCache;
