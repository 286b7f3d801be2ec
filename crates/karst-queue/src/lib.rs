//! Thread-safe queue primitives: wake signals, FIFO and keyed queues, LRU.
#![forbid(unsafe_code)]

mod keyed;
mod lru;
mod signal;
mod simple;

pub use keyed::KeyedQueue;
pub use lru::LruCache;
pub use signal::WakeSignal;
pub use simple::Queue;
