//! tickcache sync: cache synchronization, fan-out and streaming.
//!
//! This crate builds on `tickcache-core` to provide:
//! - Chunked map-reduce over a private worker pool
//! - A background async worker for synchronous callers
//! - Universe selection and the cache synchronizer
//! - Stream writers, readers and the NBBO/chart consumers

pub mod error;
pub mod mapreduce;
pub mod stream;
pub mod sync;
pub mod universe;
pub mod worker;

pub use error::SyncError;
pub use mapreduce::{binary_map_reduce, map_chunks};
pub use stream::{StreamError, StreamSession};
pub use sync::{CacheSynchronizer, StdoutProgress, SyncOptions, SyncProgress, SyncSummary, Upstreams};
pub use universe::{desired_symbols, top_symbols_by_volume};
pub use worker::AsyncWorker;

#[cfg(test)]
mod send_sync_checks {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn shared_types_are_send_sync() {
        assert_send::<SyncError>();
        assert_send::<StreamError>();
        assert_send::<AsyncWorker>();
        assert_sync::<AsyncWorker>();
        assert_send::<stream::NbboCache>();
        assert_sync::<stream::NbboCache>();
    }
}
