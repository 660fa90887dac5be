use crate::stream::StreamError;
use tickcache_core::config::ConfigError;
use tickcache_core::data::DataError;
use tickcache_core::series::SeriesError;
use tickcache_core::store::StoreError;
use thiserror::Error;

/// Errors from synchronization, fan-out and the async worker.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("worker pool: {0}")]
    Pool(String),

    #[error("async worker: {0}")]
    Worker(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("binary buffer of {len} values does not divide into rows of {stride}")]
    Stride { len: usize, stride: usize },

    #[error("table: {0}")]
    Table(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Series(#[from] SeriesError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
