//! Upstream fetch adapters and the shared rate limiter

pub mod finviz;
pub mod normalize;
pub mod polygon;
pub mod provider;
pub mod rate_limiter;
pub mod tda;

pub use finviz::FinvizFetcher;
pub use polygon::PolygonFetcher;
pub use provider::{
    BlockingHttp, DataError, FetchOutcome, HttpGet, HttpResponse, PriceHistoryClient,
    PriceHistoryRequest,
};
pub use rate_limiter::{LimiterError, RateLimiter};
pub use tda::{TdaCredentials, TdaFetcher, TdaHttpClient};
