//! Upstream bar fetching: provider traits, Bybit client, pagination, retries.

pub mod bybit;
pub mod paginate;
pub mod provider;
pub mod retry;
pub mod transport;

pub use bybit::{BybitClient, MAX_LIMIT};
pub use paginate::{walk_backward, PagedFetcher, StopReason, Walk};
pub use provider::{BarSource, FetchError, Page, PageSource};
pub use retry::RetryPolicy;
pub use transport::{HttpReply, HttpTransport, ReqwestTransport, TransportError};

/// Production fetcher: Bybit pages behind the backward paginator.
pub type BybitFetcher = PagedFetcher<BybitClient<ReqwestTransport>>;

impl BybitFetcher {
    pub fn from_config(cfg: &crate::config::UpstreamConfig) -> Result<Self, reqwest::Error> {
        Ok(PagedFetcher::new(
            BybitClient::from_config(cfg)?,
            cfg.per_call_cap,
        ))
    }
}
