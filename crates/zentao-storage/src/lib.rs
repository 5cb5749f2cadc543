//! Persistence and remote-fetch plumbing for the Zentao connector.

mod http;
mod memory;
mod pg;
mod store;

pub use http::{
    should_retry_error, should_retry_status, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RateLimit, RequestPacer, RetryPolicy,
};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use store::{
    load_domain, load_tool, raw_params, upsert_domain, upsert_tool, DomainRow, RawRecord, Store,
    StoreError, ToolRow,
};

pub const CRATE_NAME: &str = "zentao-storage";
