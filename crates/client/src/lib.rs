pub mod cache;
pub mod error;
pub mod fetch;
pub mod store;

pub use cache::{CacheNames, CachePolicy, Interception, OfflineCache, Served};
pub use error::{ClientError, ClientResult};
pub use fetch::{
    ByteStream, FetchRequest, FetchResponse, Fetcher, HttpFetcher, RequestMode, StreamedResponse,
};
pub use store::{FileStore, KeyValueStore, MemoryStore};
