mod error;
pub mod filter;
mod ingest;
pub mod mapper;
mod query;
pub mod schema;
pub mod search;
mod storage;
mod sync_state;
pub mod threading;

#[cfg(test)]
mod test_support;

pub use error::StorageError;
pub use ingest::IngestWriter;
pub use query::{DateBuckets, QueryEngine};
pub use search::{CompiledSearch, SearchCompiler};
pub use storage::{PrefixRename, Storage, StorageOptions};
pub use sync_state::SyncStateStore;
