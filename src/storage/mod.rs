//! Client record storage: backends, the storage manager and eviction.

mod backend;
mod eviction;
mod manager;
mod memory;
mod record;
mod redis_store;

pub use backend::Backend;
pub use manager::{Admission, StorageManager};
pub use memory::MemoryBackend;
pub use record::ClientRecord;
pub use redis_store::RedisBackend;

#[cfg(test)]
pub(crate) use manager::tests::FailingBackend;
