//! Durable key/value contract consumed by the kernel, plus an in-memory
//! ordered backend for tests and ephemeral runs.

mod mem_kv;
mod prefixed;

pub use mem_kv::MemKv;
pub use prefixed::PrefixedKv;

use std::sync::Arc;

pub type KvResult<T> = Result<T, KvError>;
pub type DynKv = Arc<dyn Kv>;

/// Trait implemented by all key/value backends the kernel can sit on.
///
/// Keys iterate in lexicographic order; `get_next_key` is the ordered-scan
/// primitive everything else builds on.
pub trait Kv: Send + Sync {
    fn get(&self, key: &str) -> KvResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> KvResult<()>;
    fn delete(&self, key: &str) -> KvResult<()>;
    /// First key strictly greater than `key`, if any.
    fn get_next_key(&self, key: &str) -> KvResult<Option<String>>;
    /// Inspection escape hatch; backends without a query engine reject it.
    fn execute_query(&self, sql: &str) -> KvResult<Vec<serde_json::Value>>;
    fn truncate(&self) -> KvResult<()>;

    fn get_required(&self, key: &str) -> KvResult<String> {
        self.get(key)?.ok_or_else(|| KvError::MissingKey {
            key: key.to_string(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("required key '{key}' is missing")]
    MissingKey { key: String },
    #[error("backend does not support queries: {0}")]
    QueryUnsupported(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}
