use crate::{DynKv, Kv, KvError, KvResult};

/// View of a backend restricted to one key prefix.
///
/// The kernel gives each vat a `v<id>.`-prefixed view over the shared store,
/// so a vat's durable state survives worker restarts and can be cleared
/// wholesale at termination.
#[derive(Clone)]
pub struct PrefixedKv {
    inner: DynKv,
    prefix: String,
}

impl PrefixedKv {
    pub fn new(inner: DynKv, prefix: impl Into<String>) -> Self {
        PrefixedKv {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
    }
}

impl Kv for PrefixedKv {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.inner.get(&self.full_key(key))
    }

    fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.inner.set(&self.full_key(key), value)
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        self.inner.delete(&self.full_key(key))
    }

    fn get_next_key(&self, key: &str) -> KvResult<Option<String>> {
        match self.inner.get_next_key(&self.full_key(key))? {
            Some(next) => Ok(self.strip(&next).map(str::to_string)),
            None => Ok(None),
        }
    }

    fn execute_query(&self, sql: &str) -> KvResult<Vec<serde_json::Value>> {
        self.inner.execute_query(sql)
    }

    /// Deletes only this namespace, not the whole backend.
    fn truncate(&self) -> KvResult<()> {
        let mut cursor = self.prefix.clone();
        loop {
            match self.inner.get_next_key(&cursor)? {
                Some(key) if key.starts_with(self.prefix.as_str()) => {
                    self.inner.delete(&key)?;
                    cursor = key;
                }
                _ => return Ok(()),
            }
        }
    }

    fn get_required(&self, key: &str) -> KvResult<String> {
        self.get(key)?.ok_or_else(|| KvError::MissingKey {
            key: self.full_key(key),
        })
    }
}
