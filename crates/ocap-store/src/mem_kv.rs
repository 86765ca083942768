use crate::{Kv, KvError, KvResult};
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, RwLock},
};

/// Ordered in-memory backend. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemKv {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl std::fmt::Debug for MemKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemKv")
            .field("entries", &self.entries.read().unwrap().len())
            .finish()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Kv for MemKv {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    fn get_next_key(&self, key: &str) -> KvResult<Option<String>> {
        let guard = self.entries.read().unwrap();
        Ok(guard
            .range::<str, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn execute_query(&self, sql: &str) -> KvResult<Vec<serde_json::Value>> {
        Err(KvError::QueryUnsupported(sql.to_string()))
    }

    fn truncate(&self) -> KvResult<()> {
        self.entries.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_delete() {
        let kv = MemKv::new();
        kv.set("a", "1").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
        kv.delete("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
    }

    #[test]
    fn get_required_reports_missing_key() {
        let kv = MemKv::new();
        let err = kv.get_required("nope").unwrap_err();
        assert!(matches!(err, KvError::MissingKey { key } if key == "nope"));
    }

    #[test]
    fn next_key_scans_in_order() {
        let kv = MemKv::new();
        for key in ["b", "a", "c"] {
            kv.set(key, "x").unwrap();
        }
        assert_eq!(kv.get_next_key("").unwrap().as_deref(), Some("a"));
        assert_eq!(kv.get_next_key("a").unwrap().as_deref(), Some("b"));
        assert_eq!(kv.get_next_key("b").unwrap().as_deref(), Some("c"));
        assert_eq!(kv.get_next_key("c").unwrap(), None);
    }

    #[test]
    fn truncate_clears_everything() {
        let kv = MemKv::new();
        kv.set("a", "1").unwrap();
        kv.truncate().unwrap();
        assert!(kv.is_empty());
    }

    #[test]
    fn queries_are_unsupported() {
        let kv = MemKv::new();
        assert!(matches!(
            kv.execute_query("select 1"),
            Err(KvError::QueryUnsupported(_))
        ));
    }
}
