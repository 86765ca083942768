use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::RpcError;

/// Named capability set handed to method implementations.
///
/// A registry holds the full set; each method receives only the subset it
/// declared, so an implementation cannot reach hooks it was not granted.
#[derive(Clone, Default)]
pub struct Hooks {
    entries: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, name: impl Into<String>, hook: Arc<T>) -> Self {
        self.entries.insert(name.into(), hook);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, hook: Arc<T>) {
        self.entries.insert(name.into(), hook);
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, RpcError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RpcError::HookMissing {
                hook: name.to_string(),
            })?;
        entry
            .clone()
            .downcast::<T>()
            .map_err(|_| RpcError::HookType {
                hook: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// The attenuated view holding only `names`. Undeclared hooks are simply
    /// absent from the result.
    pub fn subset(&self, names: &[String]) -> Hooks {
        let entries = names
            .iter()
            .filter_map(|name| {
                self.entries
                    .get(name)
                    .map(|hook| (name.clone(), hook.clone()))
            })
            .collect();
        Hooks { entries }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subset_attenuates() {
        let hooks = Hooks::new()
            .with("a", Arc::new(1u32))
            .with("b", Arc::new(2u32));
        let narrowed = hooks.subset(&["a".to_string()]);
        assert!(narrowed.contains("a"));
        assert!(!narrowed.contains("b"));
    }

    #[test]
    fn get_checks_type() {
        let hooks = Hooks::new().with("n", Arc::new(5u32));
        assert_eq!(*hooks.get::<u32>("n").unwrap(), 5);
        assert!(matches!(
            hooks.get::<String>("n"),
            Err(RpcError::HookType { .. })
        ));
        assert!(matches!(
            hooks.get::<u32>("missing"),
            Err(RpcError::HookMissing { .. })
        ));
    }
}
