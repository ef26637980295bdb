use std::collections::HashMap;
use std::sync::Arc;

use crate::{RestructureError, Result};

/// Name-keyed registry of pluggable backends.
///
/// Configuration selects implementations by short name (`csv`, `gzip`,
/// `local`, ...). Custom backends register before configuration is
/// resolved; later registrations under the same name win.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Registry<T> {
    /// Creates an empty registry; `kind` names it in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// Registers an implementation under a short name.
    pub fn register(&mut self, name: impl Into<String>, entry: Arc<T>) {
        self.entries.insert(name.into(), entry);
    }

    /// Looks up an implementation by name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the registry and the known
    /// names when nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<T>> {
        self.entries.get(name).cloned().ok_or_else(|| {
            let mut known: Vec<&str> = self.entries.keys().map(String::as_str).collect();
            known.sort_unstable();
            RestructureError::Config(format!(
                "unknown {} {:?}, expected one of {}",
                self.kind,
                name,
                known.join(", ")
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync + std::fmt::Debug {
        fn name(&self) -> &'static str;
    }

    #[derive(Debug)]
    struct A;
    impl Named for A {
        fn name(&self) -> &'static str {
            "a"
        }
    }

    #[test]
    fn lookup_and_unknown_name() {
        let mut registry: Registry<dyn Named> = Registry::new("codec");
        registry.register("a", Arc::new(A));
        assert_eq!(registry.get("a").unwrap().name(), "a");
        let err = registry.get("b").unwrap_err().to_string();
        assert!(err.contains("codec"), "{err}");
        assert!(err.contains('a'), "{err}");
    }

    #[test]
    fn later_registration_wins() {
        #[derive(Debug)]
        struct B;
        impl Named for B {
            fn name(&self) -> &'static str {
                "b"
            }
        }
        let mut registry: Registry<dyn Named> = Registry::new("codec");
        registry.register("x", Arc::new(A));
        registry.register("x", Arc::new(B));
        assert_eq!(registry.get("x").unwrap().name(), "b");
    }
}
