//! Compiled-in handlers addressed by path.

use super::{FsModule, LoadError, ModuleHandle, ModuleLoader};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn FsModule> + Send + Sync>;

/// Loader backed by a table of factories instead of shared objects. Each load
/// builds a fresh instance, so reloading a path gives a new handler.
#[derive(Clone, Default)]
pub struct RegistryLoader {
    factories: Arc<RwLock<HashMap<PathBuf, ModuleFactory>>>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, path: impl Into<PathBuf>, factory: F)
    where
        F: Fn() -> Box<dyn FsModule> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.insert(path.into(), Arc::new(factory));
    }

    pub fn unregister(&self, path: &Path) -> bool {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.remove(path).is_some()
    }

    fn factory(&self, path: &Path) -> Option<ModuleFactory> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        factories.get(path).cloned()
    }
}

#[async_trait]
impl ModuleLoader for RegistryLoader {
    async fn load(&self, path: &Path) -> Result<ModuleHandle, LoadError> {
        let factory = self.factory(path).ok_or_else(|| LoadError::Open {
            path: path.to_path_buf(),
            message: format!("{}: no such registered module", path.display()),
        })?;
        Ok(ModuleHandle::new(path, factory()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::DefaultModule;

    #[tokio::test]
    async fn test_registered_path_loads_fresh_instances() {
        let loader = RegistryLoader::new();
        loader.register("/builtin/default", || Box::new(DefaultModule));
        let a = loader.load(Path::new("/builtin/default")).await.unwrap();
        let b = loader.load(Path::new("/builtin/default")).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "default");
    }

    #[tokio::test]
    async fn test_unknown_path_fails_to_open() {
        let loader = RegistryLoader::new();
        loader.register("/builtin/default", || Box::new(DefaultModule));
        assert!(loader.unregister(Path::new("/builtin/default")));
        let err = loader.load(Path::new("/builtin/default")).await.unwrap_err();
        assert_eq!(err.to_string(), "/builtin/default: no such registered module");
    }
}
