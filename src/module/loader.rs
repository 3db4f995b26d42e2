//! Loading handler code units.

use super::{FsModule, ModuleHandle};
use async_trait::async_trait;
use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Registration symbol every dynamically loaded handler must export.
pub const ENTRY_SYMBOL: &str = "wokfs_module_load";

/// Signature of [`ENTRY_SYMBOL`]. Handlers are expected to be built with the
/// same toolchain as the host.
pub type ModuleEntry = unsafe fn() -> Box<dyn FsModule>;

#[derive(Debug, Error)]
pub enum LoadError {
    /// The code unit could not be opened or linked; carries the loader's own diagnostic.
    #[error("{message}")]
    Open { path: PathBuf, message: String },
    #[error("module does not define symbol '{symbol}'")]
    MissingEntryPoint { path: PathBuf, symbol: &'static str },
    #[error("load did not finish within {after:?}")]
    Timeout { path: PathBuf, after: Duration },
    #[error("loader task failed: {message}")]
    Task { path: PathBuf, message: String },
}

impl LoadError {
    pub fn path(&self) -> &Path {
        match self {
            LoadError::Open { path, .. }
            | LoadError::MissingEntryPoint { path, .. }
            | LoadError::Timeout { path, .. }
            | LoadError::Task { path, .. } => path,
        }
    }
}

#[async_trait]
pub trait ModuleLoader: Send + Sync + 'static {
    async fn load(&self, path: &Path) -> Result<ModuleHandle, LoadError>;

    /// Release a handle that is no longer reachable from the stack. Taking it
    /// by value is what keeps this from running on a linked handle.
    async fn unload(&self, handle: ModuleHandle) {
        tracing::debug!(id = %handle.id(), path = %handle.path().display(), "unloading module");
        drop(handle);
    }
}

/// Loads handlers from shared objects.
#[derive(Debug, Clone, Default)]
pub struct DylibLoader;

impl DylibLoader {
    pub fn new() -> Self {
        Self
    }

    fn load_blocking(path: &Path) -> Result<ModuleHandle, LoadError> {
        // SAFETY: running a library's initialisers is inherent to loading a
        // handler; the operator chose this path.
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let module = {
            // SAFETY: ENTRY_SYMBOL is documented to have the ModuleEntry signature.
            let entry: Symbol<ModuleEntry> = unsafe { library.get(ENTRY_SYMBOL.as_bytes()) }
                .map_err(|_| LoadError::MissingEntryPoint {
                    path: path.to_path_buf(),
                    symbol: ENTRY_SYMBOL,
                })?;
            unsafe { entry() }
        };
        Ok(ModuleHandle::new(path, module).with_library(library))
    }
}

#[async_trait]
impl ModuleLoader for DylibLoader {
    async fn load(&self, path: &Path) -> Result<ModuleHandle, LoadError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::load_blocking(&owned))
            .await
            .map_err(|e| LoadError::Task {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
    }

    async fn unload(&self, handle: ModuleHandle) {
        tracing::debug!(id = %handle.id(), path = %handle.path().display(), "closing module library");
        // dlclose may block on the library's finalisers.
        if let Err(e) = tokio::task::spawn_blocking(move || drop(handle)).await {
            tracing::error!("module unload task failed: {}", e);
        }
    }
}

/// Run `loader.load` with an optional upper bound on how long it may take.
pub async fn load_with_timeout(
    loader: &dyn ModuleLoader,
    path: &Path,
    limit: Option<Duration>,
) -> Result<ModuleHandle, LoadError> {
    match limit {
        Some(after) => tokio::time::timeout(after, loader.load(path))
            .await
            .map_err(|_| LoadError::Timeout {
                path: path.to_path_buf(),
                after,
            })?,
        None => loader.load(path).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_open_error() {
        let loader = DylibLoader::new();
        let err = loader
            .load(Path::new("/nonexistent/wokfs/mod_missing.so"))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Open { .. }));
        assert_eq!(err.path(), Path::new("/nonexistent/wokfs/mod_missing.so"));
        assert!(!err.to_string().is_empty());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[tokio::test]
    async fn test_library_without_entry_symbol() {
        let loader = DylibLoader::new();
        let err = loader.load(Path::new("libc.so.6")).await.unwrap_err();
        match err {
            LoadError::MissingEntryPoint { symbol, .. } => assert_eq!(symbol, ENTRY_SYMBOL),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    struct Stalled;

    #[async_trait]
    impl ModuleLoader for Stalled {
        async fn load(&self, _path: &Path) -> Result<ModuleHandle, LoadError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_stalled_load() {
        let err = load_with_timeout(&Stalled, Path::new("/m/slow.so"), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Timeout { after, .. } if after == Duration::from_millis(50)));
    }
}
