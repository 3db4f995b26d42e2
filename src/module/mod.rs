//! Filesystem request handlers and the handles that own them.
//!
//! A handler sees every request threaded through the stack and either answers
//! it or passes it on. The stack itself never looks inside a handler; it only
//! needs the handle's identity, source path and the ability to destroy it.

pub mod loader;
pub mod registry;
pub mod sentinel;

pub use loader::{DylibLoader, ENTRY_SYMBOL, LoadError, ModuleEntry, ModuleLoader};
pub use registry::RegistryLoader;
pub use sentinel::DefaultModule;

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;
use wokfs_shared::Credentials;

pub const ENOSYS: i32 = 38;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOp {
    Lookup { parent: u64, name: String },
    Getattr { ino: u64 },
    Read { ino: u64, offset: u64, size: u32 },
    Write { ino: u64, offset: u64, data: Vec<u8> },
    Readdir { ino: u64, offset: u64 },
    /// Unmount.
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsRequest {
    pub creds: Credentials,
    pub op: FsOp,
}

impl FsRequest {
    pub fn new(creds: Credentials, op: FsOp) -> Self {
        Self { creds, op }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsReply {
    Ok,
    Entry { ino: u64 },
    Data(Vec<u8>),
    Written(u32),
    Err(i32),
}

/// Outcome of offering a request to one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Pass the request to the next entry in the stack.
    Continue,
    Reply(FsReply),
}

pub trait FsModule: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, req: &FsRequest) -> Flow;

    /// Release handler state. Called exactly once, after the handle has been
    /// unlinked from the stack.
    fn destroy(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(Uuid);

impl ModuleId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A loaded handler instance.
///
/// Dropping the handle destroys the handler, then drops it, then closes the
/// library it came from. Field order below is what guarantees the last two.
pub struct ModuleHandle {
    id: ModuleId,
    path: PathBuf,
    loaded_at: DateTime<Utc>,
    module: Box<dyn FsModule>,
    library: Option<libloading::Library>,
}

impl ModuleHandle {
    pub fn new(path: impl Into<PathBuf>, module: Box<dyn FsModule>) -> Self {
        Self {
            id: ModuleId::new(),
            path: path.into(),
            loaded_at: Utc::now(),
            module,
            library: None,
        }
    }

    /// Keep `library` open for as long as the handler lives.
    pub fn with_library(mut self, library: libloading::Library) -> Self {
        self.library = Some(library);
        self
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn handle(&self, req: &FsRequest) -> Flow {
        self.module.handle(req)
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        tracing::debug!(id = %self.id, path = %self.path.display(), "destroying module");
        self.module.destroy();
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("name", &self.module.name())
            .field("loaded_at", &self.loaded_at)
            .field("dynamic", &self.library.is_some())
            .finish()
    }
}
