//! The live stack of filesystem request handlers.
//!
//! Requests traverse the loaded modules in order and finish at a sentinel
//! handler that is kept outside the slot vector, so nothing addressed by
//! position can ever reach it. All mutation happens under the write half of a
//! single `RwLock`; dispatch and listing share the read half.

use crate::module::loader::load_with_timeout;
use crate::module::{
    DefaultModule, Flow, FsModule, FsReply, FsRequest, LoadError, ModuleHandle, ModuleId,
    ModuleLoader,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("invalid position")]
    InvalidPosition { position: i32 },
    #[error(transparent)]
    Load(#[from] LoadError),
    /// A reload unlinked the old module but could not load its replacement.
    #[error("slot {position} left empty: {source}")]
    Inconsistent {
        position: usize,
        path: PathBuf,
        source: LoadError,
    },
}

/// Order of operations for `reload`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadStrategy {
    /// Load the replacement while the old module stays installed, swap on
    /// success, destroy the old one afterwards. A failed load changes nothing.
    #[default]
    Staged,
    /// Unlink and destroy the old module before loading the replacement, for
    /// handlers that cannot have two live instances. A failed load leaves the
    /// slot vacant.
    DestroyFirst,
}

#[derive(Debug, Clone, Default)]
pub struct StackOptions {
    pub load_timeout: Option<Duration>,
    pub reload_strategy: ReloadStrategy,
}

/// Largest number of addressable entries. Keeps every position representable
/// as the `i32` the control protocol carries.
pub const MAX_ENTRIES: usize = i32::MAX as usize;

/// One addressable entry as seen by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub position: i32,
    pub path: PathBuf,
    /// `None` for a vacant slot.
    pub id: Option<ModuleId>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl StackEntry {
    fn from_slot(position: i32, slot: &Slot) -> Self {
        match slot {
            Slot::Loaded(handle) => Self {
                position,
                path: handle.path().to_path_buf(),
                id: Some(handle.id()),
                loaded_at: Some(handle.loaded_at()),
            },
            Slot::Vacant { path } => Self {
                position,
                path: path.clone(),
                id: None,
                loaded_at: None,
            },
        }
    }

    pub fn is_vacant(&self) -> bool {
        self.id.is_none()
    }
}

enum Slot {
    Loaded(ModuleHandle),
    /// Left behind by a failed destroy-first reload; remembers what to retry.
    Vacant { path: PathBuf },
}

impl Slot {
    fn path(&self) -> &Path {
        match self {
            Slot::Loaded(handle) => handle.path(),
            Slot::Vacant { path } => path,
        }
    }
}

/// Position at which a new slot may be spliced: `0..=len`.
#[derive(Debug, Clone, Copy)]
struct InsertAt(usize);

/// Position of an existing slot: `0..len`. The sentinel has no index.
#[derive(Debug, Clone, Copy)]
struct SlotIndex(usize);

struct Entries {
    slots: Vec<Slot>,
    sentinel: Box<dyn FsModule>,
}

impl Entries {
    fn insert_at(&self, position: i32) -> Option<InsertAt> {
        insert_bound(position, self.slots.len()).map(InsertAt)
    }

    fn slot_index(&self, position: i32) -> Option<SlotIndex> {
        let index = usize::try_from(position).ok()?;
        (index < self.slots.len()).then_some(SlotIndex(index))
    }

    fn traverse(&self, req: &FsRequest) -> FsReply {
        for slot in &self.slots {
            if let Slot::Loaded(handle) = slot {
                if let Flow::Reply(reply) = handle.handle(req) {
                    return reply;
                }
            }
        }
        match self.sentinel.handle(req) {
            Flow::Reply(reply) => reply,
            Flow::Continue => FsReply::Err(crate::module::ENOSYS),
        }
    }
}

/// Splice point for `position` in a stack of `len` entries, or `None` when the
/// position is out of range or the stack is already at [`MAX_ENTRIES`].
fn insert_bound(position: i32, len: usize) -> Option<usize> {
    let at = usize::try_from(position).ok()?;
    (at <= len && len < MAX_ENTRIES).then_some(at)
}

#[derive(Clone)]
pub struct ModuleStack {
    entries: Arc<RwLock<Entries>>,
    loader: Arc<dyn ModuleLoader>,
    options: StackOptions,
}

impl ModuleStack {
    pub fn new(loader: Arc<dyn ModuleLoader>, options: StackOptions) -> Self {
        Self::with_sentinel(loader, options, Box::new(DefaultModule))
    }

    pub fn with_sentinel(
        loader: Arc<dyn ModuleLoader>,
        options: StackOptions,
        sentinel: Box<dyn FsModule>,
    ) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Entries {
                slots: Vec::new(),
                sentinel,
            })),
            loader,
            options,
        }
    }

    pub fn options(&self) -> &StackOptions {
        &self.options
    }

    /// Number of addressable entries; the sentinel is not counted.
    pub async fn len(&self) -> usize {
        self.entries.read().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn load(&self, path: &Path) -> Result<ModuleHandle, LoadError> {
        load_with_timeout(self.loader.as_ref(), path, self.options.load_timeout).await
    }

    /// Load `path` and splice it in at `position`, which may equal the
    /// current length to place it just above the sentinel.
    pub async fn insert(&self, position: i32, path: impl AsRef<Path>) -> Result<ModuleId, StackError> {
        let path = path.as_ref();
        let mut entries = self.entries.write().await;
        let InsertAt(at) = entries
            .insert_at(position)
            .ok_or(StackError::InvalidPosition { position })?;

        let handle = self.load(path).await.inspect_err(|e| {
            tracing::warn!(position, path = %path.display(), "module load failed: {}", e);
        })?;
        let id = handle.id();
        tracing::info!(position = at, path = %path.display(), %id, name = handle.name(), "module inserted");
        entries.slots.insert(at, Slot::Loaded(handle));
        Ok(id)
    }

    /// Stream every addressable entry in traversal order.
    ///
    /// Nothing is read until the stream is first polled. From then on it holds
    /// shared access until it is exhausted or dropped, so every item belongs to
    /// the same consistent state. Calling `list` again starts a new snapshot.
    pub fn list(&self) -> BoxStream<'static, StackEntry> {
        let entries = self.entries.clone();
        Box::pin(async_stream::stream! {
            let entries = entries.read_owned().await;
            for (slot, position) in entries.slots.iter().zip(0..) {
                yield StackEntry::from_slot(position, slot);
            }
        })
    }

    pub async fn snapshot(&self) -> Vec<StackEntry> {
        self.list().collect().await
    }

    /// Replace the module at `position` with a fresh instance loaded from the
    /// same path, ordered according to the configured [`ReloadStrategy`].
    pub async fn reload(&self, position: i32) -> Result<ModuleId, StackError> {
        let mut entries = self.entries.write().await;
        let SlotIndex(index) = entries
            .slot_index(position)
            .ok_or(StackError::InvalidPosition { position })?;
        let path = entries.slots[index].path().to_path_buf();
        let was_vacant = matches!(entries.slots[index], Slot::Vacant { .. });

        match self.options.reload_strategy {
            ReloadStrategy::Staged => {
                let fresh = match self.load(&path).await {
                    Ok(fresh) => fresh,
                    Err(source) if was_vacant => {
                        return Err(StackError::Inconsistent {
                            position: index,
                            path,
                            source,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(position = index, path = %path.display(), "reload failed, keeping current module: {}", e);
                        return Err(e.into());
                    }
                };
                let id = fresh.id();
                let old = std::mem::replace(&mut entries.slots[index], Slot::Loaded(fresh));
                drop(entries);
                tracing::info!(position = index, path = %path.display(), %id, "module reloaded");
                if let Slot::Loaded(old) = old {
                    self.loader.unload(old).await;
                }
                Ok(id)
            }
            ReloadStrategy::DestroyFirst => {
                let old = std::mem::replace(
                    &mut entries.slots[index],
                    Slot::Vacant { path: path.clone() },
                );
                if let Slot::Loaded(old) = old {
                    self.loader.unload(old).await;
                }
                match self.load(&path).await {
                    Ok(fresh) => {
                        let id = fresh.id();
                        entries.slots[index] = Slot::Loaded(fresh);
                        tracing::info!(position = index, path = %path.display(), %id, "module reloaded");
                        Ok(id)
                    }
                    Err(source) => {
                        tracing::error!(position = index, path = %path.display(), "reload failed, slot left vacant: {}", source);
                        Err(StackError::Inconsistent {
                            position: index,
                            path,
                            source,
                        })
                    }
                }
            }
        }
    }

    /// Unlink the entry at `position` and destroy it. Returns the path it was
    /// loaded from.
    pub async fn remove(&self, position: i32) -> Result<PathBuf, StackError> {
        let mut entries = self.entries.write().await;
        let SlotIndex(index) = entries
            .slot_index(position)
            .ok_or(StackError::InvalidPosition { position })?;
        let slot = entries.slots.remove(index);
        drop(entries);

        let path = slot.path().to_path_buf();
        tracing::info!(position = index, path = %path.display(), "module removed");
        if let Slot::Loaded(handle) = slot {
            self.loader.unload(handle).await;
        }
        Ok(path)
    }

    /// Unlink every entry and destroy them innermost first. Used at unmount.
    pub async fn clear(&self) -> usize {
        let slots = std::mem::take(&mut self.entries.write().await.slots);
        let count = slots.len();
        for slot in slots.into_iter().rev() {
            if let Slot::Loaded(handle) = slot {
                self.loader.unload(handle).await;
            }
        }
        if count > 0 {
            tracing::info!(count, "module stack cleared");
        }
        count
    }

    /// Thread `req` through the stack.
    pub async fn dispatch(&self, req: &FsRequest) -> FsReply {
        self.entries.read().await.traverse(req)
    }

    /// Same as [`dispatch`](Self::dispatch) for dispatcher threads outside the
    /// async runtime. Panics if called from within an async context.
    pub fn dispatch_blocking(&self, req: &FsRequest) -> FsReply {
        self.entries.blocking_read().traverse(req)
    }
}
