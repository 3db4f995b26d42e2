// Shared fixtures for the integration tests: a loader that counts, records and
// fails on demand.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wokfs_rs::module::{
    ENTRY_SYMBOL, Flow, FsModule, FsOp, FsReply, FsRequest, LoadError, ModuleHandle, ModuleLoader,
};

/// Lookup name every probe module answers, with its serial as the inode.
pub const WHO: &str = "who";

#[derive(Default)]
struct Inner {
    serial: Mutex<u64>,
    loads: Mutex<HashMap<PathBuf, usize>>,
    destroys: Mutex<HashMap<PathBuf, usize>>,
    failing: Mutex<HashSet<PathBuf>>,
    no_entry: Mutex<HashSet<PathBuf>>,
    delay: Mutex<Option<Duration>>,
    events: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
pub struct TestLoader {
    inner: Arc<Inner>,
}

impl TestLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, path: &str) {
        self.inner.failing.lock().unwrap().insert(PathBuf::from(path));
    }

    pub fn heal(&self, path: &str) {
        self.inner.failing.lock().unwrap().remove(Path::new(path));
    }

    pub fn without_entry(&self, path: &str) {
        self.inner.no_entry.lock().unwrap().insert(PathBuf::from(path));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = Some(delay);
    }

    pub fn loads(&self, path: &str) -> usize {
        self.inner.loads.lock().unwrap().get(Path::new(path)).copied().unwrap_or(0)
    }

    pub fn destroys(&self, path: &str) -> usize {
        self.inner.destroys.lock().unwrap().get(Path::new(path)).copied().unwrap_or(0)
    }

    /// Instances loaded and not yet destroyed.
    pub fn live(&self) -> usize {
        let loads: usize = self.inner.loads.lock().unwrap().values().sum();
        let destroys: usize = self.inner.destroys.lock().unwrap().values().sum();
        loads - destroys
    }

    /// `load <path>#<serial>` / `destroy <path>#<serial>` in the order they happened.
    pub fn events(&self) -> Vec<String> {
        self.inner.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleLoader for TestLoader {
    async fn load(&self, path: &Path) -> Result<ModuleHandle, LoadError> {
        let delay = *self.inner.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.failing.lock().unwrap().contains(path) {
            return Err(LoadError::Open {
                path: path.to_path_buf(),
                message: format!("{}: cannot open shared object file", path.display()),
            });
        }
        if self.inner.no_entry.lock().unwrap().contains(path) {
            return Err(LoadError::MissingEntryPoint {
                path: path.to_path_buf(),
                symbol: ENTRY_SYMBOL,
            });
        }
        let serial = {
            let mut serial = self.inner.serial.lock().unwrap();
            *serial += 1;
            *serial
        };
        *self.inner.loads.lock().unwrap().entry(path.to_path_buf()).or_default() += 1;
        self.inner
            .events
            .lock()
            .unwrap()
            .push(format!("load {}#{}", path.display(), serial));
        let module = ProbeModule {
            path: path.to_path_buf(),
            serial,
            inner: self.inner.clone(),
        };
        Ok(ModuleHandle::new(path, Box::new(module)))
    }
}

/// Answers `lookup WHO` with its serial and `lookup <its path>` with inode 1;
/// passes everything else on.
struct ProbeModule {
    path: PathBuf,
    serial: u64,
    inner: Arc<Inner>,
}

impl FsModule for ProbeModule {
    fn name(&self) -> &str {
        "probe"
    }

    fn handle(&self, req: &FsRequest) -> Flow {
        match &req.op {
            FsOp::Lookup { name, .. } if name == WHO => {
                Flow::Reply(FsReply::Entry { ino: self.serial })
            }
            FsOp::Lookup { name, .. } if Path::new(name) == self.path => {
                Flow::Reply(FsReply::Entry { ino: 1 })
            }
            _ => Flow::Continue,
        }
    }

    fn destroy(&mut self) {
        *self.inner.destroys.lock().unwrap().entry(self.path.clone()).or_default() += 1;
        self.inner
            .events
            .lock()
            .unwrap()
            .push(format!("destroy {}#{}", self.path.display(), self.serial));
    }
}
