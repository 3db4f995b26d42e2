// wokfs-rs: a live, operator-controlled stack of filesystem request handlers

pub mod config;
pub mod control;
pub mod module;
pub mod stack;

pub use config::{Config, ConfigError, load_config};
pub use control::{ControlClient, ControlProtocol, ControlServer};
pub use module::{DylibLoader, FsModule, ModuleHandle, ModuleLoader, RegistryLoader};
pub use stack::{ModuleStack, ReloadStrategy, StackError, StackOptions};
