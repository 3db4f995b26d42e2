//! Control channel: lets an operator insert, list, reload and remove modules
//! while the filesystem is live.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientError, ControlClient};
pub use protocol::{ControlError, ControlProtocol, ReplySink, SinkError};
pub use server::{ControlServer, ServerError};
