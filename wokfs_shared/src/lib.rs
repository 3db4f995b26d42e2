// wokfs_shared: wire types shared by the wokfs host and its control clients

pub mod creds;
pub mod protocol;

pub use creds::Credentials;
pub use protocol::{
    CtlCommand, CtlMessage, CtlReply, CtlRequest, ListEntry, ModCtl, ModSpec, ProtocolError,
};
