//! Client side of the control socket, used by `wokctl`.

use std::io;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use wokfs_shared::protocol::encode_frame;
use wokfs_shared::{CtlReply, CtlRequest, ListEntry, ProtocolError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Error reply from the daemon, verbatim.
    #[error("{0}")]
    Remote(String),
    #[error("connection closed before the reply was complete")]
    Closed,
    #[error("unexpected reply: {0:?}")]
    Unexpected(CtlReply),
}

pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
        })
    }

    pub async fn insert(&mut self, position: i32, path: &str) -> Result<(), ClientError> {
        self.send(CtlRequest::insert(position, path)).await?;
        self.expect_ok().await
    }

    pub async fn reload(&mut self, position: i32) -> Result<(), ClientError> {
        self.send(CtlRequest::reload(position)).await?;
        self.expect_ok().await
    }

    pub async fn remove(&mut self, position: i32) -> Result<(), ClientError> {
        self.send(CtlRequest::remove(position)).await?;
        self.expect_ok().await
    }

    pub async fn list(&mut self) -> Result<Vec<ListEntry>, ClientError> {
        self.send(CtlRequest::list()).await?;
        let mut entries = Vec::new();
        loop {
            match self.next_reply().await? {
                CtlReply::Entry(entry) => entries.push(entry),
                CtlReply::End => return Ok(entries),
                CtlReply::Error { message } => return Err(ClientError::Remote(message)),
                other => return Err(ClientError::Unexpected(other)),
            }
        }
    }

    async fn send(&mut self, request: CtlRequest) -> Result<(), ClientError> {
        let frame = encode_frame(&request.into_message()?)?;
        self.writer.write_all(frame.as_bytes()).await?;
        Ok(())
    }

    async fn next_reply(&mut self) -> Result<CtlReply, ClientError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(CtlReply::decode(&line)?)
    }

    async fn expect_ok(&mut self) -> Result<(), ClientError> {
        match self.next_reply().await? {
            CtlReply::Ok => Ok(()),
            CtlReply::Error { message } => Err(ClientError::Remote(message)),
            other => Err(ClientError::Unexpected(other)),
        }
    }
}
