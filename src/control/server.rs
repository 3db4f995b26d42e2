//! Unix socket front end for the control protocol.

use super::protocol::{ControlProtocol, ReplySink, SinkError};
use crate::config::ControlConfig;
use async_trait::async_trait;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Semaphore, broadcast};
use tracing::Instrument;
use uuid::Uuid;
use wokfs_shared::protocol::encode_frame;
use wokfs_shared::{Credentials, CtlReply, ProtocolError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind control socket {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Writes each reply as one JSON line.
struct LineSink<W> {
    writer: W,
}

#[async_trait]
impl<W> ReplySink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, reply: CtlReply) -> Result<(), SinkError> {
        let frame = encode_frame(&reply)?;
        self.writer.write_all(frame.as_bytes()).await?;
        Ok(())
    }
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    protocol: Arc<ControlProtocol>,
    sessions: Arc<Semaphore>,
    max_frame_bytes: usize,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one left by an earlier run.
    /// Must be called from within the runtime.
    pub fn bind(config: &ControlConfig, protocol: Arc<ControlProtocol>) -> Result<Self, ServerError> {
        let path = config.socket_path.clone();
        let bind_err = |source: io::Error| ServerError::Bind {
            path: path.clone(),
            source,
        };
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => {
                tracing::debug!("removing stale control socket {}", path.display());
                std::fs::remove_file(&path).map_err(bind_err)?;
            }
            Ok(_) => {
                return Err(bind_err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path exists and is not a socket",
                )));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        tracing::info!("control socket listening on {}", path.display());
        Ok(Self {
            listener,
            path,
            protocol,
            sessions: Arc::new(Semaphore::new(config.max_sessions)),
            max_frame_bytes: config.max_frame_bytes,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Accept sessions until `shutdown` fires, then remove the socket file.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Control server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_session(stream),
                    Err(e) => tracing::error!("control accept failed: {}", e),
                }
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("failed to remove control socket {}: {}", self.path.display(), e);
        }
        Ok(())
    }

    fn spawn_session(&self, stream: UnixStream) {
        let Ok(permit) = self.sessions.clone().try_acquire_owned() else {
            tracing::warn!("too many control sessions, refusing connection");
            tokio::spawn(refuse(stream));
            return;
        };
        let protocol = self.protocol.clone();
        let max_frame_bytes = self.max_frame_bytes;
        let span = tracing::info_span!(
            "ctl_session",
            id = %Uuid::new_v4(),
            uid = tracing::field::Empty
        );
        tokio::spawn(
            async move {
                let _permit = permit;
                run_session(&protocol, stream, max_frame_bytes).await;
            }
            .instrument(span),
        );
    }
}

async fn refuse(stream: UnixStream) {
    let mut sink = LineSink { writer: stream };
    let _ = sink
        .send(CtlReply::error("too many control sessions"))
        .await;
}

async fn run_session(protocol: &ControlProtocol, stream: UnixStream, max_frame_bytes: usize) {
    let creds = stream
        .peer_cred()
        .map(|cred| Credentials::new(cred.uid(), cred.gid()));
    match &creds {
        Ok(c) => {
            tracing::Span::current().record("uid", c.uid);
        }
        Err(e) => tracing::warn!("peer credentials unavailable: {}", e),
    }
    tracing::debug!("control session opened");

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut sink = LineSink { writer: write_half };
    let mut frame = Vec::new();
    loop {
        frame.clear();
        let limit = max_frame_bytes as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut frame).await {
            Ok(0) => break,
            Ok(n) if n > max_frame_bytes => {
                let error = ProtocolError::TooLarge {
                    limit: max_frame_bytes,
                };
                tracing::warn!("{}", error);
                let _ = sink.send(CtlReply::error(error.to_string())).await;
                break;
            }
            Ok(_) => {
                let result = match std::str::from_utf8(&frame) {
                    Ok(line) if line.trim().is_empty() => continue,
                    Ok(line) => protocol.handle_frame(&creds, line, &mut sink).await,
                    Err(e) => {
                        let error = ProtocolError::Malformed(format!("frame is not valid UTF-8: {}", e));
                        tracing::warn!("{}", error);
                        sink.send(CtlReply::error(error.to_string())).await
                    }
                };
                if let Err(e) = result {
                    tracing::debug!("control session ended: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("control read failed: {}", e);
                break;
            }
        }
    }
    tracing::debug!("control session closed");
}
