//! Per-command state machine: authenticate, authorize, validate the message
//! shape, execute against the stack, reply.

use crate::stack::{ModuleStack, StackEntry, StackError};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use wokfs_shared::{CtlCommand, CtlMessage, CtlReply, CtlRequest, Credentials, ListEntry, ProtocolError};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("control session closed")]
    Closed,
    #[error("reply not accepted within {0:?}")]
    TimedOut(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where replies for one session go.
#[async_trait]
pub trait ReplySink: Send {
    async fn send(&mut self, reply: CtlReply) -> Result<(), SinkError>;
}

#[async_trait]
impl ReplySink for Vec<CtlReply> {
    async fn send(&mut self, reply: CtlReply) -> Result<(), SinkError> {
        self.push(reply);
        Ok(())
    }
}

/// Errors turned into a single `error` reply. Display is the reply text.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{command}: {reason}")]
    Credentials { command: CtlCommand, reason: String },
    #[error("{command}: Operation not permitted")]
    PermissionDenied { command: CtlCommand },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{command} {subject}: {source}")]
    Stack {
        command: CtlCommand,
        subject: String,
        source: StackError,
    },
}

impl From<StackEntry> for ListEntry {
    fn from(entry: StackEntry) -> Self {
        ListEntry {
            position: entry.position,
            path: entry.path.to_string_lossy().into_owned(),
            vacant: entry.is_vacant(),
            loaded_at: entry.loaded_at,
        }
    }
}

/// How long a listing waits for the peer to accept one entry.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControlProtocol {
    stack: ModuleStack,
    privileged_uid: u32,
    send_timeout: Duration,
}

impl ControlProtocol {
    pub fn new(stack: ModuleStack, privileged_uid: u32) -> Self {
        Self {
            stack,
            privileged_uid,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Bound on each send made while the stack is held for a listing. A peer
    /// slower than this is treated as gone.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn stack(&self) -> &ModuleStack {
        &self.stack
    }

    /// Handle one undecoded frame. Only a failure to deliver a reply is
    /// returned; every command failure has already been sent as a reply.
    pub async fn handle_frame<S>(
        &self,
        creds: &io::Result<Credentials>,
        frame: &str,
        sink: &mut S,
    ) -> Result<(), SinkError>
    where
        S: ReplySink + ?Sized,
    {
        match CtlMessage::decode(frame) {
            Ok(message) => self.handle_message(creds, message, sink).await,
            Err(e) => reply_error(sink, e.into()).await,
        }
    }

    pub async fn handle_message<S>(
        &self,
        creds: &io::Result<Credentials>,
        message: CtlMessage,
        sink: &mut S,
    ) -> Result<(), SinkError>
    where
        S: ReplySink + ?Sized,
    {
        let command = message.command;
        // Authorization runs before the body is even looked at, and long
        // before any stack lock is requested.
        if let Err(e) = self.authorize(command, creds) {
            return reply_error(sink, e).await;
        }
        let request = match message.into_request() {
            Ok(request) => request,
            Err(e) => return reply_error(sink, e.into()).await,
        };
        match request {
            CtlRequest::List(_) => self.emit_list(sink).await,
            request => match self.execute(request).await {
                Ok(()) => sink.send(CtlReply::Ok).await,
                Err(e) => reply_error(sink, e).await,
            },
        }
    }

    fn authorize(&self, command: CtlCommand, creds: &io::Result<Credentials>) -> Result<(), ControlError> {
        if !command.requires_privilege() {
            return Ok(());
        }
        match creds {
            Ok(creds) if creds.is_privileged(self.privileged_uid) => Ok(()),
            Ok(creds) => {
                tracing::warn!(uid = creds.uid, %command, "rejecting unprivileged caller");
                Err(ControlError::PermissionDenied { command })
            }
            Err(e) => Err(ControlError::Credentials {
                command,
                reason: e.to_string(),
            }),
        }
    }

    async fn execute(&self, request: CtlRequest) -> Result<(), ControlError> {
        match request {
            CtlRequest::Insert(spec) => {
                self.stack
                    .insert(spec.position, &spec.path)
                    .await
                    .map_err(|source| {
                        // Bad positions are reported by position, load failures by path.
                        let subject = match source {
                            StackError::InvalidPosition { position } => position.to_string(),
                            _ => spec.path.clone(),
                        };
                        ControlError::Stack {
                            command: CtlCommand::Insert,
                            subject,
                            source,
                        }
                    })?;
            }
            CtlRequest::Reload(ctl) => {
                self.stack
                    .reload(ctl.position)
                    .await
                    .map_err(|source| ControlError::Stack {
                        command: CtlCommand::Reload,
                        subject: ctl.position.to_string(),
                        source,
                    })?;
            }
            CtlRequest::Remove(ctl) => {
                self.stack
                    .remove(ctl.position)
                    .await
                    .map_err(|source| ControlError::Stack {
                        command: CtlCommand::Remove,
                        subject: ctl.position.to_string(),
                        source,
                    })?;
            }
            CtlRequest::List(_) => unreachable!("list is streamed by emit_list"),
        }
        Ok(())
    }

    /// One `entry` reply per module, then `end`. A failed or stalled send
    /// stops the listing and releases the stack straight away.
    async fn emit_list<S>(&self, sink: &mut S) -> Result<(), SinkError>
    where
        S: ReplySink + ?Sized,
    {
        let mut entries = self.stack.list();
        while let Some(entry) = entries.next().await {
            let sent = tokio::time::timeout(self.send_timeout, sink.send(CtlReply::Entry(entry.into())))
                .await
                .unwrap_or(Err(SinkError::TimedOut(self.send_timeout)));
            if let Err(e) = sent {
                tracing::warn!("listing aborted: {}", e);
                return Err(e);
            }
        }
        drop(entries);
        sink.send(CtlReply::End).await
    }
}

async fn reply_error<S>(sink: &mut S, error: ControlError) -> Result<(), SinkError>
where
    S: ReplySink + ?Sized,
{
    tracing::warn!("control command failed: {}", error);
    sink.send(CtlReply::error(error.to_string())).await
}
