//! Control channel messages.
//!
//! Every frame is a single JSON object terminated by `\n`. A request carries a
//! header naming the command plus a body whose shape is fixed per command:
//!
//! ```json
//! {"command": "insert", "body": {"position": 0, "path": "/usr/lib/wokfs/mod_cache.so"}}
//! {"command": "list",   "body": {"position": 0, "path": ""}}
//! {"command": "reload", "body": {"position": 0}}
//! {"command": "remove", "body": {"position": 0}}
//! ```
//!
//! Replies are tagged by `status`: `ok`, `error`, `entry` (one per listed
//! module) and `end`, which closes a listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Malformed(String),
    #[error("{command}: malformed message body: {reason}")]
    Body { command: CtlCommand, reason: String },
    #[error("control message exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtlCommand {
    Insert,
    List,
    Reload,
    Remove,
}

impl CtlCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            CtlCommand::Insert => "insert",
            CtlCommand::List => "list",
            CtlCommand::Reload => "reload",
            CtlCommand::Remove => "remove",
        }
    }

    /// Commands that mutate the module stack.
    pub fn requires_privilege(self) -> bool {
        !matches!(self, CtlCommand::List)
    }
}

impl fmt::Display for CtlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Module specification: used by `insert` and by the `list` request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModSpec {
    pub position: i32,
    pub path: String,
}

/// Positional module control: used by `reload` and `remove`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModCtl {
    pub position: i32,
}

/// Raw request frame: the command header plus its still-undecoded body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CtlMessage {
    pub command: CtlCommand,
    pub body: serde_json::Value,
}

/// A request whose body has been checked against its command's fixed shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlRequest {
    Insert(ModSpec),
    List(ModSpec),
    Reload(ModCtl),
    Remove(ModCtl),
}

impl CtlMessage {
    /// Decode the header of one frame. Trailing whitespace (the frame
    /// terminator) is ignored.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Validate the body against the shape the command expects.
    pub fn into_request(self) -> Result<CtlRequest, ProtocolError> {
        let command = self.command;
        match command {
            CtlCommand::Insert => {
                let spec: ModSpec = decode_body(command, self.body)?;
                if spec.path.is_empty() {
                    return Err(ProtocolError::Body {
                        command,
                        reason: "path is empty".to_string(),
                    });
                }
                Ok(CtlRequest::Insert(spec))
            }
            CtlCommand::List => decode_body(command, self.body).map(CtlRequest::List),
            CtlCommand::Reload => decode_body(command, self.body).map(CtlRequest::Reload),
            CtlCommand::Remove => decode_body(command, self.body).map(CtlRequest::Remove),
        }
    }
}

fn decode_body<T: DeserializeOwned>(
    command: CtlCommand,
    body: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|e| ProtocolError::Body {
        command,
        reason: e.to_string(),
    })
}

impl CtlRequest {
    pub fn insert(position: i32, path: impl Into<String>) -> Self {
        CtlRequest::Insert(ModSpec {
            position,
            path: path.into(),
        })
    }

    pub fn list() -> Self {
        CtlRequest::List(ModSpec::default())
    }

    pub fn reload(position: i32) -> Self {
        CtlRequest::Reload(ModCtl { position })
    }

    pub fn remove(position: i32) -> Self {
        CtlRequest::Remove(ModCtl { position })
    }

    pub fn command(&self) -> CtlCommand {
        match self {
            CtlRequest::Insert(_) => CtlCommand::Insert,
            CtlRequest::List(_) => CtlCommand::List,
            CtlRequest::Reload(_) => CtlCommand::Reload,
            CtlRequest::Remove(_) => CtlCommand::Remove,
        }
    }

    pub fn into_message(self) -> Result<CtlMessage, serde_json::Error> {
        let command = self.command();
        let body = match self {
            CtlRequest::Insert(spec) | CtlRequest::List(spec) => serde_json::to_value(spec)?,
            CtlRequest::Reload(ctl) | CtlRequest::Remove(ctl) => serde_json::to_value(ctl)?,
        };
        Ok(CtlMessage { command, body })
    }
}

/// One listed module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub position: i32,
    pub path: String,
    /// Set when a failed reload left the slot without a loaded module.
    #[serde(default)]
    pub vacant: bool,
    #[serde(default)]
    pub loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CtlReply {
    Ok,
    Error { message: String },
    Entry(ListEntry),
    End,
}

impl CtlReply {
    pub fn error(message: impl Into<String>) -> Self {
        CtlReply::Error {
            message: message.into(),
        }
    }

    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// True for the reply that ends an exchange.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CtlReply::Entry(_))
    }
}

/// Serialize `value` as one newline-terminated frame.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let mut frame = serde_json::to_string(value)?;
    frame.push('\n');
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_frame_decodes_to_modspec() {
        let msg = CtlMessage::decode(
            "{\"command\":\"insert\",\"body\":{\"position\":1,\"path\":\"/m/a.so\"}}\n",
        )
        .unwrap();
        assert_eq!(msg.command, CtlCommand::Insert);
        assert_eq!(msg.into_request().unwrap(), CtlRequest::insert(1, "/m/a.so"));
    }

    #[test]
    fn test_reload_rejects_modspec_body() {
        let msg = CtlMessage::decode(
            "{\"command\":\"reload\",\"body\":{\"position\":1,\"path\":\"/m/a.so\"}}",
        )
        .unwrap();
        let err = msg.into_request().unwrap_err();
        assert!(matches!(err, ProtocolError::Body { command: CtlCommand::Reload, .. }));
    }

    #[test]
    fn test_insert_requires_path() {
        let msg = CtlMessage::decode("{\"command\":\"insert\",\"body\":{\"position\":0}}").unwrap();
        assert!(matches!(msg.into_request(), Err(ProtocolError::Body { .. })));

        let msg =
            CtlMessage::decode("{\"command\":\"insert\",\"body\":{\"position\":0,\"path\":\"\"}}")
                .unwrap();
        let err = msg.into_request().unwrap_err();
        assert_eq!(err.to_string(), "insert: malformed message body: path is empty");
    }

    #[test]
    fn test_unknown_command_is_malformed() {
        let err = CtlMessage::decode("{\"command\":\"mount\",\"body\":{}}").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(matches!(CtlMessage::decode("not json"), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_request_message_round_trip() {
        let frame = encode_frame(&CtlRequest::remove(3).into_message().unwrap()).unwrap();
        assert!(frame.ends_with('\n'));
        let request = CtlMessage::decode(&frame).unwrap().into_request().unwrap();
        assert_eq!(request, CtlRequest::remove(3));
    }

    #[test]
    fn test_reply_wire_shape() {
        let frame = encode_frame(&CtlReply::error("remove 9: invalid position")).unwrap();
        assert_eq!(
            frame,
            "{\"status\":\"error\",\"message\":\"remove 9: invalid position\"}\n"
        );
        let entry = CtlReply::decode("{\"status\":\"entry\",\"position\":0,\"path\":\"/m/a.so\"}")
            .unwrap();
        assert!(!entry.is_terminal());
        match entry {
            CtlReply::Entry(e) => {
                assert_eq!(e.path, "/m/a.so");
                assert!(!e.vacant);
                assert!(e.loaded_at.is_none());
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert!(CtlReply::decode("{\"status\":\"end\"}").unwrap().is_terminal());
    }

    #[test]
    fn test_only_list_is_unprivileged() {
        assert!(CtlCommand::Insert.requires_privilege());
        assert!(CtlCommand::Reload.requires_privilege());
        assert!(CtlCommand::Remove.requires_privilege());
        assert!(!CtlCommand::List.requires_privilege());
    }
}
