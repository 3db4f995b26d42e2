//! Caller identity as reported by the transport's peer-credential facility.

use serde::{Deserialize, Serialize};

/// Uid of the conventional superuser.
pub const ROOT_UID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Superuser identity: uid 0 with its default group.
    pub fn root() -> Self {
        Self { uid: ROOT_UID, gid: 0 }
    }

    /// Only the primary id decides privilege; the group is carried for handlers.
    pub fn is_privileged(&self, privileged_uid: u32) -> bool {
        self.uid == privileged_uid
    }
}
