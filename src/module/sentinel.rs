//! Terminal handler that sits below every loaded module.

use super::{ENOSYS, Flow, FsModule, FsOp, FsReply, FsRequest};

/// Answers whatever the loaded modules passed on: unmount succeeds, anything
/// else is unimplemented.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultModule;

impl FsModule for DefaultModule {
    fn name(&self) -> &str {
        "default"
    }

    fn handle(&self, req: &FsRequest) -> Flow {
        match req.op {
            FsOp::Destroy => Flow::Reply(FsReply::Ok),
            _ => Flow::Reply(FsReply::Err(ENOSYS)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wokfs_shared::Credentials;

    #[test]
    fn test_default_answers_everything() {
        let m = DefaultModule;
        let creds = Credentials::new(1000, 1000);
        assert_eq!(
            m.handle(&FsRequest::new(creds, FsOp::Destroy)),
            Flow::Reply(FsReply::Ok)
        );
        assert_eq!(
            m.handle(&FsRequest::new(creds, FsOp::Getattr { ino: 1 })),
            Flow::Reply(FsReply::Err(ENOSYS))
        );
    }
}
