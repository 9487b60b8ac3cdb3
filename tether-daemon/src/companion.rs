//! The companion link: the channel companion devices relay records through.
//!
//! On this host the link is the relay inbox directory. It counts as running
//! while the directory is reachable.

use std::path::PathBuf;

use async_trait::async_trait;

use tether_sync::Subsystem;

#[derive(Debug, Clone)]
pub struct CompanionLink {
    inbox: PathBuf,
}

impl CompanionLink {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
        }
    }
}

#[async_trait]
impl Subsystem for CompanionLink {
    async fn is_running(&self) -> bool {
        match tokio::fs::metadata(&self.inbox).await {
            Ok(meta) => meta.is_dir(),
            Err(err) => {
                tracing::debug!(inbox = %self.inbox.display(), error = %err, "companion link unreachable");
                false
            }
        }
    }
}
