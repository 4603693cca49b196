use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::channel::{ChannelError, ChannelManager, PathUpdate};
use crate::settings::Settings;

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("the scan host rejected the new path: {0}")]
    Rejected(String),
    #[error("the files were moved but the new path could not be saved: {0}")]
    Persist(String),
}

/// Where isolated files live. The scan host owns the files, so changing
/// the directory is a negotiation: the host moves everything first, and
/// only its confirmation makes the new path stick.
pub struct IsolationPathStore {
    settings: Settings,
    channel: Arc<ChannelManager>,
}

impl IsolationPathStore {
    pub fn new(settings: Settings, channel: Arc<ChannelManager>) -> Self {
        IsolationPathStore { settings, channel }
    }

    /// The configured directory, empty when the host's default applies.
    pub async fn current(&self) -> String {
        self.settings.isolation_path().await
    }

    pub async fn update(&self, new_path: &str) -> Result<PathUpdate, IsolationError> {
        let old_path = self.current().await;
        let update = self.channel.update_isolation_path(&old_path, new_path).await?;
        if !update.ok {
            return Err(IsolationError::Rejected(update.details.clone()));
        }
        self.settings
            .set_isolation_path(new_path)
            .await
            .map_err(IsolationError::Persist)?;
        info!(
            from = %old_path,
            to = %new_path,
            moved = update.moved_count.unwrap_or(0),
            "isolation path updated"
        );
        Ok(update)
    }
}
