use anyhow::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::info;

use crate::channel::{ChannelManager, ServiceTransport};
use crate::logger::AuditHooks;
use crate::prompt::PromptPresenter;
use crate::settings::Settings;
use crate::watcher::DownloadWatcher;
use crate::workflow::{Correlator, WorkflowEvent};

/// What `bootstrap` needs to bring the daemon up.
pub struct BootstrapConfig {
    /// Directory to watch for downloads; `None` runs without a watcher
    /// (manual analysis only).
    pub downloads_dir: Option<PathBuf>,
    /// Extension allow-list for the watcher; empty reports everything.
    pub extensions: Vec<String>,
    pub poll_interval: Duration,
}

pub struct App {
    watcher: Option<DownloadWatcher>,
    correlator_task: Option<JoinHandle<()>>,
    forward_task: Option<JoinHandle<()>>,
    channel_manager: Option<Arc<ChannelManager>>,
    events: Option<mpsc::Sender<WorkflowEvent>>,
}

impl App {
    pub fn new() -> Self {
        Self {
            watcher: None,
            correlator_task: None,
            forward_task: None,
            channel_manager: None,
            events: None,
        }
    }

    /// Bootstraps warden:
    ///   - clears prompts left over from a previous run
    ///   - starts the correlator over a single workflow queue
    ///   - connects channel events into that queue
    ///   - optionally starts the download watcher
    pub async fn bootstrap(
        &mut self,
        config: BootstrapConfig,
        transport: Arc<dyn ServiceTransport>,
        presenter: Arc<dyn PromptPresenter>,
        settings: Settings,
    ) -> Result<(), Error> {
        // 1) Prompts from an earlier process answer workflows that no
        //    longer exist.
        presenter.dismiss_all().await;

        // 2) The single workflow queue every producer feeds.
        let (events_tx, events_rx) = mpsc::channel::<WorkflowEvent>(64);
        self.events = Some(events_tx.clone());

        // 3) Channel manager; its replies and disconnects become
        //    workflow events.
        let (chan_tx, mut chan_rx) = mpsc::channel(64);
        let channel_manager = ChannelManager::new(transport, chan_tx);
        self.channel_manager = Some(channel_manager.clone());
        let forward_tx = events_tx.clone();
        self.forward_task = Some(tokio::spawn(async move {
            while let Some(ev) = chan_rx.recv().await {
                if forward_tx.send(ev.into()).await.is_err() {
                    break;
                }
            }
        }));

        // 4) The correlator task.
        let mut correlator = Correlator::new(channel_manager, presenter, settings);
        correlator.store_mut().add_hook(Arc::new(AuditHooks));
        self.correlator_task = Some(correlator.spawn(events_rx));

        // 5) Download watcher, when a directory was given.
        if let Some(dir) = config.downloads_dir {
            let watcher =
                DownloadWatcher::new(dir, events_tx, config.extensions, config.poll_interval)?;
            self.watcher = Some(watcher);
        }

        info!("warden is up");
        Ok(())
    }

    /// Queue for feeding detections, analysis requests and user choices.
    pub fn events(&self) -> Option<mpsc::Sender<WorkflowEvent>> {
        self.events.clone()
    }

    pub fn channel_manager(&self) -> Option<Arc<ChannelManager>> {
        self.channel_manager.clone()
    }

    pub async fn shutdown(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.shutdown();
        }
        if let Some(handle) = self.forward_task.take() {
            handle.abort();
        }
        if let Some(handle) = self.correlator_task.take() {
            handle.abort();
        }
        if let Some(manager) = self.channel_manager.take() {
            manager.shutdown().await;
        }
        info!("warden is down");
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}
