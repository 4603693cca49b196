use anyhow::{Context, Result, bail};
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{Sender, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::workflow::{CandidateFile, WorkflowEvent};

/// Suffixes browsers give files that are still being written. A download
/// only counts once it loses these.
pub const IN_PROGRESS_EXTENSIONS: &[&str] = &["part", "crdownload", "download", "tmp"];

/// Default interval between directory polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches a downloads directory and turns every newly finished file into a
/// [`WorkflowEvent::Detected`]. Files already present at startup are the
/// baseline and never reported.
#[derive(Debug)]
pub struct DownloadWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl DownloadWatcher {
    /// Start watching `dir`. `extensions` narrows reporting to the given
    /// file extensions; leave it empty to report every finished file.
    pub fn new(
        dir: PathBuf,
        events: Sender<WorkflowEvent>,
        extensions: Vec<String>,
        poll_interval: Duration,
    ) -> Result<DownloadWatcher> {
        if !dir.is_dir() {
            bail!("downloads directory {} does not exist", dir.to_string_lossy());
        }

        // 1) The notify poll-watcher pushes raw events into an unbounded
        //    channel; its own callback must never block.
        let (tx, rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )
        .context("cannot create the directory poller")?;
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .with_context(|| format!("cannot watch {}", dir.display()))?;
        info!(dir = %dir.display(), "watching for downloads");

        // 2) The poller is synchronous; park it in its own task so it stays
        //    alive for as long as the watcher does.
        let handle_poller = tokio::spawn(async move {
            let _watcher = watcher;
            futures::future::pending::<()>().await;
        });

        // 3) The dispatch task filters raw events down to finished
        //    downloads and reports each path once.
        let handle_dispatch = tokio::spawn(dispatch(rx, events, extensions));

        Ok(DownloadWatcher {
            handles: vec![handle_poller, handle_dispatch],
        })
    }

    /// Stop watching. Events already queued may still be delivered.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

async fn dispatch(
    mut rx: UnboundedReceiver<notify::Result<Event>>,
    events: Sender<WorkflowEvent>,
    extensions: Vec<String>,
) {
    // Paths already reported. A removal clears its path so the same
    // filename downloaded again later is reported again.
    let mut seen: HashSet<PathBuf> = HashSet::new();

    while let Some(res) = rx.recv().await {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!(?e, "watcher error");
                continue;
            }
        };
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => {
                for path in event.paths {
                    if !is_candidate(&path, &extensions) || seen.contains(&path) {
                        continue;
                    }
                    seen.insert(path.clone());
                    debug!(path = %path.display(), "download finished");
                    if events
                        .send(WorkflowEvent::Detected(CandidateFile::new(path)))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in event.paths {
                    seen.remove(&path);
                }
            }
            _ => {}
        }
    }
}

fn is_candidate(path: &Path, extensions: &[String]) -> bool {
    if !path.is_file() {
        return false;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    // Editors and browsers drop hidden bookkeeping files next to the
    // real download.
    if name.starts_with('.') {
        return false;
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    if let Some(ext) = &ext {
        if IN_PROGRESS_EXTENSIONS.contains(&ext.as_str()) {
            return false;
        }
    }
    if extensions.is_empty() {
        return true;
    }
    match ext {
        Some(ext) => extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&ext)),
        None => false,
    }
}
