//! A deterministic in-memory scan host for tests and demos.
//!
//! It moves no real files. The verdict is chosen from the filename so tests
//! can script outcomes: `malware` ⇒ malicious, `suspect` ⇒ suspicious,
//! `scanfail` ⇒ a scanner error, anything else ⇒ clean. A filename
//! containing `locked` makes the isolation step itself fail.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::runtime::{IsolationRequest, ReplyQueue, ScanHost};
use crate::wire::{
    CorrelationId, FileAction, ScanVerdict, ServiceReply, ACTION_OK, ISOLATION_OK, PATH_UPDATE_OK,
};

#[derive(Debug)]
pub struct MockScanHost {
    /// Pause between the isolation acknowledgement and the scan verdict.
    pub scan_delay: Duration,
    pending: HashMap<CorrelationId, PendingFile>,
}

#[derive(Debug, Clone)]
struct PendingFile {
    filename: String,
    download_path: String,
}

impl Default for MockScanHost {
    fn default() -> Self {
        MockScanHost {
            scan_delay: Duration::from_millis(10),
            pending: HashMap::new(),
        }
    }
}

/// Verdict and detail line the mock reports for a filename.
pub fn verdict_for(filename: &str) -> (ScanVerdict, String) {
    let lower = filename.to_lowercase();
    if lower.contains("malware") {
        (ScanVerdict::Malicious, "detected Test.Threat.Win32".into())
    } else if lower.contains("suspect") {
        (ScanVerdict::Suspicious, "entropy and import anomalies".into())
    } else if lower.contains("scanfail") {
        (ScanVerdict::Error, "scanner backend unavailable".into())
    } else {
        (ScanVerdict::Clean, "no threats found".into())
    }
}

#[async_trait]
impl ScanHost for MockScanHost {
    fn name(&self) -> &str {
        "mock_scanhost"
    }

    async fn isolate(&mut self, req: IsolationRequest, replies: ReplyQueue) {
        if req.filename.to_lowercase().contains("locked") {
            replies.push(ServiceReply::IsolationStatus {
                status: "error".into(),
                filename: req.filename,
                details: Some("file is locked by another process".into()),
                notification_id: req.notification_id,
            });
            return;
        }

        let dir = if req.isolation_path.is_empty() {
            ".isolated".to_string()
        } else {
            req.isolation_path.clone()
        };
        self.pending.insert(
            req.notification_id.clone(),
            PendingFile {
                filename: req.filename.clone(),
                download_path: req.download_path.clone(),
            },
        );
        replies.push(ServiceReply::IsolationStatus {
            status: ISOLATION_OK.into(),
            filename: req.filename.clone(),
            details: Some(format!("file moved to {dir}")),
            notification_id: req.notification_id.clone(),
        });

        let (verdict, details) = verdict_for(&req.filename);
        let delay = self.scan_delay;
        let filename = req.filename;
        let id = req.notification_id;
        tokio::spawn(async move {
            sleep(delay).await;
            replies.push(ServiceReply::ScanResult {
                status: verdict,
                filename,
                details,
                notification_id: id,
            });
        });
    }

    async fn apply_action(&mut self, action: FileAction, id: CorrelationId, replies: ReplyQueue) {
        let Some(file) = self.pending.get(&id).cloned() else {
            replies.push(ServiceReply::ActionDecisionStatus {
                status: "error".into(),
                action_performed: action,
                details: "unknown notification id".into(),
                notification_id: id,
                restored_path: None,
            });
            return;
        };

        let (details, restored_path) = match action {
            FileAction::Delete => {
                self.pending.remove(&id);
                ("file deleted from isolation".to_string(), None)
            }
            FileAction::Isolate => ("file kept in isolation".to_string(), None),
            FileAction::Restore => {
                self.pending.remove(&id);
                (
                    format!("file restored as {}", file.filename),
                    Some(file.download_path),
                )
            }
        };
        replies.push(ServiceReply::ActionDecisionStatus {
            status: ACTION_OK.into(),
            action_performed: action,
            details,
            notification_id: id,
            restored_path,
        });
    }

    async fn relocate(&mut self, old_path: String, new_path: String, replies: ReplyQueue) {
        if new_path.trim().is_empty() {
            replies.push(ServiceReply::UpdateIsolationPathStatus {
                status: "error".into(),
                details: "new isolation path is empty".into(),
                moved_count: None,
            });
            return;
        }
        if old_path == new_path {
            replies.push(ServiceReply::UpdateIsolationPathStatus {
                status: PATH_UPDATE_OK.into(),
                details: "isolation path unchanged".into(),
                moved_count: Some(0),
            });
            return;
        }
        if !old_path.is_empty() && new_path.starts_with(&format!("{old_path}/")) {
            replies.push(ServiceReply::UpdateIsolationPathStatus {
                status: "error".into(),
                details: "new path is inside the current isolation directory".into(),
                moved_count: None,
            });
            return;
        }
        let moved = self.pending.len() as u64;
        replies.push(ServiceReply::UpdateIsolationPathStatus {
            status: PATH_UPDATE_OK.into(),
            details: format!("moved {moved} item(s) to {new_path}"),
            moved_count: Some(moved),
        });
    }
}
