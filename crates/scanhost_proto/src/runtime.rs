//! Async runtime that wires **stdin / stdout** frame traffic to a
//! user-supplied [`ScanHost`] implementation.
//!
//! A scan host binary is the process warden spawns to do the actual file
//! moving and scanning. Its whole main is:
//! ```ignore
//! use scanhost_proto::runtime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     runtime::run(MyHost::default()).await
//! }
//! ```
//! Requests are handled one at a time in arrival order; replies go out
//! through a queue the handler can keep pushing to after returning, which is
//! how a scan verdict follows an isolation acknowledgement seconds later.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, warn};

use crate::codec;
use crate::wire::{parse_request, CorrelationId, FileAction, HostRequest, ServiceReply};

/// An `INITIATE_FILE_ISOLATION` request, unpacked for the handler.
#[derive(Debug, Clone)]
pub struct IsolationRequest {
    pub download_path: String,
    pub filename: String,
    /// Empty means "use the host's default isolation directory".
    pub isolation_path: String,
    pub notification_id: CorrelationId,
}

/// Outbound side of the host. Clone it into background tasks that report
/// late results; pushes after the peer is gone are silently discarded.
#[derive(Debug, Clone)]
pub struct ReplyQueue {
    tx: UnboundedSender<ServiceReply>,
}

impl ReplyQueue {
    pub fn push(&self, reply: ServiceReply) {
        if self.tx.send(reply).is_err() {
            debug!("reply queue closed, dropping late reply");
        }
    }
}

#[cfg(test)]
impl ReplyQueue {
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<ServiceReply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReplyQueue { tx }, rx)
    }
}

/// Implement this to build a scan host.
#[async_trait]
pub trait ScanHost: Send + 'static {
    /// Shown in logs.
    fn name(&self) -> &str {
        "scanhost"
    }

    /// Move the file into isolation and kick off a scan. Push an
    /// `ISOLATION_STATUS` now and a `SCAN_RESULT` whenever the scan is done.
    async fn isolate(&mut self, req: IsolationRequest, replies: ReplyQueue);

    /// Carry out the user's decision for an isolated file and push an
    /// `ACTION_DECISION_STATUS`.
    async fn apply_action(&mut self, action: FileAction, id: CorrelationId, replies: ReplyQueue);

    /// Move the isolation directory contents from `old_path` to `new_path`
    /// and push an `UPDATE_ISOLATION_PATH_STATUS`.
    async fn relocate(&mut self, old_path: String, new_path: String, replies: ReplyQueue);
}

/// Drive `host` over an arbitrary byte stream until the peer closes it.
///
/// Malformed inbound frames are logged and dropped. Returns once the stream
/// is closed and every queued reply has been flushed.
pub async fn serve<R, W, H>(mut reader: R, writer: W, mut host: H) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    H: ScanHost,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<ServiceReply>();
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(reply) = rx.recv().await {
            if let Err(e) = codec::write_message(&mut writer, &reply).await {
                error!(error=%e, "failed to write reply, stopping writer");
                break;
            }
        }
    });

    let replies = ReplyQueue { tx };
    loop {
        let frame = match codec::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(host = host.name(), "peer closed the channel");
                break;
            }
            Err(e) => {
                error!(host = host.name(), error=%e, "channel read failed");
                break;
            }
        };
        match parse_request(&frame) {
            Ok(HostRequest::InitiateFileIsolation {
                download_path,
                filename,
                isolation_path,
                notification_id,
            }) => {
                let req = IsolationRequest {
                    download_path,
                    filename,
                    isolation_path,
                    notification_id,
                };
                host.isolate(req, replies.clone()).await;
            }
            Ok(HostRequest::FileActionDecision { action, notification_id }) => {
                host.apply_action(action, notification_id, replies.clone()).await;
            }
            Ok(HostRequest::UpdateIsolationPath { old_path, new_path }) => {
                host.relocate(old_path, new_path, replies.clone()).await;
            }
            Err(e) => {
                warn!(host = host.name(), error=%e, "dropping malformed request");
            }
        }
    }

    // Let in-flight background replies drain before we return.
    drop(replies);
    writer_task.await?;
    Ok(())
}

/// Bind [`serve`] to the process's stdin and stdout.
pub async fn run<H: ScanHost>(host: H) -> Result<()> {
    serve(tokio::io::stdin(), tokio::io::stdout(), host).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testhost::MockScanHost;
    use crate::wire::{self, ScanVerdict};
    use tokio::io::AsyncWriteExt;

    async fn next_reply<R: AsyncRead + Unpin>(reader: &mut R) -> ServiceReply {
        let frame = codec::read_frame(reader).await.unwrap().expect("reply frame");
        wire::parse_reply(&frame).unwrap()
    }

    #[tokio::test]
    async fn isolation_is_acknowledged_then_scanned() {
        let (host_side, mut warden_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let server = tokio::spawn(serve(host_read, host_write, MockScanHost::default()));

        let id = CorrelationId::from("scan-1");
        let req = HostRequest::InitiateFileIsolation {
            download_path: "/dl/malware_report.exe".into(),
            filename: "malware_report.exe".into(),
            isolation_path: "".into(),
            notification_id: id.clone(),
        };
        codec::write_message(&mut warden_side, &req).await.unwrap();

        match next_reply(&mut warden_side).await {
            ServiceReply::IsolationStatus { status, notification_id, .. } => {
                assert_eq!(status, wire::ISOLATION_OK);
                assert_eq!(notification_id, id);
            }
            other => panic!("expected IsolationStatus, got {other:?}"),
        }
        match next_reply(&mut warden_side).await {
            ServiceReply::ScanResult { status, notification_id, .. } => {
                assert_eq!(status, ScanVerdict::Malicious);
                assert_eq!(notification_id, id);
            }
            other => panic!("expected ScanResult, got {other:?}"),
        }

        warden_side.shutdown().await.unwrap();
        drop(warden_side);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn restore_reports_the_original_path() {
        let (host_side, mut warden_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let _server = tokio::spawn(serve(host_read, host_write, MockScanHost::default()));

        let id = CorrelationId::from("restore-1");
        let isolate = HostRequest::InitiateFileIsolation {
            download_path: "/dl/report.pdf".into(),
            filename: "report.pdf".into(),
            isolation_path: "/quarantine".into(),
            notification_id: id.clone(),
        };
        codec::write_message(&mut warden_side, &isolate).await.unwrap();
        let _ack = next_reply(&mut warden_side).await;
        let _verdict = next_reply(&mut warden_side).await;

        let decide = HostRequest::FileActionDecision {
            action: FileAction::Restore,
            notification_id: id.clone(),
        };
        codec::write_message(&mut warden_side, &decide).await.unwrap();
        match next_reply(&mut warden_side).await {
            ServiceReply::ActionDecisionStatus {
                status,
                action_performed,
                restored_path,
                notification_id,
                ..
            } => {
                assert_eq!(status, wire::ACTION_OK);
                assert_eq!(action_performed, FileAction::Restore);
                assert_eq!(restored_path.as_deref(), Some("/dl/report.pdf"));
                assert_eq!(notification_id, id);
            }
            other => panic!("expected ActionDecisionStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_not_fatal() {
        let (host_side, mut warden_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let _server = tokio::spawn(serve(host_read, host_write, MockScanHost::default()));

        codec::write_frame(&mut warden_side, br#"{"type":"NO_SUCH_THING"}"#)
            .await
            .unwrap();

        // The loop keeps serving after the bad frame.
        let req = HostRequest::UpdateIsolationPath {
            old_path: "/old".into(),
            new_path: "/new".into(),
        };
        codec::write_message(&mut warden_side, &req).await.unwrap();
        match next_reply(&mut warden_side).await {
            ServiceReply::UpdateIsolationPathStatus { status, .. } => {
                assert_eq!(status, wire::PATH_UPDATE_OK);
            }
            other => panic!("expected UpdateIsolationPathStatus, got {other:?}"),
        }
    }
}
