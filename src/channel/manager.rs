// src/channel/manager.rs

use scanhost_proto::codec;
use scanhost_proto::wire::{self, HostRequest, ReplyKind, ServiceReply};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};

use super::transport::ServiceTransport;
use super::{ChannelError, ChannelEvent};

/// Outcome of an isolation path update, as reported by the scan host.
#[derive(Debug, Clone, PartialEq)]
pub struct PathUpdate {
    pub ok: bool,
    pub details: String,
    pub moved_count: Option<u64>,
}

struct Link {
    outbound: mpsc::UnboundedSender<HostRequest>,
    generation: u64,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

/// Owns the one logical connection to the scan host.
///
/// The link is built lazily on the first send and rebuilt on the next send
/// after a disconnect; `acquire` is serialized behind a mutex so concurrent
/// callers can never race two connections into existence. Losing the link
/// clears only the link: in-flight workflow entries stay put and their
/// replies resume arriving once a later send reconnects.
pub struct ChannelManager {
    transport: Arc<dyn ServiceTransport>,
    link: Mutex<Option<Link>>,
    /// Listener for the next `UPDATE_ISOLATION_PATH_STATUS`, which carries
    /// no correlation id and is matched by kind alone. Tagged with the
    /// generation its request went out on, so tearing down that generation
    /// fails it.
    pending_update: Mutex<Option<(u64, oneshot::Sender<PathUpdate>)>>,
    events: mpsc::Sender<ChannelEvent>,
    generation: AtomicU64,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn ServiceTransport>, events: mpsc::Sender<ChannelEvent>) -> Arc<Self> {
        Arc::new(ChannelManager {
            transport,
            link: Mutex::new(None),
            pending_update: Mutex::new(None),
            events,
            generation: AtomicU64::new(0),
        })
    }

    /// Hand out the outbound side of a live link and its generation,
    /// connecting if necessary.
    async fn acquire(
        self: &Arc<Self>,
    ) -> Result<(mpsc::UnboundedSender<HostRequest>, u64), ChannelError> {
        let mut link = self.link.lock().await;
        if let Some(l) = link.as_ref() {
            if !l.outbound.is_closed() {
                return Ok((l.outbound.clone(), l.generation));
            }
            debug!("stale link found, rebuilding");
        }

        let conn = self.transport.connect().await?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (out_tx, out_rx) = mpsc::unbounded_channel::<HostRequest>();

        let writer_task = tokio::spawn(writer_loop(conn.writer, out_rx));
        let reader_task = {
            let mgr = self.clone();
            tokio::spawn(reader_loop(mgr, conn.reader, conn.child, generation))
        };

        info!(transport = %self.transport.describe(), generation, "channel established");
        *link = Some(Link {
            outbound: out_tx.clone(),
            generation,
            reader_task,
            writer_task,
        });
        Ok((out_tx, generation))
    }

    /// Queue one request for the host, connecting first if needed. Delivery
    /// is fire-and-forget; a host that died mid-write surfaces later as a
    /// `ChannelEvent::Down`.
    pub async fn send(self: &Arc<Self>, req: HostRequest) -> Result<(), ChannelError> {
        let (outbound, _) = self.acquire().await?;
        debug!(kind = %req.kind(), id = ?req.correlation_id(), "queueing request");
        outbound.send(req).map_err(|_| ChannelError::Disconnected)
    }

    /// Ask the host to relocate the isolation directory and wait for its
    /// answer. At most one update can be in flight; a disconnect while
    /// waiting fails the call and the caller keeps the old path.
    pub async fn update_isolation_path(
        self: &Arc<Self>,
        old_path: &str,
        new_path: &str,
    ) -> Result<PathUpdate, ChannelError> {
        let (outbound, generation) = self.acquire().await?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_update.lock().await;
            if pending.is_some() {
                return Err(ChannelError::UpdateAlreadyPending);
            }
            *pending = Some((generation, tx));
        }

        let req = HostRequest::UpdateIsolationPath {
            old_path: old_path.to_owned(),
            new_path: new_path.to_owned(),
        };
        debug!(kind = %req.kind(), generation, "queueing request");
        if outbound.send(req).is_err() {
            self.pending_update.lock().await.take();
            return Err(ChannelError::Disconnected);
        }

        // The link can die between `acquire` and the send above, and a
        // teardown that ran inside that window found the slot still empty.
        // Check the generation once more instead of waiting on a dead one.
        let generation_live = self
            .link
            .lock()
            .await
            .as_ref()
            .map(|l| l.generation == generation)
            .unwrap_or(false);
        if !generation_live && self.pending_update.lock().await.take().is_some() {
            return Err(ChannelError::Disconnected);
        }

        rx.await.map_err(|_| ChannelError::Disconnected)
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|l| !l.outbound.is_closed())
            .unwrap_or(false)
    }

    /// Drop the link and kill a spawned host. Safe to call twice.
    pub async fn shutdown(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.writer_task.abort();
            link.reader_task.abort();
            info!("channel shut down");
        }
        self.pending_update.lock().await.take();
    }

    async fn dispatch(&self, reply: ServiceReply) {
        if reply.kind() == ReplyKind::UpdateIsolationPathStatus {
            if let ServiceReply::UpdateIsolationPathStatus { status, details, moved_count } = reply {
                let update = PathUpdate {
                    ok: status == wire::PATH_UPDATE_OK,
                    details,
                    moved_count,
                };
                match self.pending_update.lock().await.take() {
                    Some((_, tx)) => {
                        let _ = tx.send(update);
                    }
                    None => warn!("unsolicited isolation path update status, dropping"),
                }
            }
            return;
        }

        if self.events.send(ChannelEvent::Reply(reply)).await.is_err() {
            debug!("no event consumer, dropping reply");
        }
    }

    /// Tear down one generation of the link. A newer generation built by a
    /// later `acquire` is left alone, but a path update that went out on
    /// the torn-down generation is failed either way.
    async fn teardown(&self, generation: u64, abnormal: bool, reason: String) {
        let was_current = {
            let mut link = self.link.lock().await;
            match link.as_ref() {
                Some(l) if l.generation == generation => {
                    if let Some(l) = link.take() {
                        l.writer_task.abort();
                    }
                    true
                }
                _ => false,
            }
        };

        {
            let mut pending = self.pending_update.lock().await;
            if pending.as_ref().map(|(g, _)| *g == generation).unwrap_or(false) {
                pending.take();
            }
        }

        if !was_current {
            return;
        }

        if abnormal {
            warn!(%reason, "channel lost");
        } else {
            info!(%reason, "channel closed");
        }
        let down = ChannelEvent::Down { abnormal, reason };
        if self.events.send(down).await.is_err() {
            debug!("no event consumer for channel-down notice");
        }
    }
}

async fn writer_loop(
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::UnboundedReceiver<HostRequest>,
) {
    while let Some(req) = rx.recv().await {
        if let Err(e) = codec::write_message(&mut writer, &req).await {
            error!(error = %e, "channel write failed");
            break;
        }
    }
    debug!("writer loop ended");
}

async fn reader_loop(
    mgr: Arc<ChannelManager>,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
    generation: u64,
) {
    let mut abnormal = false;
    let mut reason = "scan host closed the channel".to_string();

    loop {
        match codec::read_frame(&mut reader).await {
            Ok(Some(frame)) => match wire::parse_reply(&frame) {
                Ok(reply) => {
                    debug!(kind = %reply.kind(), id = ?reply.correlation_id(), "reply received");
                    mgr.dispatch(reply).await;
                }
                Err(e) => warn!(error = %e, "protocol error on channel, dropping frame"),
            },
            Ok(None) => break,
            Err(e) => {
                abnormal = true;
                reason = format!("channel read failed: {e}");
                break;
            }
        }
    }

    if let Some(mut child) = child {
        // The exit status may lag the stream closing. Give the host a
        // moment to be reaped before falling back to a kill.
        match timeout(Duration::from_secs(1), child.wait()).await {
            Ok(Ok(status)) if !status.success() => {
                abnormal = true;
                reason = format!("scan host exited with {status}");
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => {
                let _ = child.kill().await;
            }
        }
    }

    mgr.teardown(generation, abnormal, reason).await;
}
