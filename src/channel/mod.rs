/*
┌─────────────────────────────────────────────────┐
│                 ChannelManager                  │
│  acquire() ─ one live link, rebuilt on demand   │
│  send(HostRequest) ──▶ writer task ──▶ frames   │
│  frames ──▶ reader task ──▶ dispatch by kind    │
└─────────────────────────────────────────────────┘
           ▲                        │
           │ connect()              │ ChannelEvent
           │                        ▼
┌──────────┴───────────┐   ┌────────────────────┐
│  ServiceTransport    │   │  workflow engine   │
│  ProcessTransport    │   │  (Reply / Down)    │
│  DuplexTransport     │   └────────────────────┘
└──────────────────────┘
  UPDATE_ISOLATION_PATH_STATUS never reaches the
  engine: the manager resolves the pending update
  one-shot it belongs to.
*/
pub mod manager;
pub mod transport;

use scanhost_proto::wire::ServiceReply;
use thiserror::Error;

pub use manager::{ChannelManager, PathUpdate};
pub use transport::{Connection, DuplexTransport, ProcessTransport, ServiceTransport};

/// What the channel layer reports upward. Replies carry workflow state;
/// `Down` only clears the connection, live workflows stay untouched.
#[derive(Debug)]
pub enum ChannelEvent {
    Reply(ServiceReply),
    Down { abnormal: bool, reason: String },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot reach the scan host: {0}")]
    Connect(String),
    #[error("the scan host channel is down")]
    Disconnected,
    #[error("an isolation path update is already in flight")]
    UpdateAlreadyPending,
}
