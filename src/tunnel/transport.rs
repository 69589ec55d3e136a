//! Remote channel abstraction.
//!
//! A [`ChannelConnector`] opens one multiplexed channel to a pod port and
//! hands back a [`RemoteChannel`]: raw channel messages in both directions,
//! stream-number prefix included.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use crate::error::Result;
use crate::kube::Credentials;
use crate::protocol::portforward;

/// Messages buffered per direction before senders wait
pub const CHANNEL_CAPACITY: usize = 64;

/// Where a channel should be opened, and with which credentials
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    pub credentials: Credentials,
    pub namespace: String,
    pub pod: String,
    pub port: u16,
}

impl ChannelTarget {
    pub fn url(&self) -> Result<Url> {
        portforward::portforward_url(
            &self.credentials.base_url,
            &self.namespace,
            &self.pod,
            self.port,
        )
    }
}

/// An open channel. Dropping it tears the underlying transport down.
#[derive(Debug)]
pub struct RemoteChannel {
    /// Messages to the remote side
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Messages from the remote side; `None` once the remote has closed
    pub inbound: mpsc::Receiver<Vec<u8>>,
    _shutdown: DropGuard,
}

impl RemoteChannel {
    /// Wrap a channel pair; `shutdown` is cancelled when the channel is dropped
    pub fn new(
        outbound: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            outbound,
            inbound,
            _shutdown: shutdown.drop_guard(),
        }
    }
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Open a channel; returns once the remote transport is open
    async fn connect(&self, target: &ChannelTarget) -> Result<RemoteChannel>;
}
