//! In-process remote side for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::transport::{ChannelConnector, ChannelTarget, RemoteChannel, CHANNEL_CAPACITY};
use crate::error::{Result, TunnelError};
use crate::kube::{CredentialResolver, KubeConfig};

/// Reply payload sent for every received frame
pub(crate) const REPLY: &[u8] = b"response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// Open, then close both directions at once
    CloseImmediately,
    /// Refuse every handshake
    FailHandshake,
    /// Prime, then answer every frame
    Respond,
    /// Prime, answer the first frame, then close
    ReplyThenClose,
    /// Prime, then never answer
    Silent,
    /// Take one frame without priming or answering, then close
    ReadThenClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MockEvent {
    Frame(Vec<u8>),
    Closed,
}

pub(crate) struct MockConnector {
    behavior: Behavior,
    attempts: AtomicU32,
    events: mpsc::UnboundedSender<MockEvent>,
}

impl MockConnector {
    pub(crate) fn new(behavior: Behavior) -> (Arc<Self>, mpsc::UnboundedReceiver<MockEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            behavior,
            attempts: AtomicU32::new(0),
            events,
        });
        (connector, rx)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self, _target: &ChannelTarget) -> Result<RemoteChannel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

        match self.behavior {
            Behavior::FailHandshake => {
                return Err(TunnelError::Transport("handshake refused".to_string()));
            }
            Behavior::CloseImmediately => {
                drop(outbound_rx);
                drop(inbound_tx);
            }
            Behavior::ReadThenClose => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    if let Some(frame) = outbound_rx.recv().await {
                        let _ = events.send(MockEvent::Frame(frame));
                    }
                    drop(inbound_tx);
                    let _ = events.send(MockEvent::Closed);
                });
            }
            behavior => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    // Priming on the data stream, port header on the error stream
                    let _ = inbound_tx.send(vec![0, 0x90, 0x1f]).await;
                    let _ = inbound_tx.send(vec![1, 0x90, 0x1f]).await;

                    while let Some(frame) = outbound_rx.recv().await {
                        let _ = events.send(MockEvent::Frame(frame));
                        if behavior == Behavior::Silent {
                            continue;
                        }

                        let mut reply = vec![0];
                        reply.extend_from_slice(REPLY);
                        let _ = inbound_tx.send(reply).await;

                        if behavior == Behavior::ReplyThenClose {
                            break;
                        }
                    }

                    let _ = events.send(MockEvent::Closed);
                });
            }
        }

        Ok(RemoteChannel::new(
            outbound_tx,
            inbound_rx,
            CancellationToken::new(),
        ))
    }
}

/// Resolver knowing one token-authenticated context, `test-ctx`
pub(crate) fn test_resolver() -> Arc<CredentialResolver> {
    let kubeconfig = KubeConfig::from_yaml(
        r#"
clusters:
  - name: test
    cluster:
      server: https://127.0.0.1:6443
users:
  - name: tester
    user:
      token: test-token
contexts:
  - name: test-ctx
    context:
      cluster: test
      user: tester
"#,
    )
    .unwrap();
    Arc::new(CredentialResolver::new(kubeconfig))
}
