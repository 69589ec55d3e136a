use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_tls_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    Connector,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::transport::{ChannelConnector, ChannelTarget, RemoteChannel, CHANNEL_CAPACITY};
use crate::error::{Result, TunnelError};
use crate::kube::tls;
use crate::protocol::portforward::subprotocol_header;

/// Opens port-forward channels as WebSocket upgrades against the API server
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, target: &ChannelTarget) -> Result<RemoteChannel> {
        let url = target.url()?;
        debug!("Connecting to {}", url);

        // Build request using IntoClientRequest to get proper WebSocket headers
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        let protocols = HeaderValue::from_str(&subprotocol_header())
            .map_err(|e| TunnelError::Transport(format!("Invalid subprotocol header: {}", e)))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocols);
        for (name, value) in &target.credentials.auth_headers {
            headers.insert(name.clone(), value.clone());
        }

        let connector = if url.scheme() == "wss" {
            Connector::Rustls(tls::client_config(target.credentials.identity.as_ref())?)
        } else {
            Connector::Plain
        };

        let (ws_stream, response) =
            connect_async_tls_with_config(request, None, true, Some(connector)).await?;
        let protocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        info!(
            "Channel open to {}/{}:{} (protocol: {})",
            target.namespace, target.pod, target.port, protocol
        );

        let (write, read) = ws_stream.split();

        // Create channels
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
        let (pong_tx, pong_rx) = mpsc::channel::<Message>(8);
        let shutdown = CancellationToken::new();

        // This task exclusively owns the write half - no locks needed
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut write = write;
            let mut outbound_rx = outbound_rx;
            let mut pong_rx = pong_rx;
            loop {
                let msg = tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    data = outbound_rx.recv() => match data {
                        Some(data) => Message::Binary(data),
                        None => break,
                    },
                    Some(pong) = pong_rx.recv() => pong,
                };

                if let Err(e) = write.send(msg).await {
                    debug!("WebSocket send error: {}", e);
                    break;
                }
            }

            let _ = write.send(Message::Close(None)).await;
            let _ = write.close().await;
            trace!("Channel writer finished");
        });

        // Task to read from the WebSocket and hand binary messages to the session
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut read = read;
            loop {
                let result = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    result = read.next() => result,
                };

                match result {
                    Some(Ok(Message::Binary(data))) => {
                        trace!("Channel received {} bytes", data.len());
                        if inbound_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = pong_tx.try_send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            "Remote closed channel: {:?}",
                            frame.map(|f| f.reason.to_string())
                        );
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        debug!("Ignoring text message ({} bytes)", text.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket read error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            trace!("Channel reader finished");
        });

        Ok(RemoteChannel::new(outbound_tx, inbound_rx, shutdown))
    }
}
