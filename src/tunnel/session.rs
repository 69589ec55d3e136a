//! One bridged local connection.
//!
//! A session owns the accepted local socket and at most one remote channel
//! at a time. It moves through `Connecting -> Open -> DataFlowing ->
//! Closing -> Closed`, going back to `Connecting` while the remote side
//! keeps closing before any data was exchanged and attempts remain.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::traffic::TrafficMeter;
use super::transport::{ChannelConnector, ChannelTarget, RemoteChannel};
use crate::config::FailureResponse;
use crate::error::{Result, TunnelError};
use crate::kube::CredentialResolver;
use crate::protocol::frame::{self, Frame};
use crate::protocol::SessionId;

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub response_timeout: Duration,
    pub retry_delay: Duration,
    pub open_timeout: Duration,
    pub max_attempts: u32,
    pub failure_response: FailureResponse,
}

/// Everything sessions of one forward share
pub struct ForwardContext {
    pub project: String,
    pub context: String,
    pub namespace: String,
    pub target: String,
    pub remote_port: u16,
    pub resolver: Arc<CredentialResolver>,
    pub connector: Arc<dyn ChannelConnector>,
    pub meter: Arc<TrafficMeter>,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    DataFlowing,
    Closing,
    Closed,
}

/// Why a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// Stopped by its controller
    Stopped,
    LocalClosed,
    LocalError(TunnelError),
    /// Remote side closed after data was exchanged
    RemoteClosed,
    /// Attempts exhausted, response timeout or a non-retryable failure
    Failed(TunnelError),
}

impl SessionEnd {
    fn local_error(e: io::Error) -> Self {
        SessionEnd::LocalError(TunnelError::LocalSocket(e))
    }

    /// Status line written to the local client on forced teardown
    fn failure_status(&self) -> Option<&'static str> {
        match self {
            SessionEnd::Failed(TunnelError::ResponseTimeout(_)) => Some("504 Gateway Timeout"),
            SessionEnd::Failed(_) => Some("502 Bad Gateway"),
            _ => None,
        }
    }
}

pub struct BridgeSession {
    id: SessionId,
    ctx: Arc<ForwardContext>,
    cancel: CancellationToken,
    state: SessionState,
    /// First stream-0 message of the current connection has been seen
    primed: bool,
    /// A deliverable payload reached the local side
    data_exchanged: bool,
    attempts: u32,
    /// Framed local chunks not yet handed to a channel
    pending: VecDeque<Vec<u8>>,
    /// Chunks sent on the current channel before any answer, replayed on retry
    unanswered: Vec<Vec<u8>>,
    response_deadline: Option<Instant>,
}

/// How one pass over an open channel ended
enum PumpEnd {
    Session(SessionEnd),
    RemoteClosed,
}

impl BridgeSession {
    pub fn new(id: SessionId, ctx: Arc<ForwardContext>, cancel: CancellationToken) -> Self {
        Self {
            id,
            ctx,
            cancel,
            state: SessionState::Connecting,
            primed: false,
            data_exchanged: false,
            attempts: 0,
            pending: VecDeque::new(),
            unanswered: Vec::new(),
            response_deadline: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Bridge `local` until either side ends, then close both.
    pub async fn run(&mut self, mut local: TcpStream) -> SessionEnd {
        let end = self.bridge(&mut local).await;
        self.finish(&mut local, &end).await;
        end
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            trace!("Session {}: {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    async fn bridge(&mut self, local: &mut TcpStream) -> SessionEnd {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            self.set_state(SessionState::Connecting);
            let mut channel = match self.connect(local, &mut buf).await {
                Ok(channel) => channel,
                Err(end) => return end,
            };
            self.set_state(SessionState::Open);
            self.response_deadline = None;

            match self.pump(local, &mut channel, &mut buf).await {
                PumpEnd::Session(end) => return end,
                PumpEnd::RemoteClosed if self.data_exchanged => {
                    debug!("Session {}: remote closed", self.id);
                    return SessionEnd::RemoteClosed;
                }
                PumpEnd::RemoteClosed => {
                    if self.attempts >= self.ctx.settings.max_attempts {
                        return SessionEnd::Failed(TunnelError::Transport(format!(
                            "Remote closed before any data after {} attempts",
                            self.attempts
                        )));
                    }
                    debug!(
                        "Session {}: remote closed before any data (attempt {}/{})",
                        self.id, self.attempts, self.ctx.settings.max_attempts
                    );
                    self.requeue_unanswered();
                }
            }
        }
    }

    /// Open a channel, retrying within the attempt budget. Local data read
    /// meanwhile is queued in `pending`.
    async fn connect(
        &mut self,
        local: &mut TcpStream,
        buf: &mut [u8],
    ) -> std::result::Result<RemoteChannel, SessionEnd> {
        let cancel = self.cancel.clone();

        loop {
            if cancel.is_cancelled() {
                return Err(SessionEnd::Stopped);
            }

            self.attempts += 1;
            self.primed = false;
            let delay = (self.attempts > 1).then_some(self.ctx.settings.retry_delay);

            let open = open_channel(Arc::clone(&self.ctx), cancel.clone(), delay);
            tokio::pin!(open);

            let result = loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => return Err(SessionEnd::Stopped),

                    result = &mut open => break result,

                    read = local.read(buf) => match read {
                        Ok(0) => return Err(SessionEnd::LocalClosed),
                        Ok(n) => self.pending.push_back(frame::encode_data(&buf[..n])),
                        Err(e) => return Err(SessionEnd::local_error(e)),
                    },
                }
            };

            match result {
                Ok(channel) => return Ok(channel),
                Err(TunnelError::Cancelled) => return Err(SessionEnd::Stopped),
                Err(e) if e.is_retryable() && self.attempts < self.ctx.settings.max_attempts => {
                    warn!(
                        "Session {}: attempt {}/{} failed: {}",
                        self.id, self.attempts, self.ctx.settings.max_attempts, e
                    );
                }
                Err(e) => return Err(SessionEnd::Failed(e)),
            }
        }
    }

    async fn pump(
        &mut self,
        local: &mut TcpStream,
        channel: &mut RemoteChannel,
        buf: &mut [u8],
    ) -> PumpEnd {
        // Flush what arrived while connecting
        while let Some(message) = self.pending.pop_front() {
            if let Err(message) = self.send(channel, message).await {
                self.pending.push_front(message);
                return PumpEnd::RemoteClosed;
            }
        }

        let cancel = self.cancel.clone();

        loop {
            let deadline = self.response_deadline;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => return PumpEnd::Session(SessionEnd::Stopped),

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return PumpEnd::Session(SessionEnd::Failed(TunnelError::ResponseTimeout(
                        self.ctx.settings.response_timeout,
                    )));
                }

                message = channel.inbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = self.deliver(local, &message).await {
                            return PumpEnd::Session(SessionEnd::local_error(e));
                        }
                    }
                    None => return PumpEnd::RemoteClosed,
                },

                read = local.read(buf) => match read {
                    Ok(0) => return PumpEnd::Session(SessionEnd::LocalClosed),
                    Ok(n) => {
                        let message = frame::encode_data(&buf[..n]);
                        if let Err(message) = self.send(channel, message).await {
                            self.pending.push_back(message);
                            return PumpEnd::RemoteClosed;
                        }
                    }
                    Err(e) => return PumpEnd::Session(SessionEnd::local_error(e)),
                },
            }
        }
    }

    /// Hand one framed chunk to the channel; gives the chunk back on failure
    async fn send(
        &mut self,
        channel: &RemoteChannel,
        message: Vec<u8>,
    ) -> std::result::Result<(), Vec<u8>> {
        let len = message.len();
        let replay = (!self.data_exchanged).then(|| message.clone());
        channel.outbound.send(message).await.map_err(|e| e.0)?;

        self.unanswered.extend(replay);
        self.ctx.meter.record(&self.ctx.project, len).await;
        self.set_state(SessionState::DataFlowing);
        if self.response_deadline.is_none() {
            self.response_deadline = Some(Instant::now() + self.ctx.settings.response_timeout);
        }
        Ok(())
    }

    async fn deliver(&mut self, local: &mut TcpStream, message: &[u8]) -> io::Result<()> {
        self.ctx.meter.record(&self.ctx.project, message.len()).await;

        let Some(frame) = Frame::decode(message) else {
            return Ok(());
        };

        if !frame.is_data() {
            trace!(
                "Session {}: {} bytes on stream {}",
                self.id,
                frame.payload.len(),
                frame.stream
            );
            return Ok(());
        }

        if !self.primed {
            self.primed = true;
            return Ok(());
        }

        self.response_deadline = None;
        local.write_all(frame.payload).await?;
        self.data_exchanged = true;
        self.unanswered.clear();
        self.set_state(SessionState::DataFlowing);
        Ok(())
    }

    /// Put chunks the closed channel never answered ahead of anything still queued
    fn requeue_unanswered(&mut self) {
        for message in self.unanswered.drain(..).rev() {
            self.pending.push_front(message);
        }
    }

    async fn finish(&mut self, local: &mut TcpStream, end: &SessionEnd) {
        self.set_state(SessionState::Closing);

        match end {
            SessionEnd::Stopped | SessionEnd::LocalClosed | SessionEnd::RemoteClosed => {
                debug!("Session {} closed: {:?}", self.id, end);
            }
            SessionEnd::LocalError(e) => debug!("Session {}: {}", self.id, e),
            SessionEnd::Failed(e @ TunnelError::ResponseTimeout(_)) => {
                info!("Session {}: {}", self.id, e);
            }
            SessionEnd::Failed(e) => warn!("Session {} failed: {}", self.id, e),
        }

        match (end.failure_status(), self.ctx.settings.failure_response) {
            (Some(status), FailureResponse::Http) => {
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = local.write_all(response.as_bytes()).await;
                let _ = local.shutdown().await;
            }
            // Zero linger turns the close into a reset
            (Some(_), FailureResponse::Reset) => {
                #[allow(deprecated)]
                let _ = local.set_linger(Some(Duration::ZERO));
            }
            (None, _) => {
                let _ = local.shutdown().await;
            }
        }

        self.set_state(SessionState::Closed);
    }
}

async fn open_channel(
    ctx: Arc<ForwardContext>,
    cancel: CancellationToken,
    delay: Option<Duration>,
) -> Result<RemoteChannel> {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    // A stop may land while we slept
    if cancel.is_cancelled() {
        return Err(TunnelError::Cancelled);
    }

    let target = ChannelTarget {
        credentials: ctx.resolver.resolve(&ctx.context)?,
        namespace: ctx.namespace.clone(),
        pod: ctx.target.clone(),
        port: ctx.remote_port,
    };

    timeout(ctx.settings.open_timeout, ctx.connector.connect(&target))
        .await
        .map_err(|_| {
            TunnelError::Transport(format!(
                "Channel did not open within {:?}",
                ctx.settings.open_timeout
            ))
        })?
}
