//! Listener of one forward and the sessions it accepted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::session::{BridgeSession, ForwardContext};
use crate::error::{Result, TunnelError};
use crate::protocol::{ForwardId, SessionId};

struct SessionHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type SessionMap = Arc<Mutex<HashMap<SessionId, SessionHandle>>>;

pub struct TunnelController {
    id: ForwardId,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    sessions: SessionMap,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelController {
    /// Bind the local listener and start accepting connections
    pub async fn bind(
        id: ForwardId,
        bind_address: &str,
        local_port: u16,
        ctx: Arc<ForwardContext>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", bind_address, local_port);
        let bind_error = |source| TunnelError::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = TcpListener::bind((bind_address, local_port))
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let cancel = CancellationToken::new();
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            cancel.clone(),
            Arc::clone(&sessions),
        ));

        debug!("Forward {} listening on {}", id, local_addr);

        Ok(Self {
            id,
            local_addr,
            cancel,
            sessions,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn id(&self) -> &ForwardId {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting, close every open session and release the port.
    ///
    /// A session that fails while closing does not hold up the others.
    /// Calling this more than once is harmless.
    pub async fn close(&self) {
        self.cancel.cancel();

        // The listener lives in the accept task
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }

        let sessions: Vec<(SessionId, SessionHandle)> =
            self.sessions.lock().await.drain().collect();
        for (_, handle) in &sessions {
            handle.cancel.cancel();
        }
        for (id, handle) in sessions {
            if let Err(e) = handle.task.await {
                debug!("Session {} ended abnormally: {}", id, e);
            }
        }

        debug!("Forward {} closed", self.id);
    }
}

impl Drop for TunnelController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ForwardContext>,
    cancel: CancellationToken,
    sessions: SessionMap,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            },
        };

        let id = SessionId::next();
        debug!("Accepted {} as session {}", peer, id);

        let session_cancel = cancel.child_token();

        // Held across spawn so the session's own removal can't run first
        let mut tracked = sessions.lock().await;
        let task = tokio::spawn({
            let ctx = Arc::clone(&ctx);
            let sessions = Arc::clone(&sessions);
            let cancel = session_cancel.clone();
            async move {
                let mut session = BridgeSession::new(id, ctx, cancel);
                session.run(stream).await;
                sessions.lock().await.remove(&id);
            }
        });
        tracked.insert(
            id,
            SessionHandle {
                cancel: session_cancel,
                task,
            },
        );
    }

    debug!("Listener closed");
}
