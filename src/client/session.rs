use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::client::http_proxy::{forward, LocalTarget};
use crate::client::replay::ReplayBuffer;
use crate::protocol::RequestId;

pub(crate) const EVENT_CAPACITY: usize = 64;

/// Lifecycle of a tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Registered,
    Closed,
}

/// Events delivered to the session's subscriber.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The relay registered (or re-registered) the tunnel at this URL.
    Registered { url: String },
    /// A forwarded request completed, successfully or synthesized.
    RequestCompleted {
        method: String,
        path: String,
        status: u16,
        duration_ms: u64,
    },
    /// The control channel was lost after registration; a reconnect is
    /// scheduled. Non-fatal.
    Reconnecting { attempt: u32 },
    /// The session is terminal. No further events follow.
    Closed,
}

/// State shared between the connection manager and the session handle.
pub(crate) struct SessionShared {
    pub(crate) url: RwLock<String>,
    pub(crate) state: RwLock<SessionState>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) replay: Mutex<ReplayBuffer>,
    pub(crate) local: LocalTarget,
    pub(crate) events: mpsc::Sender<TunnelEvent>,
}

impl SessionShared {
    pub(crate) fn new(local: LocalTarget, events: mpsc::Sender<TunnelEvent>) -> Self {
        Self {
            url: RwLock::new(String::new()),
            state: RwLock::new(SessionState::Idle),
            shutdown: CancellationToken::new(),
            replay: Mutex::new(ReplayBuffer::new()),
            local,
            events,
        }
    }

    pub(crate) async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    pub(crate) async fn set_url(&self, url: String) {
        *self.url.write().await = url;
    }

    pub(crate) async fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event).await;
    }
}

/// Handle to an open tunnel, returned once the relay has registered it.
///
/// Dropping the handle does not tear the tunnel down; call [`close`].
///
/// [`close`]: TunnelSession::close
pub struct TunnelSession {
    shared: Arc<SessionShared>,
    events: mpsc::Receiver<TunnelEvent>,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession").finish_non_exhaustive()
    }
}

impl TunnelSession {
    pub(crate) fn new(shared: Arc<SessionShared>, events: mpsc::Receiver<TunnelEvent>) -> Self {
        Self { shared, events }
    }

    /// Public URL of the tunnel. Empty until registered.
    pub async fn url(&self) -> String {
        self.shared.url.read().await.clone()
    }

    pub async fn state(&self) -> SessionState {
        *self.shared.state.read().await
    }

    /// Next lifecycle event, or `None` once the session is closed and the
    /// event stream has drained.
    pub async fn next_event(&mut self) -> Option<TunnelEvent> {
        self.events.recv().await
    }

    /// Tear down the control channel and suppress further reconnects.
    /// Idempotent; calling after the session is closed is a no-op.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    /// Re-issue the most recently forwarded request against the local
    /// service, without relay involvement. Completion is reported as a
    /// normal `RequestCompleted` event. Returns the replay's fresh id, or
    /// `None` if nothing has been forwarded yet.
    pub async fn replay_last(&self) -> Option<RequestId> {
        let request = {
            let buffer = self.shared.replay.lock().await;
            ReplayBuffer::replayable(buffer.latest()?)
        };

        let request_id = request.request_id.clone();
        let target = self.shared.local.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let response = forward(&target, &request).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            shared
                .emit(TunnelEvent::RequestCompleted {
                    method: request.method,
                    path: request.path,
                    status: response.status,
                    duration_ms,
                })
                .await;
        });

        Some(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::spawn_echo_service;
    use crate::protocol::{ForwardedRequest, Headers};

    fn session_pair() -> (TunnelSession, Arc<SessionShared>) {
        let local = LocalTarget::parse("127.0.0.1", 9).unwrap();
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let shared = Arc::new(SessionShared::new(local, tx));
        (TunnelSession::new(shared.clone(), rx), shared)
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, shared) = session_pair();
        session.close();
        session.close();
        assert!(shared.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn replay_with_empty_buffer_is_none() {
        let (session, _shared) = session_pair();
        assert!(session.replay_last().await.is_none());
    }

    #[tokio::test]
    async fn replay_reissues_latest_request() {
        let addr = spawn_echo_service().await;
        let local = LocalTarget::parse("127.0.0.1", addr.port()).unwrap();
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let shared = Arc::new(SessionShared::new(local, tx));
        let mut session = TunnelSession::new(shared.clone(), rx);

        let recorded = ForwardedRequest {
            request_id: RequestId::from("orig-1".to_string()),
            method: "POST".to_string(),
            path: "/echo".to_string(),
            headers: Headers::new(),
            body: b"again".to_vec(),
        };
        shared.replay.lock().await.record(recorded);

        let replay_id = session.replay_last().await.unwrap();
        assert_ne!(replay_id.0, "orig-1");

        match session.next_event().await {
            Some(TunnelEvent::RequestCompleted {
                method,
                path,
                status,
                ..
            }) => {
                assert_eq!(method, "POST");
                assert_eq!(path, "/echo");
                assert_eq!(status, 200);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
