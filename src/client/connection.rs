use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::client::backoff::Backoff;
use crate::client::http_proxy::{forward, LocalTarget};
use crate::client::session::{
    SessionShared, SessionState, TunnelEvent, TunnelSession, EVENT_CAPACITY,
};
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::protocol::{ForwardedRequest, WireMessage};

/// Bound on the first connect-and-register attempt. Reconnect attempts are
/// not subject to it; backoff alone paces them.
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(15);

const OUTBOUND_CAPACITY: usize = 256;

type Ready = oneshot::Sender<Result<String, TunnelError>>;

/// Entry point: opens the control channel to the relay and hands back a
/// [`TunnelSession`] once the relay has registered the tunnel.
pub struct TunnelClient {
    config: TunnelConfig,
}

impl TunnelClient {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Connect, register, and return the session handle.
    ///
    /// Fails if the relay answers with an `error` frame, the transport
    /// drops before the first registration, or registration does not
    /// complete within [`REGISTRATION_TIMEOUT`]. After this returns `Ok`,
    /// channel loss is handled by reconnecting with backoff and is
    /// reported through session events instead of errors.
    pub async fn open(self) -> Result<TunnelSession, TunnelError> {
        let local = LocalTarget::parse(&self.config.local_host, self.config.port)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let shared = Arc::new(SessionShared::new(local.clone(), events_tx));
        let (ready_tx, ready_rx) = oneshot::channel();

        let manager = ConnectionManager {
            relay_url: self.config.relay_url(),
            local,
            shared: shared.clone(),
            backoff: Backoff::new(),
        };
        tokio::spawn(manager.run(ready_tx));

        match tokio::time::timeout(REGISTRATION_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(url))) => {
                info!("tunnel registered at {url}");
                Ok(TunnelSession::new(shared, events_rx))
            }
            Ok(Ok(Err(e))) => Err(e),
            // Manager task went away without reporting.
            Ok(Err(_)) => Err(TunnelError::ChannelClosed),
            Err(_) => {
                shared.shutdown.cancel();
                Err(TunnelError::RegistrationTimeout)
            }
        }
    }
}

/// Why one control channel ended.
enum LinkOutcome {
    /// `close()` was requested. Terminal.
    Stopped,
    /// The relay sent an `error` frame. Terminal, never retried.
    Rejected(String),
    /// Transport-level loss. Retried with backoff once registered,
    /// fatal before the first registration.
    Lost(TunnelError),
}

/// Owns the control-channel lifecycle: connect, register, receive,
/// reconnect with backoff, teardown.
struct ConnectionManager {
    relay_url: String,
    local: LocalTarget,
    shared: Arc<SessionShared>,
    backoff: Backoff,
}

impl ConnectionManager {
    async fn run(mut self, ready: Ready) {
        let mut ready = Some(ready);

        loop {
            self.shared.set_state(SessionState::Connecting).await;

            match self.serve_channel(&mut ready).await {
                LinkOutcome::Stopped => {
                    info!("tunnel closed");
                    break;
                }
                LinkOutcome::Rejected(message) => {
                    error!("relay rejected the tunnel: {message}");
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(TunnelError::Rejected { message }));
                    }
                    break;
                }
                LinkOutcome::Lost(err) => {
                    // Before the first registration a transport fault is
                    // fatal and belongs to whoever requested the tunnel.
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(err));
                        break;
                    }

                    let delay = self.backoff.next_delay();
                    warn!("control channel lost: {err}; reconnecting in {delay:?}");
                    self.shared.set_state(SessionState::Connecting).await;
                    self.shared
                        .emit(TunnelEvent::Reconnecting {
                            attempt: self.backoff.attempts(),
                        })
                        .await;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shared.shutdown.cancelled() => break,
                    }
                }
            }
        }

        self.shared.set_state(SessionState::Closed).await;
        self.shared.emit(TunnelEvent::Closed).await;
    }

    /// Drive one control channel from connect to its end.
    async fn serve_channel(&mut self, ready: &mut Option<Ready>) -> LinkOutcome {
        info!("connecting to {}", self.relay_url);
        let (ws_stream, _) = match connect_async(&self.relay_url).await {
            Ok(conn) => conn,
            Err(e) => return LinkOutcome::Lost(e.into()),
        };
        self.shared.set_state(SessionState::Open).await;

        let (write, mut read) = ws_stream.split();

        // Single writer task owns the sink half. Forward results and pong
        // replies funnel through this channel; once the channel is gone,
        // sends fail and late responses are simply dropped.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let shutdown = self.shared.shutdown.clone();
        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break LinkOutcome::Stopped,
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(outcome) = self.handle_frame(&text, ready, &out_tx).await {
                            break outcome;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        debug!("ping from relay");
                        let _ = out_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(
                            "relay closed the channel: {:?}",
                            frame.map(|f| f.reason.to_string())
                        );
                        break LinkOutcome::Lost(TunnelError::ChannelClosed);
                    }
                    Some(Ok(_)) => debug!("ignoring non-text frame"),
                    Some(Err(e)) => break LinkOutcome::Lost(e.into()),
                    None => break LinkOutcome::Lost(TunnelError::ChannelClosed),
                }
            }
        };

        drop(out_tx);
        let _ = writer.await;
        outcome
    }

    /// Handle one decoded frame. `Some` ends the channel.
    async fn handle_frame(
        &mut self,
        text: &str,
        ready: &mut Option<Ready>,
        out_tx: &mpsc::Sender<Message>,
    ) -> Option<LinkOutcome> {
        match WireMessage::decode(text) {
            Some(WireMessage::Registered { subdomain, url }) => {
                info!("registered as {subdomain}: {url}");
                self.backoff.reset();
                self.shared.set_url(url.clone()).await;
                self.shared.set_state(SessionState::Registered).await;
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(url.clone()));
                }
                self.shared.emit(TunnelEvent::Registered { url }).await;
                None
            }
            Some(WireMessage::Error { message }) => Some(LinkOutcome::Rejected(message)),
            Some(WireMessage::Request {
                request_id,
                method,
                path,
                headers,
                body,
            }) => {
                match ForwardedRequest::from_frame(request_id, method, path, headers, &body) {
                    Some(request) => self.dispatch(request, out_tx).await,
                    None => debug!("dropping request frame with undecodable body"),
                }
                None
            }
            // response frames only ever flow client -> relay
            Some(WireMessage::Response { request_id, .. }) => {
                debug!("ignoring inbound response frame for {request_id}");
                None
            }
            None => {
                debug!("dropping malformed frame");
                None
            }
        }
    }

    /// Record the request and forward it on its own task. Responses go
    /// back in completion order; correlation is by request id only.
    async fn dispatch(&self, request: ForwardedRequest, out_tx: &mpsc::Sender<Message>) {
        debug!(
            "{} {} -> {}",
            request.method,
            request.path,
            self.local.authority()
        );
        self.shared.replay.lock().await.record(request.clone());

        let target = self.local.clone();
        let shared = self.shared.clone();
        let out_tx = out_tx.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let response = forward(&target, &request).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            shared
                .emit(TunnelEvent::RequestCompleted {
                    method: request.method.clone(),
                    path: request.path.clone(),
                    status: response.status,
                    duration_ms,
                })
                .await;

            match WireMessage::response(&response).encode() {
                Ok(json) => {
                    let _ = out_tx.send(Message::Text(json)).await;
                }
                Err(e) => warn!("failed to encode response frame: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::spawn_echo_service;
    use crate::protocol::{decode_body, encode_body};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const REGISTERED_FRAME: &str =
        r#"{"type":"registered","subdomain":"abc123","url":"https://abc123.example.dev"}"#;

    fn test_config(port: u16, relay_addr: std::net::SocketAddr) -> TunnelConfig {
        TunnelConfig {
            port,
            local_host: "127.0.0.1".to_string(),
            relay: format!("ws://{relay_addr}/register"),
        }
    }

    async fn expect_event(session: &mut TunnelSession) -> TunnelEvent {
        tokio::time::timeout(Duration::from_secs(10), session.next_event())
            .await
            .expect("timed out waiting for session event")
            .expect("event stream ended unexpectedly")
    }

    #[tokio::test]
    async fn registers_and_exposes_url() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = relay.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(REGISTERED_FRAME.to_string()))
                .await
                .unwrap();
            while ws.next().await.is_some() {}
        });

        let mut session = TunnelClient::new(test_config(3000, relay_addr))
            .open()
            .await
            .unwrap();

        assert_eq!(session.url().await, "https://abc123.example.dev");
        assert_eq!(session.state().await, SessionState::Registered);
        match expect_event(&mut session).await {
            TunnelEvent::Registered { url } => assert_eq!(url, "https://abc123.example.dev"),
            other => panic!("unexpected event: {:?}", other),
        }

        session.close();
        match expect_event(&mut session).await {
            TunnelEvent::Closed => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn relay_error_before_registration_is_fatal() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = relay.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"error","message":"quota exceeded"}"#.to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let err = TunnelClient::new(test_config(3000, relay_addr))
            .open()
            .await
            .unwrap_err();

        assert!(matches!(err, TunnelError::Rejected { .. }));
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn forwards_relay_requests_to_local_service() {
        let local_addr = spawn_echo_service().await;

        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = relay.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(REGISTERED_FRAME.to_string()))
                .await
                .unwrap();

            let request_frame = format!(
                r#"{{"type":"request","requestId":"req-42","method":"POST","path":"/echo","headers":{{"x-probe":"1"}},"body":"{}"}}"#,
                encode_body(b"hello")
            );
            ws.send(Message::Text(request_frame)).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = reply_tx.send(text);
                    break;
                }
            }
        });

        let mut session = TunnelClient::new(test_config(local_addr.port(), relay_addr))
            .open()
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(10), reply_rx)
            .await
            .expect("timed out waiting for response frame")
            .unwrap();
        match WireMessage::decode(&reply) {
            Some(WireMessage::Response {
                request_id,
                status,
                body,
                ..
            }) => {
                assert_eq!(request_id.0, "req-42");
                assert_eq!(status, 200);
                assert_eq!(decode_body(&body).unwrap(), b"hello");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        match expect_event(&mut session).await {
            TunnelEvent::Registered { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
        match expect_event(&mut session).await {
            TunnelEvent::RequestCompleted {
                method,
                path,
                status,
                ..
            } => {
                assert_eq!(method, "POST");
                assert_eq!(path, "/echo");
                assert_eq!(status, 200);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        session.close();
    }

    #[tokio::test]
    async fn reconnects_after_channel_loss() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(async move {
            // First channel: register, then drop it.
            let (stream, _) = relay.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(REGISTERED_FRAME.to_string()))
                .await
                .unwrap();
            drop(ws);

            // Second channel: register under a new subdomain and stay up.
            let (stream, _) = relay.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"registered","subdomain":"xyz789","url":"https://xyz789.example.dev"}"#
                    .to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let mut session = TunnelClient::new(test_config(3000, relay_addr))
            .open()
            .await
            .unwrap();

        match expect_event(&mut session).await {
            TunnelEvent::Registered { url } => assert_eq!(url, "https://abc123.example.dev"),
            other => panic!("unexpected event: {:?}", other),
        }
        match expect_event(&mut session).await {
            TunnelEvent::Reconnecting { attempt } => assert_eq!(attempt, 1),
            other => panic!("unexpected event: {:?}", other),
        }
        match expect_event(&mut session).await {
            TunnelEvent::Registered { url } => assert_eq!(url, "https://xyz789.example.dev"),
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(session.url().await, "https://xyz789.example.dev");
        assert_eq!(session.state().await, SessionState::Registered);
        session.close();
    }

    #[tokio::test]
    async fn relay_error_after_registration_closes_without_retry() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = relay.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(REGISTERED_FRAME.to_string()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"type":"error","message":"tunnel evicted"}"#.to_string(),
            ))
            .await
            .unwrap();
            while ws.next().await.is_some() {}
        });

        let mut session = TunnelClient::new(test_config(3000, relay_addr))
            .open()
            .await
            .unwrap();

        match expect_event(&mut session).await {
            TunnelEvent::Registered { .. } => {}
            other => panic!("unexpected event: {:?}", other),
        }
        // No Reconnecting in between: an error frame is never retried.
        match expect_event(&mut session).await {
            TunnelEvent::Closed => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn answers_pings_with_pongs() {
        let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();
        let (pong_tx, pong_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = relay.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(REGISTERED_FRAME.to_string()))
                .await
                .unwrap();
            ws.send(Message::Ping(vec![1, 2, 3])).await.unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Pong(data) = msg {
                    let _ = pong_tx.send(data);
                    break;
                }
            }
        });

        let session = TunnelClient::new(test_config(3000, relay_addr))
            .open()
            .await
            .unwrap();

        let pong = tokio::time::timeout(Duration::from_secs(10), pong_rx)
            .await
            .expect("timed out waiting for pong")
            .unwrap();
        assert_eq!(pong, vec![1, 2, 3]);
        session.close();
    }
}
