//! WebSocket transport over axum.
//!
//! Every socket on `GET /ws` is a new user with a random id. Text frames
//! carry RPC requests and their JSON responses. Notifications are JSON
//! `{event, data}` unless the payload is binary, in which case the frame is
//! `[name length: u8][name][payload]`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::Method;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use petfeeder_shared::protocol::{Payload, RpcResponse};
use petfeeder_shared::types::{Connection, TransportClass, UserId};

use super::{Transport, TransportEvent};
use crate::error::TransportError;

pub const CLASS: &str = "WebSocketTransport";

/// Outgoing frames queued per client. Binary chunks beyond this are dropped,
/// any other frame evicts the client.
const CLIENT_BUFFER: usize = 256;

type Clients = Arc<RwLock<HashMap<UserId, mpsc::Sender<Message>>>>;

pub struct WebSocketTransport {
    addr: SocketAddr,
    web_root: Option<PathBuf>,
    clients: Clients,
    bound: StdMutex<Option<SocketAddr>>,
}

#[derive(Clone)]
struct AppState {
    clients: Clients,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct Notification<'a> {
    event: &'a str,
    data: Value,
}

impl WebSocketTransport {
    pub fn new(addr: SocketAddr, web_root: Option<PathBuf>) -> Self {
        Self {
            addr,
            web_root,
            clients: Arc::new(RwLock::new(HashMap::new())),
            bound: StdMutex::new(None),
        }
    }

    /// Address actually listened on, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn router(&self, events: mpsc::Sender<TransportEvent>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any);

        let state = AppState {
            clients: Arc::clone(&self.clients),
            events,
        };

        let mut router = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_check))
            .with_state(state);

        if let Some(root) = &self.web_root {
            router = router.fallback_service(ServeDir::new(root));
        }

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    async fn sender_for(&self, user: &UserId) -> Result<mpsc::Sender<Message>, TransportError> {
        self.clients
            .read()
            .await
            .get(user)
            .cloned()
            .ok_or_else(|| TransportError::UnknownUser(user.clone()))
    }
}

/// `[name length: u8][name][payload]`. Names are cut at 255 bytes.
pub fn encode_binary(event: &str, payload: &[u8]) -> Vec<u8> {
    let name = &event.as_bytes()[..event.len().min(u8::MAX as usize)];
    let mut frame = Vec::with_capacity(1 + name.len() + payload.len());
    frame.push(name.len() as u8);
    frame.extend_from_slice(name);
    frame.extend_from_slice(payload);
    frame
}

fn encode_notification(event: &str, payload: &Payload) -> Result<Message, TransportError> {
    Ok(match payload {
        Payload::Binary(bytes) => Message::Binary(encode_binary(event, bytes)),
        other => Message::Text(serde_json::to_string(&Notification {
            event,
            data: other.to_json(),
        })?),
    })
}

/// Never waits on the client's queue. A lagging client loses binary chunks;
/// when the queue is full for any other frame the client is evicted.
async fn deliver(
    clients: &Clients,
    user: &UserId,
    tx: &mpsc::Sender<Message>,
    message: Message,
) -> Result<(), TransportError> {
    let binary = matches!(message, Message::Binary(_));
    match tx.try_send(message) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) if binary => {
            debug!(user = %user.short(), "client lagging, binary frame dropped");
            Ok(())
        }
        Err(TrySendError::Full(_)) => {
            warn!(user = %user.short(), "client queue full, evicting");
            clients.write().await.remove(user);
            Err(TransportError::Lagging(user.clone()))
        }
        Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
    }
}

async fn register_client(clients: &Clients, user: UserId) -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
    clients.write().await.insert(user, tx);
    rx
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn class(&self) -> TransportClass {
        TransportClass::new(CLASS)
    }

    async fn run(&self, events: mpsc::Sender<TransportEvent>) -> Result<(), TransportError> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        *self.bound.lock().unwrap_or_else(|p| p.into_inner()) = Some(local);

        let app = self.router(events);
        info!(addr = %local, web_root = ?self.web_root, "WebSocket transport listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "HTTP server failed");
            }
        });
        Ok(())
    }

    async fn notify(
        &self,
        event: &str,
        payload: &Payload,
        user: Option<&UserId>,
    ) -> Result<(), TransportError> {
        let message = encode_notification(event, payload)?;

        match user {
            Some(user) => {
                let tx = self.sender_for(user).await?;
                deliver(&self.clients, user, &tx, message).await
            }
            None => {
                let targets: Vec<_> = self
                    .clients
                    .read()
                    .await
                    .iter()
                    .map(|(user, tx)| (user.clone(), tx.clone()))
                    .collect();
                for (user, tx) in targets {
                    // One closed or stalled socket must not hide the event from the rest.
                    let _ = deliver(&self.clients, &user, &tx, message.clone()).await;
                }
                Ok(())
            }
        }
    }

    async fn respond(&self, user: &UserId, response: RpcResponse) -> Result<(), TransportError> {
        let text = serde_json::to_string(&response)?;
        let tx = self.sender_for(user).await?;
        deliver(&self.clients, user, &tx, Message::Text(text)).await
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let user = UserId::generate();
    let connection = Connection::new(TransportClass::new(CLASS), user.clone());
    let (mut sink, mut stream) = socket.split();

    let mut outgoing = register_client(&state.clients, user.clone()).await;
    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    if state
        .events
        .send(TransportEvent::UserConnect(connection.clone()))
        .await
        .is_err()
    {
        warn!(user = %user, "server is not listening, closing socket");
        state.clients.write().await.remove(&user);
        writer.abort();
        return;
    }

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(payload) => {
                    let event = TransportEvent::RpcRequest {
                        connection: connection.clone(),
                        payload,
                    };
                    if state.events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(user = %user.short(), error = %e, "unparseable frame");
                    let reply = RpcResponse::Failure {
                        id: 0,
                        error: format!("Invalid RPC request: {e}"),
                    };
                    let tx = state.clients.read().await.get(&user).cloned();
                    if let (Ok(text), Some(tx)) = (serde_json::to_string(&reply), tx) {
                        let _ = deliver(&state.clients, &user, &tx, Message::Text(text)).await;
                    }
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(user = %user.short(), error = %e, "socket error");
                break;
            }
        }
    }

    // Dropping the last sender lets the writer flush and stop.
    state.clients.write().await.remove(&user);
    let _ = state
        .events
        .send(TransportEvent::UserDisconnect(connection))
        .await;
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use petfeeder_shared::protocol::events;
    use serde_json::json;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn transport() -> WebSocketTransport {
        WebSocketTransport::new(([127, 0, 0, 1], 0).into(), None)
    }

    fn text(message: Message) -> Value {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn binary_framing() {
        let frame = encode_binary(events::VIDEO_STREAM, &[0, 0, 0, 1, 0x65]);
        let name_len = frame[0] as usize;
        assert_eq!(&frame[1..1 + name_len], events::VIDEO_STREAM.as_bytes());
        assert_eq!(&frame[1 + name_len..], &[0, 0, 0, 1, 0x65]);
    }

    #[tokio::test]
    async fn notifications_are_routed() {
        let t = transport();
        let mut a = register_client(&t.clients, UserId::new("a")).await;
        let mut b = register_client(&t.clients, UserId::new("b")).await;

        t.notify(events::NO_FOOD, &Payload::Empty, None).await.unwrap();
        assert_eq!(
            text(a.recv().await.unwrap()),
            json!({"event": events::NO_FOOD, "data": null})
        );
        assert_eq!(
            text(b.recv().await.unwrap()),
            json!({"event": events::NO_FOOD, "data": null})
        );

        t.notify(
            events::PICTURE,
            &Payload::Binary(Bytes::from_static(b"\xff\xd8")),
            Some(&UserId::new("b")),
        )
        .await
        .unwrap();
        assert!(a.try_recv().is_err());
        match b.recv().await.unwrap() {
            Message::Binary(frame) => assert!(frame.ends_with(b"\xff\xd8")),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_user_is_an_error() {
        let t = transport();
        let err = t
            .respond(&UserId::new("ghost"), RpcResponse::from_result(1, Ok(json!(1))))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn responses_are_json() {
        let t = transport();
        let mut a = register_client(&t.clients, UserId::new("a")).await;

        t.respond(&UserId::new("a"), RpcResponse::from_result(3, Ok(json!([1]))))
            .await
            .unwrap();
        assert_eq!(text(a.recv().await.unwrap()), json!({"id": 3, "data": [1]}));
    }

    #[tokio::test]
    async fn lagging_client_drops_binary() {
        let t = transport();
        let _slow = register_client(&t.clients, UserId::new("slow")).await;
        let user = UserId::new("slow");
        let chunk = Payload::Binary(Bytes::from_static(b"\x00\x00\x00\x01"));

        for _ in 0..CLIENT_BUFFER + 10 {
            t.notify(events::VIDEO_STREAM, &chunk, Some(&user)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn stalled_client_cannot_hold_up_broadcasts() {
        let t = transport();
        let stalled = UserId::new("stalled");
        let healthy = UserId::new("healthy");
        let _stalled_rx = register_client(&t.clients, stalled.clone()).await;
        let mut healthy_rx = register_client(&t.clients, healthy.clone()).await;
        let payload = Payload::Json(json!({"portions": 1}));

        for _ in 0..=CLIENT_BUFFER {
            tokio::time::timeout(
                Duration::from_secs(1),
                t.notify(events::CLOCK_SYNCHRONIZED, &payload, None),
            )
            .await
            .expect("broadcast waited on a stalled client")
            .unwrap();
            healthy_rx.recv().await.unwrap();
        }

        let clients = t.clients.read().await;
        assert!(!clients.contains_key(&stalled));
        assert!(clients.contains_key(&healthy));
    }

    #[tokio::test]
    async fn stalled_client_response_fails_fast() {
        let t = transport();
        let user = UserId::new("stalled");
        let _rx = register_client(&t.clients, user.clone()).await;

        for id in 0..CLIENT_BUFFER as u64 {
            t.respond(&user, RpcResponse::Success { id, data: Value::Null })
                .await
                .unwrap();
        }
        let err = t
            .respond(&user, RpcResponse::Success { id: 0, data: Value::Null })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Lagging(u) if u == user));
    }

    #[tokio::test]
    async fn health_endpoint() {
        let t = transport();
        let (tx, _rx) = mpsc::channel(8);
        t.run(tx).await.unwrap();
        let addr = t.local_addr().unwrap();

        let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        socket.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));
    }
}
