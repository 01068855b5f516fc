use crate::coordinator::Coordinator;
use crate::session::SessionStore;
use crate::transport::{Transport, WsTransport};
use crate::types::AgentError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use nanoid::nanoid;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub sessions: Arc<SessionStore>,
}

/// A chat message from the client. Without `uid` the connection's own id is used.
#[derive(Debug, Deserialize)]
pub struct Inbound {
    #[serde(default)]
    pub uid: Option<String>,
    pub text: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html("<h1>webcrew</h1><p>Connect a websocket to <code>/ws</code>.</p>")
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });
    let mut conn = Connection::new(WsTransport::new(tx));
    info!(connection = %conn.id, "client connected");

    while let Some(msg) = ws_receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(connection = %conn.id, error = %e, "websocket receive error");
                break;
            }
        };
        if conn.on_frame(&state, &text).await.is_err() {
            break;
        }
    }

    conn.close(&state).await;
    send_task.abort();
}

/// Per-socket state: its id, its outgoing half and the sessions it created.
struct Connection {
    id: String,
    transport: WsTransport,
    owned: HashSet<String>,
}

impl Connection {
    fn new(transport: WsTransport) -> Self {
        Self { id: nanoid!(), transport, owned: HashSet::new() }
    }

    /// Handles one text frame. Fails only when the client can no longer be reached.
    async fn on_frame(&mut self, state: &AppState, text: &str) -> Result<(), AgentError> {
        let inbound: Inbound = match serde_json::from_str(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!(connection = %self.id, error = %e, "unparseable client frame");
                return self.transport.emit_error("invalid json").await;
            }
        };

        let uid = inbound.uid.unwrap_or_else(|| self.id.clone());
        let (session, created) = state.sessions.create(&uid).await;
        if created {
            self.owned.insert(uid.clone());
        }
        let mut session = session.lock().await;
        if let Err(e) = state.coordinator.handle_message(&mut session, &inbound.text, &self.transport).await {
            warn!(client = %uid, error = %e, "message handling failed");
        }
        Ok(())
    }

    /// Drops the sessions this connection created; sessions it only joined stay.
    async fn close(self, state: &AppState) {
        for uid in &self.owned {
            state.sessions.evict(uid).await;
        }
        info!(connection = %self.id, sessions = self.owned.len(), "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakePages, ScriptedGateway};
    use crate::types::Part;
    use crate::CoordinatorConfig;

    fn state(gateway: ScriptedGateway) -> AppState {
        let coordinator = Coordinator::new(Arc::new(gateway), Arc::new(FakePages::new()), CoordinatorConfig::default());
        AppState { coordinator: Arc::new(coordinator), sessions: Arc::new(SessionStore::new()) }
    }

    #[tokio::test]
    async fn invalid_frames_get_an_error_and_the_connection_keeps_going() {
        let state = state(ScriptedGateway::new().reply(vec![Part::text("hello")]));
        let (tx, mut rx) = mpsc::channel(8);
        let mut conn = Connection::new(WsTransport::new(tx));

        conn.on_frame(&state, "not json").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), r#"[{"error":"invalid json"}]"#);

        conn.on_frame(&state, r#"{"uid": "alice", "text": "hi"}"#).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), r#"[{"role":"model","text":"hello"}]"#);
    }

    #[tokio::test]
    async fn frames_without_uid_use_the_connection_id() {
        let state = state(ScriptedGateway::new().reply(vec![Part::text("hello")]));
        let (tx, _rx) = mpsc::channel(8);
        let mut conn = Connection::new(WsTransport::new(tx));

        conn.on_frame(&state, r#"{"text": "hi"}"#).await.unwrap();

        let session = state.sessions.lookup(&conn.id).await.expect("session keyed by connection id");
        assert_eq!(session.lock().await.history().len(), 2);
        assert_eq!(state.sessions.len().await, 1);
    }

    #[tokio::test]
    async fn closing_evicts_only_the_sessions_the_connection_created() {
        let state = state(
            ScriptedGateway::new()
                .reply(vec![Part::text("hi carol")])
                .reply(vec![Part::text("hi bob")]),
        );
        state.sessions.create("bob").await;
        let (tx, _rx) = mpsc::channel(8);
        let mut conn = Connection::new(WsTransport::new(tx));

        conn.on_frame(&state, r#"{"uid": "carol", "text": "hi"}"#).await.unwrap();
        conn.on_frame(&state, r#"{"uid": "bob", "text": "hi"}"#).await.unwrap();
        conn.close(&state).await;

        assert!(state.sessions.lookup("carol").await.is_none());
        assert!(state.sessions.lookup("bob").await.is_some());
    }

    #[tokio::test]
    async fn a_gone_client_stops_the_frame_loop() {
        let state = state(ScriptedGateway::new());
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let mut conn = Connection::new(WsTransport::new(tx));
        assert!(matches!(conn.on_frame(&state, "{").await, Err(AgentError::Transport(_))));
    }
}
