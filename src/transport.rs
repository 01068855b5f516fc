use crate::types::{AgentError, Part, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: Map<String, Value>,
}

/// Client-facing projection of a model part, or an error notice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Text {
        role: Role,
        text: String,
    },
    Call {
        role: Role,
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
    },
    Error {
        error: String,
    },
}

impl OutboundMessage {
    /// Tool responses and images are model context only and are never shown to the client.
    pub fn from_part(role: Role, part: &Part) -> Option<Self> {
        match part {
            Part::Text(text) => Some(OutboundMessage::Text { role, text: text.clone() }),
            Part::ToolInvocation { name, args } => Some(OutboundMessage::Call {
                role,
                function_call: FunctionCall { name: name.clone(), args: args.clone() },
            }),
            Part::ToolResponse { .. } | Part::Image { .. } => None,
        }
    }
}

/// Delivers coordinator output to one client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one ordered batch, the projection of a single model turn.
    async fn emit(&self, messages: &[OutboundMessage]) -> Result<(), AgentError>;

    /// A one-element batch holding `{error}`.
    async fn emit_error(&self, message: &str) -> Result<(), AgentError> {
        self.emit(&[OutboundMessage::Error { error: message.to_string() }]).await
    }
}

/// Writes JSON text frames into the outgoing half of a websocket.
#[derive(Clone)]
pub struct WsTransport {
    tx: mpsc::Sender<String>,
}

impl WsTransport {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn emit(&self, messages: &[OutboundMessage]) -> Result<(), AgentError> {
        let frame = serde_json::to_string(messages).map_err(|e| AgentError::Transport(e.to_string()))?;
        self.tx
            .send(frame)
            .await
            .map_err(|_| AgentError::Transport("client connection closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parts_project_to_wire_shapes() {
        let text = OutboundMessage::from_part(Role::Model, &Part::text("Looking at two stores")).unwrap();
        assert_eq!(serde_json::to_value(&text).unwrap(), json!({"role": "model", "text": "Looking at two stores"}));

        let call = OutboundMessage::from_part(
            Role::Model,
            &Part::invocation("web_interaction", json!({"goal": "find mice", "url": "https://a.com"})),
        )
        .unwrap();
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"role": "model", "functionCall": {"name": "web_interaction", "args": {"goal": "find mice", "url": "https://a.com"}}})
        );

        assert!(OutboundMessage::from_part(Role::User, &Part::png(vec![1])).is_none());
    }

    #[tokio::test]
    async fn ws_transport_sends_one_frame_per_batch() {
        let (tx, mut rx) = mpsc::channel(4);
        let transport = WsTransport::new(tx);
        transport
            .emit(&[OutboundMessage::Text { role: Role::Model, text: "hi".into() }])
            .await
            .unwrap();
        transport.emit_error("gateway error: quota").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), r#"[{"role":"model","text":"hi"}]"#);
        // errors travel in the same array framing as model turns
        assert_eq!(rx.recv().await.unwrap(), r#"[{"error":"gateway error: quota"}]"#);

        drop(rx);
        assert!(matches!(transport.emit(&[]).await, Err(AgentError::Transport(_))));
    }
}
