use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ========================= Conversation =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One piece of a turn. Models answer with `Text` and `ToolInvocation`;
/// `ToolResponse` and `Image` only ever travel towards the model.
#[derive(Clone, Debug, PartialEq)]
pub enum Part {
    Text(String),
    ToolInvocation { name: String, args: Map<String, Value> },
    ToolResponse { name: String, response: Value },
    Image { mime_type: String, data: Vec<u8> },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    /// Builds an invocation; non-object `args` collapse to an empty map.
    pub fn invocation(name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Part::ToolInvocation { name: name.into(), args }
    }

    pub fn png(data: Vec<u8>) -> Self {
        Part::Image { mime_type: "image/png".into(), data }
    }

    pub fn is_tool_invocation(&self) -> bool {
        matches!(self, Part::ToolInvocation { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn user(parts: Vec<Part>) -> Self {
        Self { role: Role::User, parts }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self { role: Role::Model, parts }
    }

    pub fn has_tool_invocation(&self) -> bool {
        self.parts.iter().any(Part::is_tool_invocation)
    }
}

// ========================= Pages =========================

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub String);

impl PageId {
    pub fn generate() -> Self {
        Self(nanoid!())
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn generate() -> Self {
        Self(nanoid!())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An interactive element as reported by the in-page extraction script.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub index: u32,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub aria_label: String,
    #[serde(default)]
    pub css_selector: String,
    #[serde(default, alias = "computedCursor")]
    pub cursor_style: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub center: Point,
}

#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub url: Option<String>,
    pub image_png: Vec<u8>,
    pub elements: Vec<Element>,
}

impl Snapshot {
    pub fn element(&self, index: u32) -> Option<&Element> {
        self.elements.iter().find(|e| e.index == index)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementSummary {
    pub tag: String,
    pub text: String,
}

/// Lightweight description of an open page, attached to every user message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub page_index: usize,
    pub url: String,
    pub title: String,
    pub domain: String,
    pub elements_summary: Vec<ElementSummary>,
}

impl PageSummary {
    pub fn domain_of(url: &str) -> String {
        url.split('/').nth(2).unwrap_or_default().to_string()
    }
}

// ========================= Task =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl FromStr for Direction {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            other => Err(AgentError::InvalidToolCall(format!("unknown direction `{other}`"))),
        }
    }
}

impl Direction {
    /// Unit vector in page coordinates (y grows downwards).
    pub fn delta(&self, step: f64) -> (f64, f64) {
        match self {
            Direction::Up => (0.0, -step),
            Direction::Down => (0.0, step),
            Direction::Left => (-step, 0.0),
            Direction::Right => (step, 0.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Goto { url: String },
    Click { element_id: u32 },
    TypeText { element_id: u32, text: String },
    ScrollPage { direction: Direction },
    ScrollElement { element_id: u32, direction: Direction },
    Back,
    Wait,
    Done { output: String },
    Stuck,
    WaitForInput { fields: Vec<String> },
    WaitForAction { description: String },
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Action::Done { .. } | Action::Stuck | Action::WaitForInput { .. } | Action::WaitForAction { .. }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Done,
    Stuck,
    AwaitingInput,
    AwaitingUserAction,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Stuck => "stuck",
            TaskStatus::AwaitingInput => "awaiting_input",
            TaskStatus::AwaitingUserAction => "awaiting_user_action",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl FromStr for TaskStatus {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "stuck" => Ok(TaskStatus::Stuck),
            "awaiting_input" => Ok(TaskStatus::AwaitingInput),
            "awaiting_user_action" => Ok(TaskStatus::AwaitingUserAction),
            other => Err(AgentError::InvalidToolCall(format!("unknown status `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalResult {
    pub status: TaskStatus,
    pub output: String,
}

impl TerminalResult {
    pub fn done(output: impl Into<String>) -> Self {
        Self { status: TaskStatus::Done, output: output.into() }
    }

    pub fn stuck(output: impl Into<String>) -> Self {
        Self { status: TaskStatus::Stuck, output: output.into() }
    }
}

// ========================= Errors =========================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AgentError {
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("element {element_id} is not in the latest snapshot")]
    ElementResolution { element_id: u32 },
    #[error("invalid tool call: {0}")]
    InvalidToolCall(String),
    #[error("page error: {0}")]
    Page(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("other error: {0}")]
    Other(String),
}
