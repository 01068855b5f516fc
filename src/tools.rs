//! Tool schemas offered to the model and decoding of the invocations it sends back.

use crate::types::{Action, AgentError, Direction, Part, TaskStatus, TerminalResult};
use serde_json::{json, Map, Value};

pub const WEB_INTERACTION: &str = "web_interaction";

/// Which tool set (and system instruction) a gateway call is made with.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolSchema {
    Coordinator,
    Task { goal: String },
}

impl ToolSchema {
    /// Function declarations in the OpenAPI subset understood by `generateContent`.
    pub fn declarations(&self) -> Value {
        match self {
            ToolSchema::Coordinator => json!([{
                "name": WEB_INTERACTION,
                "description": "Browse to a page, search a website, perform a sequence of actions such as filling a form, or extract information to reach a broader goal.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "goal": {"type": "STRING", "description": "Single, clear and actionable statement of the desired outcome of the browsing session."},
                        "url": {"type": "STRING", "description": "Target url; either the url of an existing page or a new url to open."},
                        "page_index": {"type": "INTEGER", "description": "Index of an existing page to work in. When omitted a new page is opened."}
                    },
                    "required": ["goal", "url"]
                }
            }]),
            ToolSchema::Task { .. } => {
                let element_id = json!({"type": "INTEGER", "description": "Index of the element in the provided element list."});
                let direction = json!({"type": "STRING", "enum": ["up", "down", "left", "right"], "description": "Scroll direction."});
                json!([
                    {"name": "goto", "description": "Navigate to a url.",
                     "parameters": {"type": "OBJECT", "properties": {"url": {"type": "STRING"}}, "required": ["url"]}},
                    {"name": "click", "description": "Click an interactive element such as a button, link or tab.",
                     "parameters": {"type": "OBJECT", "properties": {"element_id": element_id}, "required": ["element_id"]}},
                    {"name": "type_text", "description": "Replace the content of an input field and submit it.",
                     "parameters": {"type": "OBJECT", "properties": {"element_id": element_id, "text": {"type": "STRING"}}, "required": ["element_id", "text"]}},
                    {"name": "scroll_page", "description": "Scroll the whole page to reveal hidden content.",
                     "parameters": {"type": "OBJECT", "properties": {"direction": direction}, "required": ["direction"]}},
                    {"name": "scroll_element", "description": "Scroll inside a container element such as a modal or a sidebar.",
                     "parameters": {"type": "OBJECT", "properties": {"element_id": element_id, "direction": direction}, "required": ["element_id", "direction"]}},
                    {"name": "back", "description": "Go back to the previous page.",
                     "parameters": {"type": "OBJECT", "properties": {}}},
                    {"name": "wait", "description": "Wait for the page to finish loading.",
                     "parameters": {"type": "OBJECT", "properties": {}}},
                    {"name": "done", "description": "The goal is achieved; report the requested information.",
                     "parameters": {"type": "OBJECT", "properties": {"output": {"type": "STRING", "description": "Structured representation of the requested information."}}, "required": ["output"]}},
                    {"name": "stuck", "description": "Blocked or lost; the page gives no way to continue towards the goal.",
                     "parameters": {"type": "OBJECT", "properties": {}}},
                    {"name": "wait_for_action", "description": "Only the human user can take the next step (captcha, confirmation, payment).",
                     "parameters": {"type": "OBJECT", "properties": {"action_required": {"type": "STRING"}}, "required": ["action_required"]}},
                    {"name": "wait_for_input", "description": "Information that only the user can provide is missing.",
                     "parameters": {"type": "OBJECT", "properties": {"information_required": {"type": "ARRAY", "items": {"type": "STRING"}}}, "required": ["information_required"]}}
                ])
            }
        }
    }

    pub fn system_instruction(&self) -> String {
        match self {
            ToolSchema::Coordinator => COORDINATOR_INSTRUCTION.to_string(),
            ToolSchema::Task { goal } => format!(
                "You drive a single browser tab towards this goal: {goal}\n\n\
                 Every turn you receive a screenshot of the page, the list of interactive elements \
                 as JSON (each with an `index`) and a summary of the actions taken so far.\n\
                 - Reply with a short summary of the action (2-10 words) followed by exactly one tool call.\n\
                 - `click`, `type_text` and `scroll_element` must use an `index` from the element list.\n\
                 - Call `done` only when the goal is visibly achieved, with the requested data as output.\n\
                 - Call `stuck` when blocked or when a required element is missing even after scrolling.\n\
                 - Use `scroll_page` when the target is likely off-screen and `back` only when the goal needs the previous page."
            ),
        }
    }

    pub fn temperature(&self) -> f32 {
        match self {
            ToolSchema::Coordinator => 0.3,
            ToolSchema::Task { .. } => 0.0,
        }
    }
}

const COORDINATOR_INSTRUCTION: &str = "\
You are the assistant between a user and an automated browser.

Answer directly when the question needs no live web data. When a web task is missing required \
details (dates, cities, search terms), ask the user for them instead of browsing.

Otherwise use the `web_interaction` tool. Each user message comes with a JSON list of the open \
pages (page_index, url, title, visible elements). When the user mentions @current or a page title, \
pass that page's `page_index`. When several websites are involved, issue one call per website; \
the calls run in parallel. Goals must be complete and self-contained.

The tool answers with a status:
- `done`: present the returned information clearly.
- `awaiting_input`: ask the user for the listed information.
- `awaiting_user_action`: explain what the user has to do in the browser.
- `stuck`: explain that the page could not be handled and suggest a next step.

Never show raw statuses. While using the tool, the whole response must be tool calls.";

// ========================= Argument helpers =========================

fn str_arg(tool: &str, args: &Map<String, Value>, key: &str) -> Result<String, AgentError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AgentError::InvalidToolCall(format!("{tool}: missing string `{key}`")))
}

fn index_value(v: &Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn index_arg(tool: &str, args: &Map<String, Value>, key: &str) -> Result<u32, AgentError> {
    args.get(key)
        .and_then(index_value)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| AgentError::InvalidToolCall(format!("{tool}: missing integer `{key}`")))
}

fn direction_arg(tool: &str, args: &Map<String, Value>) -> Result<Direction, AgentError> {
    str_arg(tool, args, "direction")?.parse()
}

impl Action {
    /// Decodes one task-level tool invocation.
    pub fn from_invocation(name: &str, args: &Map<String, Value>) -> Result<Action, AgentError> {
        let action = match name {
            "goto" => Action::Goto { url: str_arg(name, args, "url")? },
            "click" => Action::Click { element_id: index_arg(name, args, "element_id")? },
            "type_text" => Action::TypeText {
                element_id: index_arg(name, args, "element_id")?,
                text: str_arg(name, args, "text")?,
            },
            "scroll_page" => Action::ScrollPage { direction: direction_arg(name, args)? },
            "scroll_element" => Action::ScrollElement {
                element_id: index_arg(name, args, "element_id")?,
                direction: direction_arg(name, args)?,
            },
            "back" => Action::Back,
            "wait" => Action::Wait,
            "done" => Action::Done { output: str_arg(name, args, "output")? },
            "stuck" => Action::Stuck,
            "wait_for_input" => Action::WaitForInput {
                fields: args
                    .get("information_required")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
                    .ok_or_else(|| {
                        AgentError::InvalidToolCall("wait_for_input: missing `information_required`".into())
                    })?,
            },
            "wait_for_action" => Action::WaitForAction {
                description: str_arg(name, args, "action_required")?,
            },
            other => return Err(AgentError::InvalidToolCall(format!("unknown tool `{other}`"))),
        };
        Ok(action)
    }
}

// ========================= Delegation =========================

#[derive(Clone, Debug, PartialEq)]
pub enum DelegationTarget {
    NewPage { url: String },
    ExistingPage { page_index: usize, url: Option<String> },
}

/// A decoded `web_interaction` call.
#[derive(Clone, Debug, PartialEq)]
pub struct Delegation {
    pub goal: String,
    pub target: DelegationTarget,
}

impl Delegation {
    pub fn from_invocation(name: &str, args: &Map<String, Value>) -> Result<Self, AgentError> {
        if name != WEB_INTERACTION {
            return Err(AgentError::InvalidToolCall(format!("unknown tool `{name}`")));
        }
        let goal = str_arg(name, args, "goal")?;
        if goal.trim().is_empty() {
            return Err(AgentError::InvalidToolCall(format!("{name}: empty `goal`")));
        }
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let page_index = args.get("page_index").and_then(index_value).map(|n| n as usize);
        let target = match (page_index, url) {
            (Some(page_index), url) => DelegationTarget::ExistingPage { page_index, url },
            (None, Some(url)) => DelegationTarget::NewPage { url },
            (None, None) => {
                return Err(AgentError::InvalidToolCall(format!("{name}: needs `url` or `page_index`")))
            }
        };
        Ok(Self { goal, target })
    }

    /// Goal handed to an executor working on a freshly opened page.
    pub fn goal_for_new_page(&self, url: &str) -> String {
        format!("{} WEBSITE - {}", self.goal, url)
    }
}

// ========================= Tool responses =========================

/// Maps a terminal action onto the result folded back into the conversation.
/// `Stuck` carries no payload of its own; the caller supplies the explanation.
pub fn terminal_result(action: &Action, stuck_explanation: impl FnOnce() -> String) -> Option<TerminalResult> {
    let result = match action {
        Action::Done { output } => TerminalResult::done(output.clone()),
        Action::WaitForInput { fields } => TerminalResult {
            status: TaskStatus::AwaitingInput,
            output: serde_json::to_string(fields).unwrap_or_default(),
        },
        Action::WaitForAction { description } => TerminalResult {
            status: TaskStatus::AwaitingUserAction,
            output: description.clone(),
        },
        Action::Stuck => TerminalResult::stuck(stuck_explanation()),
        _ => return None,
    };
    Some(result)
}

pub fn encode_tool_response(result: &TerminalResult) -> Part {
    Part::ToolResponse {
        name: WEB_INTERACTION.to_string(),
        response: json!({"result": {"status": result.status.as_str(), "output": result.output}}),
    }
}

pub fn decode_tool_response(part: &Part) -> Result<TerminalResult, AgentError> {
    let Part::ToolResponse { name, response } = part else {
        return Err(AgentError::InvalidToolCall("not a tool response".into()));
    };
    if name != WEB_INTERACTION {
        return Err(AgentError::InvalidToolCall(format!("unexpected tool response `{name}`")));
    }
    let status = response
        .pointer("/result/status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::InvalidToolCall("tool response without status".into()))?
        .parse::<TaskStatus>()?;
    let output = response
        .pointer("/result/output")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(TerminalResult { status, output })
}
