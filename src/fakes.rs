//! In-memory collaborators: a scripted model, pages without a browser, and a
//! transport that records what it was asked to send. Used by the unit and
//! integration tests, and handy for driving the coordinator offline.

use crate::gateway::ModelGateway;
use crate::page::{PageCommand, PagePool, PageStateProvider};
use crate::tools::ToolSchema;
use crate::transport::{OutboundMessage, Transport};
use crate::types::{AgentError, Element, PageId, PageSummary, Part, Point, Snapshot, Turn};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn element(index: u32, kind: &str, x: f64, y: f64) -> Element {
    Element {
        index,
        kind: kind.to_string(),
        text: format!("{kind} {index}"),
        aria_label: String::new(),
        css_selector: format!("{kind}:nth-of-type({index})"),
        cursor_style: "pointer".into(),
        attributes: Default::default(),
        center: Point { x, y },
    }
}

struct TaskScript {
    goal_contains: String,
    delay: Duration,
    replies: Vec<Vec<Part>>,
}

/// A model that answers from a script.
///
/// Coordinator calls pop the conversation queue in order. Task calls are routed
/// to the first script whose needle occurs in the task goal (`""` matches any
/// goal); each goal walks its own cursor through the replies and the last reply
/// repeats forever.
#[derive(Default)]
pub struct ScriptedGateway {
    conversation: Mutex<VecDeque<Result<Vec<Part>, AgentError>>>,
    conversation_requests: Mutex<Vec<Vec<Turn>>>,
    scripts: Vec<TaskScript>,
    cursors: Mutex<HashMap<String, usize>>,
    task_calls: AtomicUsize,
    completed: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, parts: Vec<Part>) -> Self {
        lock(&self.conversation).push_back(Ok(parts));
        self
    }

    pub fn fail(self, err: AgentError) -> Self {
        lock(&self.conversation).push_back(Err(err));
        self
    }

    pub fn task(self, goal_contains: &str, replies: Vec<Vec<Part>>) -> Self {
        self.task_after(goal_contains, Duration::ZERO, replies)
    }

    /// Like [`ScriptedGateway::task`], but every answer takes `delay` to arrive.
    pub fn task_after(mut self, goal_contains: &str, delay: Duration, replies: Vec<Vec<Part>>) -> Self {
        self.scripts.push(TaskScript { goal_contains: goal_contains.to_string(), delay, replies });
        self
    }

    pub fn task_calls(&self) -> usize {
        self.task_calls.load(Ordering::SeqCst)
    }

    pub fn conversation_calls(&self) -> usize {
        lock(&self.conversation_requests).len()
    }

    /// The contents of every coordinator call, in call order.
    pub fn conversation_requests(&self) -> Vec<Vec<Turn>> {
        lock(&self.conversation_requests).clone()
    }

    /// Task goals in the order their answers were delivered.
    pub fn task_completion_order(&self) -> Vec<String> {
        lock(&self.completed).clone()
    }

    async fn answer_task(&self, goal: &str) -> Result<Vec<Part>, AgentError> {
        self.task_calls.fetch_add(1, Ordering::SeqCst);
        let (slot, script) = self
            .scripts
            .iter()
            .enumerate()
            .find(|(_, s)| goal.contains(&s.goal_contains))
            .ok_or_else(|| AgentError::Gateway(format!("no script for goal `{goal}`")))?;
        let reply = {
            let mut cursors = lock(&self.cursors);
            let cursor = cursors.entry(format!("{slot}:{goal}")).or_insert(0);
            let reply = script
                .replies
                .get(*cursor)
                .or_else(|| script.replies.last())
                .cloned()
                .ok_or_else(|| AgentError::Gateway("empty task script".into()))?;
            *cursor += 1;
            reply
        };
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        lock(&self.completed).push(goal.to_string());
        Ok(reply)
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn generate(&self, schema: &ToolSchema, contents: &[Turn]) -> Result<Vec<Part>, AgentError> {
        match schema {
            ToolSchema::Coordinator => {
                lock(&self.conversation_requests).push(contents.to_vec());
                lock(&self.conversation)
                    .pop_front()
                    .unwrap_or_else(|| Err(AgentError::Gateway("conversation script exhausted".into())))
            }
            ToolSchema::Task { goal } => self.answer_task(goal).await,
        }
    }
}

/// Pages that only remember their url and the commands sent to them.
/// Every snapshot shows the same element list.
#[derive(Default)]
pub struct FakePages {
    pages: Mutex<Vec<(PageId, String)>>,
    elements: Vec<Element>,
    performed: Mutex<Vec<(PageId, PageCommand)>>,
    snapshots: AtomicUsize,
}

impl FakePages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_elements(elements: Vec<Element>) -> Self {
        Self { elements, ..Self::default() }
    }

    pub fn performed(&self) -> Vec<(PageId, PageCommand)> {
        lock(&self.performed).clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn page_count(&self) -> usize {
        lock(&self.pages).len()
    }

    fn url_of(&self, page: &PageId) -> Result<String, AgentError> {
        lock(&self.pages)
            .iter()
            .find(|(id, _)| id == page)
            .map(|(_, url)| url.clone())
            .ok_or_else(|| AgentError::Page(format!("unknown page {page}")))
    }
}

#[async_trait]
impl PagePool for FakePages {
    async fn open_page(&self) -> Result<PageId, AgentError> {
        let id = PageId::generate();
        lock(&self.pages).push((id.clone(), "about:blank".into()));
        Ok(id)
    }

    async fn page_at(&self, index: usize) -> Option<PageId> {
        lock(&self.pages).get(index).map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl PageStateProvider for FakePages {
    async fn snapshot(&self, page: &PageId) -> Result<Snapshot, AgentError> {
        let url = self.url_of(page)?;
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(Snapshot { url: Some(url), image_png: b"\x89PNG\r\n\x1a\n".to_vec(), elements: self.elements.clone() })
    }

    async fn perform(&self, page: &PageId, command: &PageCommand) -> Result<(), AgentError> {
        self.url_of(page)?;
        if let PageCommand::Goto { url } = command {
            if let Some(entry) = lock(&self.pages).iter_mut().find(|(id, _)| id == page) {
                entry.1 = url.clone();
            }
        }
        lock(&self.performed).push((page.clone(), command.clone()));
        Ok(())
    }

    async fn summaries(&self) -> Result<Vec<PageSummary>, AgentError> {
        Ok(lock(&self.pages)
            .iter()
            .enumerate()
            .map(|(page_index, (_, url))| PageSummary {
                page_index,
                url: url.clone(),
                title: String::new(),
                domain: PageSummary::domain_of(url),
                elements_summary: Vec::new(),
            })
            .collect())
    }
}

/// Keeps every batch it is handed; optionally refuses them all.
#[derive(Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<Vec<OutboundMessage>>>,
    failing: bool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose client has gone away.
    pub fn failing() -> Self {
        Self { failing: true, ..Self::default() }
    }

    pub fn batches(&self) -> Vec<Vec<OutboundMessage>> {
        lock(&self.batches).clone()
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.batches)
            .iter()
            .flatten()
            .filter_map(|m| match m {
                OutboundMessage::Error { error } => Some(error.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn emit(&self, messages: &[OutboundMessage]) -> Result<(), AgentError> {
        lock(&self.batches).push(messages.to_vec());
        if self.failing {
            return Err(AgentError::Transport("client connection closed".into()));
        }
        Ok(())
    }
}
