use crate::gateway::{generate_within, ModelGateway};
use crate::page::{PageCommand, PageStateProvider};
use crate::tools::{terminal_result, ToolSchema};
use crate::types::{
    Action, AgentError, PageId, Part, Point, Snapshot, TaskId, TaskStatus, TerminalResult, Turn,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Upper bound on snapshot → decide → act cycles for one task.
    pub max_iterations: usize,
    /// Deadline for every snapshot, model and page-action call.
    pub call_timeout: Duration,
    /// Pause used by the `wait` action.
    pub wait_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            call_timeout: Duration::from_secs(60),
            wait_delay: Duration::from_secs(3),
        }
    }
}

/// Everything one browsing task knows about itself.
#[derive(Clone, Debug)]
pub struct TaskState {
    pub id: TaskId,
    pub goal: String,
    pub page: PageId,
    pub action_history: Vec<String>,
    pub last_snapshot: Option<Snapshot>,
    pub pending_action: Option<Action>,
    pub status: TaskStatus,
}

impl TaskState {
    pub fn new(goal: impl Into<String>, page: PageId) -> Self {
        Self {
            id: TaskId::generate(),
            goal: goal.into(),
            page,
            action_history: Vec::new(),
            last_snapshot: None,
            pending_action: None,
            status: TaskStatus::Running,
        }
    }
}

/// Where the perceive-decide-act loop currently stands.
#[derive(Clone, Debug, PartialEq)]
pub enum Phase {
    Snapshot,
    Decide,
    Act,
    Terminal(TerminalResult),
}

#[derive(Debug)]
pub enum Event {
    SnapshotTaken,
    Decided { action: Action, summary: Option<String> },
    Acted { iterations: usize, limit: usize },
    Failed(AgentError),
}

impl Phase {
    pub fn next(self, event: Event) -> Phase {
        match (self, event) {
            (Phase::Snapshot, Event::SnapshotTaken) => Phase::Decide,
            (Phase::Decide, Event::Decided { action, .. }) if !action.is_terminal() => Phase::Act,
            (Phase::Decide, Event::Decided { action, summary }) => {
                let explain = || summary.unwrap_or_else(|| "the page offers no way to continue towards the goal".into());
                Phase::Terminal(
                    terminal_result(&action, explain)
                        .unwrap_or_else(|| TerminalResult::stuck(format!("{action:?} has no terminal result"))),
                )
            }
            (Phase::Act, Event::Acted { iterations, limit }) if iterations >= limit => Phase::Terminal(
                TerminalResult::stuck(format!("gave up after {limit} actions without reaching the goal")),
            ),
            (Phase::Act, Event::Acted { .. }) => Phase::Snapshot,
            (_, Event::Failed(err)) => Phase::Terminal(TerminalResult::stuck(err.to_string())),
            (phase, event) => Phase::Terminal(TerminalResult::stuck(format!(
                "executor received {event:?} while in {phase:?}"
            ))),
        }
    }
}

/// Runs one task against its page until a terminal status.
#[derive(Clone)]
pub struct TaskExecutor {
    gateway: Arc<dyn ModelGateway>,
    pages: Arc<dyn PageStateProvider>,
    cfg: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(gateway: Arc<dyn ModelGateway>, pages: Arc<dyn PageStateProvider>, cfg: ExecutorConfig) -> Self {
        Self { gateway, pages, cfg }
    }

    /// Never fails: every error ends the task as `stuck`.
    pub async fn run(&self, task: &mut TaskState) -> TerminalResult {
        info!(task = %task.id, page = %task.page, goal = %task.goal, "task started");
        let limit = self.cfg.max_iterations.max(1);
        let mut iterations = 0;
        let mut phase = Phase::Snapshot;
        loop {
            let event = match &phase {
                Phase::Snapshot => match self.within("snapshot", self.pages.snapshot(&task.page)).await {
                    Ok(snapshot) => {
                        task.last_snapshot = Some(snapshot);
                        Event::SnapshotTaken
                    }
                    Err(err) => Event::Failed(err),
                },
                Phase::Decide => match self.decide(task).await {
                    Ok((action, summary)) => {
                        info!(task = %task.id, step = iterations, action = ?action, "action decided");
                        Event::Decided { action, summary }
                    }
                    Err(err) => Event::Failed(err),
                },
                Phase::Act => {
                    iterations += 1;
                    match self.act(task).await {
                        Ok(()) => Event::Acted { iterations, limit },
                        Err(err) => Event::Failed(err),
                    }
                }
                Phase::Terminal(result) => {
                    task.status = result.status;
                    if result.status == TaskStatus::Stuck {
                        warn!(task = %task.id, output = %result.output, "task stuck");
                    } else {
                        info!(task = %task.id, status = result.status.as_str(), steps = iterations, "task finished");
                    }
                    return result.clone();
                }
            };
            phase = phase.next(event);
        }
    }

    async fn within<T>(
        &self,
        what: &str,
        fut: impl Future<Output = Result<T, AgentError>>,
    ) -> Result<T, AgentError> {
        tokio::time::timeout(self.cfg.call_timeout, fut)
            .await
            .map_err(|_| AgentError::Timeout(format!("{what} exceeded {}ms", self.cfg.call_timeout.as_millis())))?
    }

    fn decision_input(task: &TaskState, snapshot: &Snapshot) -> Turn {
        let mut parts = Vec::with_capacity(4);
        if task.action_history.is_empty() {
            parts.push(Part::text("No history, start of action."));
        } else {
            parts.push(Part::text(format!("PAST ACTIONS:\n{}", task.action_history.join("\n"))));
        }
        if let Some(url) = &snapshot.url {
            parts.push(Part::text(format!("Current url: {url}")));
        }
        if !snapshot.image_png.is_empty() {
            parts.push(Part::png(snapshot.image_png.clone()));
        }
        let elements = serde_json::to_string(&snapshot.elements).unwrap_or_else(|_| "[]".into());
        parts.push(Part::text(format!("Interactive elements (JSON):\n{elements}")));
        Turn::user(parts)
    }

    async fn decide(&self, task: &mut TaskState) -> Result<(Action, Option<String>), AgentError> {
        let snapshot = task
            .last_snapshot
            .as_ref()
            .ok_or_else(|| AgentError::Other("no snapshot to decide on".into()))?;
        let contents = [Self::decision_input(task, snapshot)];
        let schema = ToolSchema::Task { goal: task.goal.clone() };
        let parts = generate_within(self.gateway.as_ref(), &schema, &contents, self.cfg.call_timeout).await?;

        let mut summary = None;
        let mut call = None;
        for part in parts {
            match part {
                Part::Text(text) if !text.trim().is_empty() => summary = Some(text.trim().to_string()),
                Part::ToolInvocation { name, args } => call = Some((name, args)),
                _ => {}
            }
        }
        if let Some(s) = &summary {
            task.action_history.push(s.clone());
        }
        let (name, args) =
            call.ok_or_else(|| AgentError::InvalidToolCall("model answered without a tool call".into()))?;
        let action = Action::from_invocation(&name, &args)?;
        task.pending_action = Some(action.clone());
        Ok((action, summary))
    }

    fn resolve(task: &TaskState, element_id: u32) -> Result<Point, AgentError> {
        task.last_snapshot
            .as_ref()
            .and_then(|s| s.element(element_id))
            .map(|e| e.center)
            .ok_or(AgentError::ElementResolution { element_id })
    }

    async fn act(&self, task: &TaskState) -> Result<(), AgentError> {
        let action = task
            .pending_action
            .as_ref()
            .ok_or_else(|| AgentError::Other("no pending action".into()))?;
        let command = match action {
            Action::Goto { url } => PageCommand::Goto { url: url.clone() },
            Action::Click { element_id } => PageCommand::Click { at: Self::resolve(task, *element_id)? },
            Action::TypeText { element_id, text } => PageCommand::TypeText {
                at: Self::resolve(task, *element_id)?,
                text: text.clone(),
            },
            Action::ScrollPage { direction } => PageCommand::ScrollPage { direction: *direction },
            Action::ScrollElement { element_id, direction } => PageCommand::ScrollAt {
                at: Self::resolve(task, *element_id)?,
                direction: *direction,
            },
            Action::Back => PageCommand::Back,
            Action::Wait => {
                tokio::time::sleep(self.cfg.wait_delay).await;
                return Ok(());
            }
            Action::Done { .. } | Action::Stuck | Action::WaitForInput { .. } | Action::WaitForAction { .. } => {
                return Ok(())
            }
        };
        self.within("page action", self.pages.perform(&task.page, &command)).await
    }
}
