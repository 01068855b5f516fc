use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::executor::{ExecutorConfig, TaskExecutor, TaskState};
use crate::gateway::{generate_within, ModelGateway};
use crate::page::{PageLeases, PagePool, PageStateProvider};
use crate::session::ConversationSession;
use crate::tools::{encode_tool_response, Delegation, DelegationTarget, ToolSchema};
use crate::transport::{OutboundMessage, Transport};
use crate::types::{AgentError, Part, Role, TerminalResult, Turn};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Deadline for each conversation-level model call.
    pub call_timeout: Duration,
    /// Delegation rounds allowed for a single user message.
    pub max_delegation_rounds: usize,
    pub executor: ExecutorConfig,
    pub dispatch: DispatchConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(60),
            max_delegation_rounds: 8,
            executor: ExecutorConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Where one conversation cycle currently stands.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleState {
    AwaitingUserInput,
    ModelInvocation,
    ResponseEmit(Vec<Part>),
    ToolDispatch(Vec<Part>),
    ResultFold(Vec<TerminalResult>),
}

#[derive(Debug)]
pub enum CycleEvent {
    UserMessage,
    ModelResponded(Vec<Part>),
    ModelFailed,
    Emitted { delegate: bool },
    DelegationLimitReached,
    Dispatched(Vec<TerminalResult>),
    Folded,
}

impl CycleState {
    pub fn next(self, event: CycleEvent) -> CycleState {
        match (self, event) {
            (CycleState::AwaitingUserInput, CycleEvent::UserMessage) => CycleState::ModelInvocation,
            (CycleState::ModelInvocation, CycleEvent::ModelResponded(parts)) => CycleState::ResponseEmit(parts),
            (CycleState::ModelInvocation, CycleEvent::ModelFailed) => CycleState::AwaitingUserInput,
            (CycleState::ResponseEmit(parts), CycleEvent::Emitted { delegate: true }) => CycleState::ToolDispatch(parts),
            (CycleState::ResponseEmit(_), CycleEvent::Emitted { delegate: false }) => CycleState::AwaitingUserInput,
            (CycleState::ToolDispatch(_), CycleEvent::Dispatched(results)) => CycleState::ResultFold(results),
            (CycleState::ToolDispatch(_), CycleEvent::DelegationLimitReached) => CycleState::AwaitingUserInput,
            (CycleState::ResultFold(_), CycleEvent::Folded) => CycleState::ModelInvocation,
            // anything else ends the cycle
            _ => CycleState::AwaitingUserInput,
        }
    }
}

/// Drives the model conversation of a session and delegates browsing work.
pub struct Coordinator {
    gateway: Arc<dyn ModelGateway>,
    pool: Arc<dyn PagePool>,
    pages: Arc<dyn PageStateProvider>,
    leases: Arc<PageLeases>,
    dispatcher: Dispatcher,
    cfg: CoordinatorConfig,
}

impl Coordinator {
    pub fn new<P>(gateway: Arc<dyn ModelGateway>, pages: Arc<P>, cfg: CoordinatorConfig) -> Self
    where
        P: PagePool + PageStateProvider + 'static,
    {
        let executor = TaskExecutor::new(gateway.clone(), pages.clone(), cfg.executor.clone());
        let dispatcher = Dispatcher::new(executor, cfg.dispatch.clone());
        Self {
            gateway,
            pool: pages.clone(),
            pages,
            leases: Arc::new(PageLeases::new()),
            dispatcher,
            cfg,
        }
    }

    pub fn leases(&self) -> &PageLeases {
        &self.leases
    }

    /// Runs one full cycle for `text`: model call, emission, and as many
    /// delegation rounds as the model asks for, until a plain answer.
    ///
    /// The caller holds the session for the whole cycle. A gateway failure
    /// emits a single error message and is returned; history keeps every turn
    /// appended before the failure.
    pub async fn handle_message(
        &self,
        session: &mut ConversationSession,
        text: &str,
        transport: &dyn Transport,
    ) -> Result<(), AgentError> {
        info!(client = %session.client_id, "user message received");
        session.last_user_message = Some(text.to_string());
        let mut state = CycleState::AwaitingUserInput.next(CycleEvent::UserMessage);
        let mut rounds = 0;
        let mut failure = None;
        loop {
            let event = match &state {
                CycleState::AwaitingUserInput => {
                    session.pending_delegation = false;
                    return failure.map_or(Ok(()), Err);
                }
                CycleState::ModelInvocation => match self.invoke_model(session).await {
                    Ok(parts) => CycleEvent::ModelResponded(parts),
                    Err(err) => {
                        self.abort(session, transport, &err).await;
                        failure = Some(err);
                        CycleEvent::ModelFailed
                    }
                },
                CycleState::ResponseEmit(parts) => {
                    let delegate = self.emit(session, parts, transport).await;
                    CycleEvent::Emitted { delegate }
                }
                CycleState::ToolDispatch(parts) => {
                    if rounds >= self.cfg.max_delegation_rounds {
                        self.refuse_delegation(session, parts, transport).await;
                        CycleEvent::DelegationLimitReached
                    } else {
                        rounds += 1;
                        session.pending_delegation = true;
                        CycleEvent::Dispatched(self.dispatch(session, parts).await)
                    }
                }
                CycleState::ResultFold(results) => {
                    Self::fold(session, results);
                    CycleEvent::Folded
                }
            };
            state = state.next(event);
        }
    }

    async fn invoke_model(&self, session: &mut ConversationSession) -> Result<Vec<Part>, AgentError> {
        let Some(message) = session.last_user_message.clone() else {
            return self.generate(session.history()).await;
        };

        let summaries = match tokio::time::timeout(self.cfg.call_timeout, self.pages.summaries()).await {
            Ok(Ok(summaries)) => summaries,
            Ok(Err(err)) => {
                warn!(error = %err, "page summaries unavailable");
                Vec::new()
            }
            Err(_) => {
                warn!(timeout_ms = self.cfg.call_timeout.as_millis() as u64, "page summaries timed out");
                Vec::new()
            }
        };
        let page_data = serde_json::to_string_pretty(&summaries).unwrap_or_else(|_| "[]".into());
        let mut contents = session.history().to_vec();
        contents.push(Turn::user(vec![Part::text(format!(
            "{message}\n\n PAGE DATA IN JSON\n```json\n{page_data}\n```"
        ))]));

        let parts = self.generate(&contents).await?;
        session.push(Turn::user(vec![Part::text(message)]));
        session.last_user_message = None;
        Ok(parts)
    }

    async fn generate(&self, contents: &[Turn]) -> Result<Vec<Part>, AgentError> {
        generate_within(self.gateway.as_ref(), &ToolSchema::Coordinator, contents, self.cfg.call_timeout)
            .await
            .map_err(|err| match err {
                AgentError::Timeout(msg) => AgentError::Gateway(msg),
                other => other,
            })
    }

    async fn abort(&self, session: &mut ConversationSession, transport: &dyn Transport, err: &AgentError) {
        error!(client = %session.client_id, error = %err, "conversation cycle aborted");
        session.last_user_message = None;
        if let Err(e) = transport.emit_error(&err.to_string()).await {
            warn!(error = %e, "could not deliver error to client");
        }
    }

    /// Stores and sends the model turn; true when it asks for delegation.
    async fn emit(&self, session: &mut ConversationSession, parts: &[Part], transport: &dyn Transport) -> bool {
        let turn = Turn::model(parts.to_vec());
        let delegate = turn.has_tool_invocation();
        session.push(turn);
        let messages: Vec<OutboundMessage> =
            parts.iter().filter_map(|p| OutboundMessage::from_part(Role::Model, p)).collect();
        debug!(messages = messages.len(), "emitting model turn");
        if let Err(e) = transport.emit(&messages).await {
            warn!(error = %e, "could not deliver model turn to client");
        }
        delegate
    }

    /// Answers every invocation of an over-limit round with `stuck`, so the
    /// stored history stays a valid call/response sequence, then tells the client.
    async fn refuse_delegation(&self, session: &mut ConversationSession, parts: &[Part], transport: &dyn Transport) {
        let limit = self.cfg.max_delegation_rounds;
        warn!(client = %session.client_id, limit, "delegation round limit reached");
        let refusal = TerminalResult::stuck(format!("delegation limit of {limit} rounds reached for this message"));
        let results: Vec<TerminalResult> =
            parts.iter().filter(|p| p.is_tool_invocation()).map(|_| refusal.clone()).collect();
        Self::fold(session, &results);
        if let Err(e) = transport.emit_error(&refusal.output).await {
            warn!(error = %e, "could not deliver error to client");
        }
    }

    /// Seeds one task per invocation and runs them together. Invocations
    /// that cannot be seeded are answered with `stuck` in their own slot.
    async fn dispatch(&self, session: &mut ConversationSession, parts: &[Part]) -> Vec<TerminalResult> {
        let mut slots: Vec<Option<TerminalResult>> = Vec::new();
        let mut tasks = Vec::new();
        for part in parts {
            let Part::ToolInvocation { name, args } = part else { continue };
            match self.seed(name, args).await {
                Ok(task) => {
                    session.dispatched.insert(task.id.clone());
                    tasks.push(task);
                    slots.push(None);
                }
                Err(err) => {
                    warn!(tool = %name, error = %err, "invalid delegation");
                    slots.push(Some(TerminalResult::stuck(err.to_string())));
                }
            }
        }

        let mut results = self.dispatcher.dispatch(&mut tasks).await.into_iter();
        for task in &tasks {
            self.leases.release(&task.page);
            session.dispatched.remove(&task.id);
        }
        slots
            .into_iter()
            .map(|slot| {
                slot.or_else(|| results.next())
                    .unwrap_or_else(|| TerminalResult::stuck("task produced no result"))
            })
            .collect()
    }

    /// Picks the page for a delegation and leases it.
    ///
    /// An existing page keeps the goal as given. A missing or busy page falls
    /// back to a fresh one when the invocation names a url.
    async fn seed(&self, name: &str, args: &Map<String, Value>) -> Result<TaskState, AgentError> {
        let delegation = Delegation::from_invocation(name, args)?;
        let url = match &delegation.target {
            DelegationTarget::ExistingPage { page_index, url } => {
                if let Some(page) = self.pool.page_at(*page_index).await {
                    if self.leases.try_acquire(&page) {
                        info!(page = %page, page_index, "task seeded on existing page");
                        return Ok(TaskState::new(delegation.goal, page));
                    }
                    info!(page_index, "page already in use, opening a new one");
                } else {
                    info!(page_index, "no such page, opening a new one");
                }
                url.clone().ok_or_else(|| {
                    AgentError::InvalidToolCall(format!("page {page_index} is unavailable and no url was given"))
                })?
            }
            DelegationTarget::NewPage { url } => url.clone(),
        };
        let page = self.pool.open_page().await?;
        self.leases.try_acquire(&page);
        info!(page = %page, url = %url, "task seeded on new page");
        Ok(TaskState::new(delegation.goal_for_new_page(&url), page))
    }

    fn fold(session: &mut ConversationSession, results: &[TerminalResult]) {
        for result in results {
            session.push(Turn::user(vec![encode_tool_response(result)]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakePages, RecordingTransport, ScriptedGateway};
    use crate::tools::decode_tool_response;
    use crate::types::TaskStatus;
    use serde_json::json;

    fn delegate(goal: &str, url: &str) -> Part {
        Part::invocation("web_interaction", json!({"goal": goal, "url": url}))
    }

    fn done(output: &str) -> Vec<Vec<Part>> {
        vec![vec![Part::invocation("done", json!({"output": output}))]]
    }

    fn coordinator(gateway: ScriptedGateway, pages: Arc<FakePages>, cfg: CoordinatorConfig) -> (Coordinator, Arc<ScriptedGateway>) {
        let gateway = Arc::new(gateway);
        (Coordinator::new(gateway.clone(), pages, cfg), gateway)
    }

    fn tool_results(session: &ConversationSession) -> Vec<TerminalResult> {
        session
            .history()
            .iter()
            .flat_map(|t| t.parts.iter())
            .filter_map(|p| decode_tool_response(p).ok())
            .collect()
    }

    #[test]
    fn cycle_transitions() {
        use CycleEvent::*;
        use CycleState::*;
        assert_eq!(AwaitingUserInput.next(UserMessage), ModelInvocation);
        assert_eq!(ModelInvocation.next(ModelFailed), AwaitingUserInput);
        let parts = vec![delegate("g", "https://a.com")];
        assert_eq!(ResponseEmit(parts.clone()).next(Emitted { delegate: true }), ToolDispatch(parts.clone()));
        assert_eq!(ResponseEmit(parts.clone()).next(Emitted { delegate: false }), AwaitingUserInput);
        assert_eq!(ToolDispatch(parts.clone()).next(DelegationLimitReached), AwaitingUserInput);
        assert_eq!(ResultFold(vec![]).next(Folded), ModelInvocation);
        assert_eq!(AwaitingUserInput.next(Folded), AwaitingUserInput);
    }

    #[tokio::test]
    async fn plain_answers_are_emitted_without_dispatch() {
        let gateway = ScriptedGateway::new().reply(vec![Part::text("Hello! What should I look up?")]);
        let pages = Arc::new(FakePages::new());
        let (coord, gateway) = coordinator(gateway, pages.clone(), CoordinatorConfig::default());
        let transport = RecordingTransport::new();
        let mut session = ConversationSession::new("c1");

        coord.handle_message(&mut session, "hi", &transport).await.unwrap();

        assert_eq!(session.history().len(), 2);
        assert_eq!(session.history()[0], Turn::user(vec![Part::text("hi")]));
        assert_eq!(gateway.conversation_calls(), 1);
        assert_eq!(gateway.task_calls(), 0);
        assert_eq!(pages.page_count(), 0);
        assert_eq!(transport.batches().len(), 1);
        assert!(session.last_user_message.is_none());
    }

    #[tokio::test]
    async fn user_message_carries_page_data_only_in_the_request() {
        let gateway = ScriptedGateway::new().reply(vec![Part::text("ok")]);
        let pages = Arc::new(FakePages::new());
        pages.open_page().await.unwrap();
        let (coord, gateway) = coordinator(gateway, pages, CoordinatorConfig::default());
        let mut session = ConversationSession::new("c1");

        coord.handle_message(&mut session, "what is open?", &RecordingTransport::new()).await.unwrap();

        let sent = &gateway.conversation_requests()[0];
        let Part::Text(prompt) = &sent.last().unwrap().parts[0] else { panic!("expected text") };
        assert!(prompt.starts_with("what is open?\n\n PAGE DATA IN JSON"));
        assert!(prompt.contains("\"page_index\": 0"));
        assert_eq!(session.history()[0], Turn::user(vec![Part::text("what is open?")]));
    }

    #[tokio::test]
    async fn gateway_failure_emits_one_error_and_keeps_history() {
        let gateway = ScriptedGateway::new()
            .reply(vec![Part::text("first answer")])
            .fail(AgentError::Gateway("quota exceeded".into()));
        let (coord, _) = coordinator(gateway, Arc::new(FakePages::new()), CoordinatorConfig::default());
        let transport = RecordingTransport::new();
        let mut session = ConversationSession::new("c1");

        coord.handle_message(&mut session, "one", &transport).await.unwrap();
        let before = session.history().to_vec();
        let err = coord.handle_message(&mut session, "two", &transport).await.unwrap_err();

        assert_eq!(err, AgentError::Gateway("quota exceeded".into()));
        assert_eq!(session.history(), before.as_slice());
        assert!(session.last_user_message.is_none());
        assert_eq!(transport.errors(), vec!["gateway error: quota exceeded".to_string()]);
    }

    #[tokio::test]
    async fn undecodable_invocation_is_stuck_in_its_slot() {
        let gateway = ScriptedGateway::new()
            .reply(vec![
                Part::invocation("web_interaction", json!({"url": "https://a.com"})),
                delegate("find mice", "https://b.com"),
            ])
            .reply(vec![Part::text("summary")])
            .task("", done("2 mice"));
        let pages = Arc::new(FakePages::new());
        let (coord, gateway) = coordinator(gateway, pages.clone(), CoordinatorConfig::default());
        let mut session = ConversationSession::new("c1");

        coord.handle_message(&mut session, "compare", &RecordingTransport::new()).await.unwrap();

        let results = tool_results(&session);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, TaskStatus::Stuck);
        assert!(results[0].output.contains("goal"), "{}", results[0].output);
        assert_eq!(results[1], TerminalResult::done("2 mice"));
        assert_eq!(gateway.task_calls(), 1);
        assert_eq!(pages.page_count(), 1);
    }

    #[tokio::test]
    async fn existing_page_is_reused_and_a_duplicate_index_gets_a_new_page() {
        let pages = Arc::new(FakePages::new());
        let first = pages.open_page().await.unwrap();
        let gateway = ScriptedGateway::new()
            .reply(vec![
                Part::invocation("web_interaction", json!({"goal": "read the cart", "page_index": 0})),
                Part::invocation("web_interaction", json!({"goal": "read the wishlist", "url": "https://shop.com/wish", "page_index": 0})),
            ])
            .reply(vec![Part::text("both read")])
            .task("cart", done("2 items"))
            .task("wishlist", done("5 items"));
        let (coord, gateway) = coordinator(gateway, pages.clone(), CoordinatorConfig::default());
        let mut session = ConversationSession::new("c1");

        coord.handle_message(&mut session, "check my account", &RecordingTransport::new()).await.unwrap();

        assert_eq!(pages.page_count(), 2);
        assert_eq!(tool_results(&session), vec![TerminalResult::done("2 items"), TerminalResult::done("5 items")]);
        let goals = gateway.task_completion_order();
        assert!(goals.contains(&"read the cart".to_string()));
        assert!(goals.contains(&"read the wishlist WEBSITE - https://shop.com/wish".to_string()));
        assert!(!coord.leases().is_leased(&first));
        assert!(session.dispatched.is_empty());
    }

    #[tokio::test]
    async fn delegation_rounds_are_capped() {
        let mut gateway = ScriptedGateway::new().task("", done("nothing new"));
        for _ in 0..3 {
            gateway = gateway.reply(vec![delegate("look again", "https://a.com")]);
        }
        let cfg = CoordinatorConfig { max_delegation_rounds: 2, ..CoordinatorConfig::default() };
        let (coord, gateway) = coordinator(gateway, Arc::new(FakePages::new()), cfg);
        let transport = RecordingTransport::new();
        let mut session = ConversationSession::new("c1");

        coord.handle_message(&mut session, "loop", &transport).await.unwrap();

        assert_eq!(gateway.conversation_calls(), 3);
        assert_eq!(gateway.task_calls(), 2);
        let results = tool_results(&session);
        assert_eq!(results.len(), 3);
        assert_eq!(results[2].status, TaskStatus::Stuck);
        assert_eq!(transport.errors().len(), 1);
        assert!(!session.pending_delegation);
    }

    #[tokio::test]
    async fn transport_failures_do_not_stop_the_cycle() {
        let gateway = ScriptedGateway::new()
            .reply(vec![delegate("find mice", "https://a.com")])
            .reply(vec![Part::text("Found some")])
            .task("", done("mice"));
        let (coord, _) = coordinator(gateway, Arc::new(FakePages::new()), CoordinatorConfig::default());
        let transport = RecordingTransport::failing();
        let mut session = ConversationSession::new("c1");

        coord.handle_message(&mut session, "mice", &transport).await.unwrap();
        assert_eq!(transport.batches().len(), 2);
        assert_eq!(session.history().len(), 4);
    }

    /// A tab whose summary script never returns.
    struct FrozenSummaries(FakePages);

    #[async_trait::async_trait]
    impl PagePool for FrozenSummaries {
        async fn open_page(&self) -> Result<crate::types::PageId, AgentError> {
            self.0.open_page().await
        }

        async fn page_at(&self, index: usize) -> Option<crate::types::PageId> {
            self.0.page_at(index).await
        }
    }

    #[async_trait::async_trait]
    impl PageStateProvider for FrozenSummaries {
        async fn snapshot(&self, page: &crate::types::PageId) -> Result<crate::types::Snapshot, AgentError> {
            self.0.snapshot(page).await
        }

        async fn perform(&self, page: &crate::types::PageId, command: &crate::page::PageCommand) -> Result<(), AgentError> {
            self.0.perform(page, command).await
        }

        async fn summaries(&self) -> Result<Vec<crate::types::PageSummary>, AgentError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn frozen_page_summaries_fall_back_to_an_empty_list() {
        let gateway = Arc::new(ScriptedGateway::new().reply(vec![Part::text("No pages open yet.")]));
        let cfg = CoordinatorConfig { call_timeout: Duration::from_millis(50), ..CoordinatorConfig::default() };
        let coord = Coordinator::new(gateway.clone(), Arc::new(FrozenSummaries(FakePages::new())), cfg);
        let mut session = ConversationSession::new("c1");

        let transport = RecordingTransport::new();
        let cycle = coord.handle_message(&mut session, "what is open?", &transport);
        tokio::time::timeout(Duration::from_secs(2), cycle)
            .await
            .expect("cycle must not wait on page summaries past the call timeout")
            .unwrap();

        let requests = gateway.conversation_requests();
        let Part::Text(prompt) = &requests[0].last().unwrap().parts[0] else { panic!("expected text") };
        assert!(prompt.ends_with("```json\n[]\n```"), "{prompt}");
        assert_eq!(session.history().len(), 2);
    }
}
