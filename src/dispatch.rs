use crate::executor::{TaskExecutor, TaskState};
use crate::types::{TaskStatus, TerminalResult};
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Wall-clock budget for a whole fan-out; unfinished tasks become `stuck`.
    pub deadline: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { deadline: Duration::from_secs(600) }
    }
}

/// Fan-out/fan-in over task executors.
///
/// All tasks run concurrently on the current task, and `dispatch` returns once
/// every one of them is terminal. Results come back in the order of the input
/// slice, whatever order the tasks finish in. A panicking or overdue task is
/// turned into a `stuck` result in its own slot; the join itself cannot fail.
#[derive(Clone)]
pub struct Dispatcher {
    executor: TaskExecutor,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(executor: TaskExecutor, cfg: DispatchConfig) -> Self {
        Self { executor, cfg }
    }

    pub async fn dispatch(&self, tasks: &mut [TaskState]) -> Vec<TerminalResult> {
        let deadline = Instant::now() + self.cfg.deadline;
        info!(tasks = tasks.len(), "dispatching browsing tasks");

        let runs = tasks.iter_mut().map(|task| async move {
            let guarded = AssertUnwindSafe(self.executor.run(&mut *task)).catch_unwind();
            let outcome = tokio::time::timeout_at(deadline, guarded).await;
            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => {
                    warn!(task = %task.id, "browsing task panicked");
                    TerminalResult::stuck("the browsing task crashed before finishing")
                }
                Err(_) => {
                    warn!(task = %task.id, "browsing task missed the dispatch deadline");
                    TerminalResult::stuck(format!(
                        "the browsing task did not finish within {}s",
                        self.cfg.deadline.as_secs()
                    ))
                }
            };
            task.status = result.status;
            result
        });
        let results = join_all(runs).await;

        debug_assert!(tasks.iter().all(|t| t.status.is_terminal()));
        let stuck = results.iter().filter(|r| r.status == TaskStatus::Stuck).count();
        info!(tasks = results.len(), stuck, "dispatch joined");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::fakes::{FakePages, ScriptedGateway};
    use crate::page::{PageCommand, PagePool, PageStateProvider};
    use crate::types::{AgentError, PageId, PageSummary, Part, Snapshot};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    fn executor(gateway: Arc<ScriptedGateway>, pages: Arc<dyn PageStateProvider>) -> TaskExecutor {
        TaskExecutor::new(
            gateway,
            pages,
            ExecutorConfig { max_iterations: 3, call_timeout: Duration::from_secs(2), wait_delay: Duration::from_millis(1) },
        )
    }

    #[tokio::test]
    async fn results_keep_invocation_order_whatever_finishes_first() {
        const N: usize = 4;
        let mut gateway = ScriptedGateway::new();
        for k in 0..N {
            // task k answers after (N - k) units, so the last one finishes first
            gateway = gateway.task_after(
                &format!("task-{k}"),
                Duration::from_millis(30 * (N - k) as u64),
                vec![vec![Part::invocation("done", json!({"output": format!("out-{k}")}))]],
            );
        }
        let gateway = Arc::new(gateway);
        let pages = Arc::new(FakePages::new());
        let mut tasks = Vec::new();
        for k in 0..N {
            tasks.push(TaskState::new(format!("task-{k}"), pages.open_page().await.unwrap()));
        }

        let dispatcher = Dispatcher::new(executor(gateway.clone(), pages.clone()), DispatchConfig::default());
        let results = dispatcher.dispatch(&mut tasks).await;

        assert_eq!(results.len(), N);
        for (k, r) in results.iter().enumerate() {
            assert_eq!(r, &TerminalResult::done(format!("out-{k}")));
        }
        let finished = gateway.task_completion_order();
        assert_eq!(finished.first().map(String::as_str), Some("task-3"));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Done));
    }

    struct PanickyPages {
        inner: FakePages,
        poisoned: PageId,
    }

    #[async_trait]
    impl PageStateProvider for PanickyPages {
        async fn snapshot(&self, page: &PageId) -> Result<Snapshot, AgentError> {
            if page == &self.poisoned {
                panic!("renderer crashed");
            }
            self.inner.snapshot(page).await
        }

        async fn perform(&self, page: &PageId, command: &PageCommand) -> Result<(), AgentError> {
            self.inner.perform(page, command).await
        }

        async fn summaries(&self) -> Result<Vec<PageSummary>, AgentError> {
            self.inner.summaries().await
        }
    }

    #[tokio::test]
    async fn a_panicking_task_does_not_abort_the_join() {
        let gateway = Arc::new(ScriptedGateway::new().task("", vec![vec![Part::invocation("done", json!({"output": "fine"}))]]));
        let inner = FakePages::new();
        let healthy = inner.open_page().await.unwrap();
        let poisoned = inner.open_page().await.unwrap();
        let pages = Arc::new(PanickyPages { inner, poisoned: poisoned.clone() });

        let mut tasks = vec![TaskState::new("a", poisoned), TaskState::new("b", healthy)];
        let dispatcher = Dispatcher::new(executor(gateway, pages), DispatchConfig::default());
        let results = dispatcher.dispatch(&mut tasks).await;

        assert_eq!(results[0].status, TaskStatus::Stuck);
        assert_eq!(results[1], TerminalResult::done("fine"));
        assert_eq!(tasks[0].status, TaskStatus::Stuck);
    }

    #[tokio::test]
    async fn overdue_tasks_are_stuck_at_the_deadline() {
        let gateway = ScriptedGateway::new()
            .task_after("slow", Duration::from_millis(500), vec![vec![Part::invocation("done", json!({"output": "late"}))]])
            .task("fast", vec![vec![Part::invocation("done", json!({"output": "quick"}))]]);
        let pages = Arc::new(FakePages::new());
        let mut tasks = vec![
            TaskState::new("slow", pages.open_page().await.unwrap()),
            TaskState::new("fast", pages.open_page().await.unwrap()),
        ];
        let dispatcher = Dispatcher::new(
            executor(Arc::new(gateway), pages.clone()),
            DispatchConfig { deadline: Duration::from_millis(100) },
        );
        let results = dispatcher.dispatch(&mut tasks).await;
        assert_eq!(results[0].status, TaskStatus::Stuck);
        assert_eq!(results[1], TerminalResult::done("quick"));
    }
}
