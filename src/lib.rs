pub mod browser;
pub mod chromium;
pub mod coordinator;
pub mod dispatch;
pub mod executor;
#[cfg(any(test, feature = "testing"))]
pub mod fakes;
pub mod gateway;
pub mod gemini;
pub mod page;
pub mod server;
pub mod session;
pub mod tools;
pub mod transport;
pub mod types;

pub use browser::{Browser, BrowserConfig};
pub use chromium::ChromiumPages;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use dispatch::{DispatchConfig, Dispatcher};
pub use executor::{ExecutorConfig, TaskExecutor, TaskState};
pub use gateway::ModelGateway;
pub use gemini::{GeminiClient, GeminiConfig};
pub use session::{ConversationSession, SessionStore};
pub use types::{AgentError, TaskStatus, TerminalResult};
