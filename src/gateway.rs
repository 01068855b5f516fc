use crate::tools::ToolSchema;
use crate::types::{AgentError, Part, Turn};
use async_trait::async_trait;
use std::time::Duration;

/// Black-box text/tool-call generator.
///
/// Implementations return at least one part. Callers using [`ToolSchema::Task`]
/// expect exactly one tool invocation among them.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn generate(&self, schema: &ToolSchema, contents: &[Turn]) -> Result<Vec<Part>, AgentError>;
}

/// Runs one gateway call under a deadline; expiry and empty answers are errors.
pub async fn generate_within(
    gateway: &dyn ModelGateway,
    schema: &ToolSchema,
    contents: &[Turn],
    limit: Duration,
) -> Result<Vec<Part>, AgentError> {
    let parts = tokio::time::timeout(limit, gateway.generate(schema, contents))
        .await
        .map_err(|_| AgentError::Timeout(format!("model call exceeded {}ms", limit.as_millis())))??;
    if parts.is_empty() {
        return Err(AgentError::Gateway("model returned no parts".into()));
    }
    Ok(parts)
}
