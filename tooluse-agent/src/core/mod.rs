//! Agent loops: prompted ReAct tool use and native function calling.

pub mod function_calling;
pub mod react;

pub use function_calling::FunctionCallingAgent;
pub use react::{ReactAgent, ReactOutput, parse_react_output};

use crate::clients::{Completion, CompletionRequest, LLMClient, LLMError, Message, TokenUsage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub thought: String,
    pub action: String,
    pub action_input: serde_json::Value,
    pub observation: String,
    pub raw: String,
}

impl Step {
    pub fn new(
        thought: String,
        action: String,
        action_input: serde_json::Value,
        observation: String,
        raw: String,
    ) -> Self {
        Self {
            thought,
            action,
            action_input,
            observation,
            raw,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        !self.action.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LLMError(#[from] LLMError),
    #[error("Max steps exceeded ({0})")]
    MaxStepsExceeded(usize),
    #[error("Model returned an empty response")]
    EmptyResponse,
}

pub type StepCallback = Arc<dyn Fn(usize, Step) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub answer: String,
    pub steps: Vec<Step>,
    pub usage: TokenUsage,
    pub llm_calls: usize,
    pub messages: Vec<Message>,
}

impl RunOutcome {
    pub fn tool_calls(&self) -> usize {
        self.steps.iter().filter(|s| s.is_tool_call()).count()
    }
}

/// One completion round trip; reported usage is added to `usage`, or an
/// estimate when the endpoint reported none.
pub(crate) async fn complete_with_usage(
    client: &dyn LLMClient,
    request: CompletionRequest,
    usage: &mut TokenUsage,
) -> Result<Completion, AgentError> {
    let completion = client.complete(request.clone()).await?;
    *usage += completion
        .usage
        .unwrap_or_else(|| TokenUsage::estimate(&request, &completion));
    Ok(completion)
}

pub(crate) fn record_step(
    steps: &mut Vec<Step>,
    step: Step,
    callback: Option<&StepCallback>,
) {
    steps.push(step.clone());
    if let Some(callback) = callback {
        callback(steps.len(), step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_new() {
        let step = Step::new(
            "Thinking".to_string(),
            "read_file".to_string(),
            serde_json::json!({"path": "test.txt"}),
            "File content".to_string(),
            "raw response".to_string(),
        );

        assert_eq!(step.thought, "Thinking");
        assert_eq!(step.action, "read_file");
        assert!(step.is_tool_call());
    }

    #[test]
    fn test_record_step_invokes_callback() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: StepCallback = Arc::new(move |index, step: Step| {
            sink.lock().unwrap().push((index, step.action));
        });

        let mut steps = Vec::new();
        let step = Step::new(
            String::new(),
            "calculator".to_string(),
            serde_json::Value::Null,
            String::new(),
            String::new(),
        );
        record_step(&mut steps, step.clone(), Some(&callback));
        record_step(&mut steps, step, Some(&callback));

        assert_eq!(steps.len(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, "calculator".to_string()), (2, "calculator".to_string())]
        );
    }
}
