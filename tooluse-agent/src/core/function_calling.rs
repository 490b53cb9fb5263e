use super::{AgentError, RunOutcome, Step, StepCallback, complete_with_usage, record_step};
use crate::clients::{CompletionRequest, LLMClient, Message, TokenUsage, ToolCall};
use crate::prompts::build_function_calling_prompt;
use crate::tools::{ToolExecutor, observation_text};
use serde_json::Value;
use std::sync::Arc;

const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Native function calling: tool definitions go out with every request and
/// the model answers with structured calls keyed by id.
pub struct FunctionCallingAgent {
    client: Arc<dyn LLMClient>,
    tools: Arc<dyn ToolExecutor>,
    max_iterations: usize,
    step_callback: Option<StepCallback>,
    system_prompt: Option<String>,
    temperature: Option<f32>,
}

impl FunctionCallingAgent {
    pub fn new(
        client: Arc<dyn LLMClient>,
        tools: Arc<dyn ToolExecutor>,
        max_iterations: Option<usize>,
        step_callback: Option<StepCallback>,
    ) -> Self {
        Self {
            client,
            tools,
            max_iterations: max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            step_callback,
            system_prompt: None,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub async fn run(&self, task: &str) -> Result<RunOutcome, AgentError> {
        let definitions = self.tools.definitions();
        let mut messages = vec![
            Message::system(build_function_calling_prompt(self.system_prompt.clone())),
            Message::user(task),
        ];
        let mut steps = Vec::new();
        let mut usage = TokenUsage::default();

        for llm_calls in 1..=self.max_iterations {
            let request = CompletionRequest::new(messages.clone())
                .with_tools(definitions.clone())
                .with_temperature(self.temperature);
            let completion = complete_with_usage(self.client.as_ref(), request, &mut usage).await?;

            if completion.tool_calls.is_empty() {
                if completion.content.trim().is_empty() {
                    return Err(AgentError::EmptyResponse);
                }
                messages.push(Message::assistant(completion.content.clone()));
                let step = Step::new(
                    completion.content.clone(),
                    String::new(),
                    Value::Null,
                    String::new(),
                    completion.content.clone(),
                );
                record_step(&mut steps, step, self.step_callback.as_ref());
                tracing::info!(llm_calls, "function calling agent finished");
                return Ok(RunOutcome {
                    answer: completion.content,
                    steps,
                    usage,
                    llm_calls,
                    messages,
                });
            }

            tracing::debug!(calls = completion.tool_calls.len(), "model requested tool calls");
            messages.push(Message::assistant_tool_calls(
                completion.content.clone(),
                completion.tool_calls.clone(),
            ));

            // Calls run concurrently; results go back in request order.
            let results = futures::future::join_all(
                completion.tool_calls.iter().map(|call| self.execute_call(call)),
            )
            .await;

            for (call, (arguments, observation)) in completion.tool_calls.iter().zip(results) {
                messages.push(Message::tool(call.id.clone(), observation.clone()));
                let step = Step::new(
                    completion.content.clone(),
                    call.function.name.clone(),
                    arguments,
                    observation,
                    call.function.arguments.clone(),
                );
                record_step(&mut steps, step, self.step_callback.as_ref());
            }
        }

        Err(AgentError::MaxStepsExceeded(self.max_iterations))
    }

    /// Failures are returned as the observation so the model can recover.
    async fn execute_call(&self, call: &ToolCall) -> (Value, String) {
        let raw = call.function.arguments.trim();
        let arguments = if raw.is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str::<Value>(raw) {
                Ok(arguments) => arguments,
                Err(e) => {
                    tracing::warn!(tool = %call.function.name, error = %e, "malformed tool arguments");
                    return (
                        Value::String(raw.to_string()),
                        format!("Error: arguments are not valid JSON: {}", e),
                    );
                }
            }
        };

        match self.tools.execute(&call.function.name, arguments.clone()).await {
            Ok(result) => (arguments, observation_text(&result)),
            Err(e) => {
                tracing::warn!(tool = %call.function.name, error = %e, "tool call failed");
                (arguments, format!("Error: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MessageRole;
    use crate::testing::{ScriptedClient, text, tool_calls, with_usage};
    use crate::tools::default_tools;
    use std::path::PathBuf;

    fn agent(client: Arc<ScriptedClient>, max_iterations: usize) -> FunctionCallingAgent {
        FunctionCallingAgent::new(
            client,
            Arc::new(default_tools(PathBuf::from("."))),
            Some(max_iterations),
            None,
        )
    }

    #[tokio::test]
    async fn test_run_parallel_calls_keyed_by_id() {
        let client = Arc::new(ScriptedClient::new(vec![
            with_usage(
                tool_calls(&[
                    (
                        "call_a",
                        "calculator",
                        serde_json::json!({"operation": "multiply", "a": 6, "b": 7}),
                    ),
                    (
                        "call_b",
                        "calculator",
                        serde_json::json!({"operation": "subtract", "a": 10, "b": 4}),
                    ),
                ]),
                100,
                30,
            ),
            with_usage(text("6 * 7 = 42 and 10 - 4 = 6."), 160, 12),
        ]));

        let outcome = agent(Arc::clone(&client), 5)
            .run("Compute 6*7 and 10-4")
            .await
            .unwrap();

        assert_eq!(outcome.answer, "6 * 7 = 42 and 10 - 4 = 6.");
        assert_eq!(outcome.llm_calls, 2);
        assert_eq!(outcome.tool_calls(), 2);
        assert_eq!(outcome.usage, TokenUsage::new(260, 42));

        let requests = client.requests();
        assert_eq!(requests[0].tools.len(), 4);
        assert!(requests[0].stop.is_empty());

        let second = &requests[1].messages;
        assert_eq!(second[2].role, MessageRole::Assistant);
        assert_eq!(second[2].tool_calls.as_ref().unwrap().len(), 2);
        assert_eq!(second[3].tool_call_id.as_deref(), Some("call_a"));
        assert!(second[3].content.contains("\"result\":42"));
        assert_eq!(second[4].tool_call_id.as_deref(), Some("call_b"));
        assert!(second[4].content.contains("\"result\":6"));
    }

    #[tokio::test]
    async fn test_errors_are_reported_to_the_model() {
        let mut broken = tool_calls(&[("call_1", "calculator", Value::Null)]);
        broken.tool_calls[0].function.arguments = "{\"operation\": ".to_string();
        let both = tool_calls(&[
            ("call_2", "teleport", serde_json::json!({})),
            (
                "call_3",
                "calculator",
                serde_json::json!({"operation": "divide", "a": 1, "b": 0}),
            ),
        ]);

        let client = Arc::new(ScriptedClient::new(vec![broken, both, text("Cannot do that.")]));

        let outcome = agent(Arc::clone(&client), 5).run("task").await.unwrap();

        assert_eq!(outcome.answer, "Cannot do that.");
        assert!(outcome.steps[0].observation.contains("not valid JSON"));
        assert!(outcome.steps[1].observation.contains("Unknown tool: teleport"));
        assert!(outcome.steps[2].observation.contains("Division by zero"));
    }

    #[tokio::test]
    async fn test_missing_usage_is_estimated() {
        let client = Arc::new(ScriptedClient::new(vec![text("Hello there")]));
        let outcome = agent(client, 2).run("Say hello").await.unwrap();
        assert!(outcome.usage.prompt_tokens > 0);
        assert_eq!(outcome.usage.completion_tokens, 3);
    }

    #[tokio::test]
    async fn test_max_iterations_exceeded() {
        let call = || tool_calls(&[("call", "list_dir", serde_json::json!({}))]);
        let client = Arc::new(ScriptedClient::new(vec![call(), call()]));

        let err = agent(client, 2).run("loop").await.unwrap_err();
        assert!(matches!(err, AgentError::MaxStepsExceeded(2)));
    }

    #[tokio::test]
    async fn test_llm_failure_propagates() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let err = agent(client, 2).run("task").await.unwrap_err();
        assert!(matches!(err, AgentError::LLMError(_)));
    }
}
