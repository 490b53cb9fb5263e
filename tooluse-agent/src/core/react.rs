use super::{AgentError, RunOutcome, Step, StepCallback, complete_with_usage, record_step};
use crate::clients::{CompletionRequest, LLMClient, Message, TokenUsage};
use crate::prompts::{
    ACTION_INPUT_PREFIX, ACTION_PREFIX, FINAL_ANSWER_PREFIX, OBSERVATION_PREFIX, THOUGHT_PREFIX,
    build_format_correction_prompt, build_observation_prompt, build_question_prompt,
    build_react_prompt,
};
use crate::tools::{ToolExecutor, observation_text};
use serde_json::Value;
use std::sync::Arc;

const DEFAULT_MAX_STEPS: usize = 10;

/// One parsed model turn in the Thought/Action/Observation format.
#[derive(Debug, Clone, PartialEq)]
pub enum ReactOutput {
    Action {
        thought: String,
        action: String,
        input: Value,
    },
    FinalAnswer {
        thought: String,
        answer: String,
    },
    Malformed(String),
}

pub fn parse_react_output(text: &str) -> ReactOutput {
    // Anything after a self-written observation is hallucinated.
    let text = match text.find(OBSERVATION_PREFIX) {
        Some(pos) => &text[..pos],
        None => text,
    };

    let action_pos = text.find(ACTION_PREFIX);
    let final_pos = text.find(FINAL_ANSWER_PREFIX);

    match (action_pos, final_pos) {
        (Some(action), final_pos) if final_pos.is_none_or(|f| action < f) => {
            parse_action(text, action)
        }
        (_, Some(final_pos)) => ReactOutput::FinalAnswer {
            thought: thought_before(text, final_pos),
            answer: text[final_pos + FINAL_ANSWER_PREFIX.len()..].trim().to_string(),
        },
        _ => ReactOutput::Malformed(text.trim().to_string()),
    }
}

fn parse_action(text: &str, action_pos: usize) -> ReactOutput {
    let after_action = &text[action_pos + ACTION_PREFIX.len()..];
    let Some(input_pos) = after_action.find(ACTION_INPUT_PREFIX) else {
        return ReactOutput::Malformed(text.trim().to_string());
    };

    let action = after_action[..input_pos]
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .trim_matches(|c| c == '`' || c == '"' || c == '\'')
        .to_string();
    if action.is_empty() {
        return ReactOutput::Malformed(text.trim().to_string());
    }

    let mut raw_input = &after_action[input_pos + ACTION_INPUT_PREFIX.len()..];
    if let Some(final_pos) = raw_input.find(FINAL_ANSWER_PREFIX) {
        raw_input = &raw_input[..final_pos];
    }

    ReactOutput::Action {
        thought: thought_before(text, action_pos),
        action,
        input: parse_action_input(raw_input),
    }
}

/// JSON objects are passed through; anything else is wrapped as
/// `{"input": text}`.
fn parse_action_input(raw: &str) -> Value {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .trim_end_matches('`')
        .trim();

    if unfenced.is_empty() {
        return serde_json::json!({});
    }
    if unfenced.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(unfenced) {
            return value;
        }
    }
    serde_json::json!({ "input": unfenced })
}

fn thought_before(text: &str, end: usize) -> String {
    let head = text[..end].trim();
    match head.rfind(THOUGHT_PREFIX) {
        Some(pos) => head[pos + THOUGHT_PREFIX.len()..].trim().to_string(),
        None => head.to_string(),
    }
}

/// Prompted tool use: the endpoint never receives tool definitions, the
/// prompt describes them and actions are parsed out of the generated text.
pub struct ReactAgent {
    client: Arc<dyn LLMClient>,
    tools: Arc<dyn ToolExecutor>,
    max_steps: usize,
    step_callback: Option<StepCallback>,
    system_prompt: Option<String>,
    temperature: Option<f32>,
}

impl ReactAgent {
    pub fn new(
        client: Arc<dyn LLMClient>,
        tools: Arc<dyn ToolExecutor>,
        max_steps: Option<usize>,
        step_callback: Option<StepCallback>,
    ) -> Self {
        Self {
            client,
            tools,
            max_steps: max_steps.unwrap_or(DEFAULT_MAX_STEPS),
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
            Message::system(build_react_prompt(&definitions, self.system_prompt.clone())),
            Message::user(build_question_prompt(task)),
        ];
        let mut steps = Vec::new();
        let mut usage = TokenUsage::default();

        for llm_calls in 1..=self.max_steps {
            let request = CompletionRequest::new(messages.clone())
                .with_stop(vec![OBSERVATION_PREFIX.to_string()])
                .with_temperature(self.temperature);
            let completion = complete_with_usage(self.client.as_ref(), request, &mut usage).await?;

            let raw = completion.content;
            if raw.trim().is_empty() {
                return Err(AgentError::EmptyResponse);
            }
            messages.push(Message::assistant(raw.trim_end()));

            match parse_react_output(&raw) {
                ReactOutput::FinalAnswer { thought, answer } => {
                    let step = Step::new(thought, String::new(), Value::Null, String::new(), raw);
                    record_step(&mut steps, step, self.step_callback.as_ref());
                    tracing::info!(llm_calls, "react agent finished");
                    return Ok(RunOutcome {
                        answer,
                        steps,
                        usage,
                        llm_calls,
                        messages,
                    });
                }
                ReactOutput::Action {
                    thought,
                    action,
                    input,
                } => {
                    tracing::debug!(tool = %action, "react action");
                    let observation = match self.tools.execute(&action, input.clone()).await {
                        Ok(result) => observation_text(&result),
                        Err(e) => {
                            tracing::warn!(tool = %action, error = %e, "tool call failed");
                            format!("Error: {}", e)
                        }
                    };
                    messages.push(Message::user(build_observation_prompt(&observation)));
                    let step = Step::new(thought, action, input, observation, raw);
                    record_step(&mut steps, step, self.step_callback.as_ref());
                }
                ReactOutput::Malformed(text) => {
                    tracing::warn!("react output did not follow the format");
                    let correction = build_format_correction_prompt(&text);
                    messages.push(Message::user(correction.clone()));
                    let step = Step::new(text, String::new(), Value::Null, correction, raw);
                    record_step(&mut steps, step, self.step_callback.as_ref());
                }
            }
        }

        Err(AgentError::MaxStepsExceeded(self.max_steps))
    }
}
