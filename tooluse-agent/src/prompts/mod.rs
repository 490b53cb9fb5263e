use crate::clients::ToolDefinition;

pub const THOUGHT_PREFIX: &str = "Thought:";
pub const ACTION_PREFIX: &str = "Action:";
pub const ACTION_INPUT_PREFIX: &str = "Action Input:";
pub const OBSERVATION_PREFIX: &str = "Observation:";
pub const FINAL_ANSWER_PREFIX: &str = "Final Answer:";

/// System prompt for prompted (ReAct) tool use. Tools are described in prose
/// because the endpoint never sees their definitions.
pub fn build_react_prompt(tools: &[ToolDefinition], system_prompt: Option<String>) -> String {
    if let Some(custom) = system_prompt.filter(|p| !p.is_empty()) {
        return custom;
    }

    let tools_section = if tools.is_empty() {
        "You have no tools available. Answer from your own knowledge.".to_string()
    } else {
        let tool_descriptions: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}\n  Parameters: {}", t.name, t.description, t.parameters))
            .collect();
        format!(
            "You have access to the following tools:\n{}",
            tool_descriptions.join("\n")
        )
    };

    let tool_names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();

    format!(
        r#"You are a helpful assistant that solves tasks step by step.

{}

## Response Format
Use exactly this format:

Thought: reason about what to do next
Action: the tool to use, one of [{}]
Action Input: the tool arguments as a JSON object
Observation: the tool result (provided to you, never write it yourself)

Repeat Thought/Action/Action Input/Observation as many times as needed. When you know the answer:

Thought: I now know the final answer
Final Answer: the answer to the original question"#,
        tools_section,
        tool_names.join(", ")
    )
}

/// System prompt for native function calling; tool definitions travel in the
/// request body, so the prompt stays short.
pub fn build_function_calling_prompt(system_prompt: Option<String>) -> String {
    match system_prompt {
        Some(custom) if !custom.is_empty() => custom,
        _ => "You are a helpful assistant. Use the provided tools when they help answer the \
              user's request, then reply with a concise final answer."
            .to_string(),
    }
}

pub fn build_observation_prompt(observation: &str) -> String {
    format!("{} {}", OBSERVATION_PREFIX, observation)
}

pub fn build_format_correction_prompt(response: &str) -> String {
    format!(
        r#"{} Your last reply did not follow the required format:
{}

Reply with either "Action:" and "Action Input:" lines, or a "Final Answer:" line."#,
        OBSERVATION_PREFIX,
        response.trim()
    )
}

pub fn build_question_prompt(task: &str) -> String {
    format!("Question: {}", task)
}
