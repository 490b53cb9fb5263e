//! Runs one task through each tool-use approach and reports latency, token
//! usage and call counts side by side.

use crate::clients::{LLMClient, TokenUsage};
use crate::core::{AgentError, FunctionCallingAgent, ReactAgent, RunOutcome};
use crate::tools::ToolExecutor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approach {
    React,
    FunctionCalling,
    Mcp,
}

impl Approach {
    pub fn label(&self) -> &'static str {
        match self {
            Approach::React => "ReAct",
            Approach::FunctionCalling => "Function Calling",
            Approach::Mcp => "MCP",
        }
    }
}

impl fmt::Display for Approach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSample {
    pub approach: Approach,
    pub run: usize,
    pub latency_ms: u64,
    pub usage: TokenUsage,
    pub llm_calls: usize,
    pub tool_calls: usize,
    pub success: bool,
    pub answer: Option<String>,
    pub error: Option<String>,
}

impl RunSample {
    fn from_result(
        approach: Approach,
        run: usize,
        latency_ms: u64,
        result: Result<RunOutcome, AgentError>,
    ) -> Self {
        match result {
            Ok(outcome) => Self {
                approach,
                run,
                latency_ms,
                usage: outcome.usage,
                llm_calls: outcome.llm_calls,
                tool_calls: outcome.tool_calls(),
                success: true,
                answer: Some(outcome.answer),
                error: None,
            },
            Err(e) => Self {
                approach,
                run,
                latency_ms,
                usage: TokenUsage::default(),
                llm_calls: 0,
                tool_calls: 0,
                success: false,
                answer: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Averages are taken over successful runs only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproachSummary {
    pub approach: Approach,
    pub runs: usize,
    pub successes: usize,
    pub avg_latency_ms: f64,
    pub avg_prompt_tokens: f64,
    pub avg_completion_tokens: f64,
    pub avg_total_tokens: f64,
    pub avg_llm_calls: f64,
    pub avg_tool_calls: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub task: String,
    pub samples: Vec<RunSample>,
    pub summaries: Vec<ApproachSummary>,
}

fn average(values: impl Iterator<Item = f64>, count: usize) -> f64 {
    if count == 0 {
        return 0.0;
    }
    values.sum::<f64>() / count as f64
}

pub fn summarize(approach: Approach, samples: &[RunSample]) -> ApproachSummary {
    let runs: Vec<&RunSample> = samples.iter().filter(|s| s.approach == approach).collect();
    let ok: Vec<&RunSample> = runs.iter().copied().filter(|s| s.success).collect();
    let n = ok.len();

    ApproachSummary {
        approach,
        runs: runs.len(),
        successes: n,
        avg_latency_ms: average(ok.iter().map(|s| s.latency_ms as f64), n),
        avg_prompt_tokens: average(ok.iter().map(|s| s.usage.prompt_tokens as f64), n),
        avg_completion_tokens: average(ok.iter().map(|s| s.usage.completion_tokens as f64), n),
        avg_total_tokens: average(ok.iter().map(|s| s.usage.total_tokens as f64), n),
        avg_llm_calls: average(ok.iter().map(|s| s.llm_calls as f64), n),
        avg_tool_calls: average(ok.iter().map(|s| s.tool_calls as f64), n),
    }
}

impl ComparisonReport {
    pub fn new(task: impl Into<String>, samples: Vec<RunSample>) -> Self {
        let mut approaches: Vec<Approach> = samples.iter().map(|s| s.approach).collect();
        approaches.sort();
        approaches.dedup();

        let summaries = approaches
            .into_iter()
            .map(|approach| summarize(approach, &samples))
            .collect();

        Self {
            task: task.into(),
            samples,
            summaries,
        }
    }

    pub fn render_table(&self) -> String {
        let mut out = format!("Task: {}\n\n", self.task);
        out.push_str(&format!(
            "{:<18} {:>7} {:>12} {:>10} {:>10} {:>10} {:>9} {:>10}\n",
            "Approach", "OK", "Latency ms", "Prompt", "Output", "Total", "LLM calls", "Tool calls"
        ));
        out.push_str(&format!("{}\n", "-".repeat(93)));
        for s in &self.summaries {
            out.push_str(&format!(
                "{:<18} {:>7} {:>12.0} {:>10.1} {:>10.1} {:>10.1} {:>9.1} {:>10.1}\n",
                s.approach.label(),
                format!("{}/{}", s.successes, s.runs),
                s.avg_latency_ms,
                s.avg_prompt_tokens,
                s.avg_completion_tokens,
                s.avg_total_tokens,
                s.avg_llm_calls,
                s.avg_tool_calls,
            ));
        }

        let failures: Vec<&RunSample> = self.samples.iter().filter(|s| !s.success).collect();
        if !failures.is_empty() {
            out.push_str("\nFailures:\n");
            for s in failures {
                out.push_str(&format!(
                    "  {} run {}: {}\n",
                    s.approach.label(),
                    s.run,
                    s.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// What to run: ReAct and function calling always use `local_tools`; the MCP
/// approach runs function calling on `mcp_tools` when present.
pub struct Comparison {
    client: Arc<dyn LLMClient>,
    local_tools: Arc<dyn ToolExecutor>,
    mcp_tools: Option<Arc<dyn ToolExecutor>>,
    max_steps: Option<usize>,
    temperature: Option<f32>,
}

impl Comparison {
    pub fn new(client: Arc<dyn LLMClient>, local_tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            client,
            local_tools,
            mcp_tools: None,
            max_steps: None,
            temperature: None,
        }
    }

    pub fn with_mcp_tools(mut self, mcp_tools: Option<Arc<dyn ToolExecutor>>) -> Self {
        self.mcp_tools = mcp_tools;
        self
    }

    pub fn with_max_steps(mut self, max_steps: Option<usize>) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn approaches(&self) -> Vec<Approach> {
        let mut approaches = vec![Approach::React, Approach::FunctionCalling];
        if self.mcp_tools.is_some() {
            approaches.push(Approach::Mcp);
        }
        approaches
    }

    async fn run_once(&self, approach: Approach, task: &str) -> Result<RunOutcome, AgentError> {
        match approach {
            Approach::React => {
                ReactAgent::new(
                    Arc::clone(&self.client),
                    Arc::clone(&self.local_tools),
                    self.max_steps,
                    None,
                )
                .with_temperature(self.temperature)
                .run(task)
                .await
            }
            Approach::FunctionCalling | Approach::Mcp => {
                let tools = match (&self.mcp_tools, approach) {
                    (Some(mcp), Approach::Mcp) => Arc::clone(mcp),
                    _ => Arc::clone(&self.local_tools),
                };
                FunctionCallingAgent::new(Arc::clone(&self.client), tools, self.max_steps, None)
                    .with_temperature(self.temperature)
                    .run(task)
                    .await
            }
        }
    }

    /// Runs are sequential so latencies do not overlap.
    pub async fn run(&self, task: &str, runs: usize) -> ComparisonReport {
        let mut samples = Vec::new();
        for approach in self.approaches() {
            for run in 1..=runs {
                let started = Instant::now();
                let result = self.run_once(approach, task).await;
                let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

                match &result {
                    Ok(outcome) => tracing::info!(
                        approach = %approach,
                        run,
                        latency_ms,
                        total_tokens = outcome.usage.total_tokens,
                        "comparison run finished"
                    ),
                    Err(e) => tracing::warn!(approach = %approach, run, error = %e, "comparison run failed"),
                }
                samples.push(RunSample::from_result(approach, run, latency_ms, result));
            }
        }
        ComparisonReport::new(task, samples)
    }
}
