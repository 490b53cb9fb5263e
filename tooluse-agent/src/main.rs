use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt};
use tooluse_agent::clients::{
    CompletionRequest, LLMClient, Message, StreamChunk, create_llm_client,
};
use tooluse_agent::compare::Comparison;
use tooluse_agent::config::{DEFAULT_MCP_CONFIG, LlmOverrides, LlmSettings};
use tooluse_agent::core::{FunctionCallingAgent, ReactAgent, RunOutcome, Step, StepCallback};
use tooluse_agent::mcp::{MCPConfig, MCPManager, MCPServerConfig, default_server, load_mcp_config};
use tooluse_agent::tools::{ToolExecutor, default_tools};
use tracing_subscriber::EnvFilter;

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const CHAT_TEMPERATURE: f32 = 0.7;
const CHAT_MAX_TOKENS: u32 = 150;
const OBSERVATION_PREVIEW: usize = 500;

#[derive(Parser, Debug)]
#[command(name = "tooluse-agent")]
#[command(version)]
#[command(about = "ReAct, function calling and MCP tool use side by side", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    api_key: Option<String>,

    #[arg(short, long, global = true, help = "Model name (defaults to $MODEL)")]
    model: Option<String>,

    #[arg(short, long, global = true)]
    provider: Option<String>,

    #[arg(short, long, global = true, help = "Base URL for the LLM API")]
    base_url: Option<String>,

    #[arg(short, long, global = true, default_value = ".")]
    workdir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Interactive single-turn chat")]
    Chat,

    #[command(about = "Run a task with the prompted ReAct agent")]
    React {
        #[arg(short, long, help = "Task description")]
        task: String,

        #[arg(short = 's', long, help = "Maximum steps")]
        max_steps: Option<usize>,
    },

    #[command(about = "Run a task with native function calling")]
    Call {
        #[arg(short, long, help = "Task description")]
        task: String,

        #[arg(short = 's', long, help = "Maximum iterations")]
        max_steps: Option<usize>,
    },

    #[command(about = "Talk to MCP servers")]
    Mcp {
        #[command(subcommand)]
        command: McpCommands,

        #[arg(short, long, global = true, default_value = DEFAULT_MCP_CONFIG)]
        config: PathBuf,

        #[arg(long, global = true, help = "Only connect this server")]
        server: Option<String>,
    },

    #[command(about = "Check MCP configuration")]
    CheckMcp {
        #[arg(short, long, default_value = DEFAULT_MCP_CONFIG)]
        config: PathBuf,
    },

    #[command(about = "Serve the built-in tools as a stdio MCP server")]
    Serve,

    #[command(about = "Compare ReAct, function calling and MCP on one task")]
    Compare {
        #[arg(short, long, help = "Task description")]
        task: String,

        #[arg(short, long, default_value_t = 3)]
        runs: usize,

        #[arg(short = 's', long)]
        max_steps: Option<usize>,

        #[arg(short, long, help = "MCP config for the MCP approach")]
        config: Option<PathBuf>,

        #[arg(long, help = "Use this binary's own MCP server for the MCP approach")]
        self_serve: bool,

        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum McpCommands {
    #[command(about = "List tools, resources and prompts")]
    List,

    #[command(about = "Call one tool directly")]
    Call {
        #[arg(short, long)]
        tool: String,

        #[arg(short = 'j', long, default_value = "{}", help = "Arguments as a JSON object")]
        args: String,
    },

    #[command(about = "Run a task with function calling over MCP tools")]
    Ask {
        #[arg(short, long)]
        task: String,

        #[arg(short = 's', long)]
        max_steps: Option<usize>,
    },
}

fn build_client(args: &Args) -> Result<Arc<dyn LLMClient>> {
    let settings = LlmSettings::from_env(LlmOverrides {
        api_key: args.api_key.clone(),
        model: args.model.clone(),
        provider: args.provider.clone(),
        base_url: args.base_url.clone(),
    })?;
    let client = create_llm_client(
        &settings.provider,
        settings.api_key,
        settings.model,
        settings.base_url,
    )?;
    Ok(Arc::from(client))
}

fn preview(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

fn print_step(index: usize, step: Step) {
    println!("{}", format!("--- Step {} ---", index).bold());
    if !step.thought.is_empty() {
        println!("{} {}", "Thought:".cyan(), step.thought);
    }
    if step.is_tool_call() {
        println!("{} {}", "Action:".yellow(), step.action);
        println!("{} {}", "Action Input:".yellow(), step.action_input);
    }
    if !step.observation.is_empty() {
        println!(
            "{} {}",
            "Observation:".green(),
            preview(&step.observation, OBSERVATION_PREVIEW)
        );
    }
}

fn step_printer() -> StepCallback {
    Arc::new(print_step)
}

fn print_outcome(outcome: &RunOutcome) {
    println!("\n{}", "=== Final Answer ===".bold());
    println!("{}", outcome.answer);
    println!(
        "\n{} LLM calls: {}, tool calls: {}, tokens: {} prompt + {} completion = {}",
        "Stats:".dimmed(),
        outcome.llm_calls,
        outcome.tool_calls(),
        outcome.usage.prompt_tokens,
        outcome.usage.completion_tokens,
        outcome.usage.total_tokens,
    );
}

async fn run_chat(client: Arc<dyn LLMClient>) -> Result<()> {
    let model = client.model_info().name;
    println!("Chatting with {}. Type 'exit' or 'quit' to end.", model.bold());

    let mut lines = io::BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Goodbye!");
            break;
        }

        let request = CompletionRequest::new(vec![
            Message::system(CHAT_SYSTEM_PROMPT),
            Message::user(input),
        ])
        .with_temperature(Some(CHAT_TEMPERATURE))
        .with_max_tokens(Some(CHAT_MAX_TOKENS));

        let mut stream = match client.stream_complete(request).await {
            Ok(stream) => stream,
            Err(e) => {
                println!("{} {}", "Error:".red(), e);
                continue;
            }
        };
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(StreamChunk::Content(text)) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Ok(_) => {}
                Err(e) => {
                    println!("\n{} {}", "Error:".red(), e);
                    break;
                }
            }
        }
        stdout.write_all(b"\n").await?;
    }

    Ok(())
}

async fn connect_manager(config_path: &Path, server: Option<&str>) -> Result<MCPManager> {
    let config = load_mcp_config(config_path).await?;
    if config.servers.is_empty() {
        bail!("no MCP servers configured in {}", config_path.display());
    }

    let mut manager = MCPManager::new(config);
    match server {
        Some(name) => {
            manager
                .connect_server(name)
                .await
                .with_context(|| format!("connecting to MCP server '{}'", name))?;
        }
        None => {
            for (name, error) in manager.connect_all().await {
                eprintln!("{} {}: {}", "Failed to connect".red(), name, error);
            }
        }
    }

    if manager.server_names().is_empty() {
        bail!("no MCP server could be connected");
    }
    Ok(manager)
}

async fn list_mcp(manager: &MCPManager) -> Result<()> {
    for name in manager.server_names() {
        let Some(client) = manager.client(&name) else {
            continue;
        };
        match client.server_info() {
            Some(info) => println!(
                "{} {} ({} {}, protocol {})",
                "Server".bold(),
                name.bold(),
                info.server_info.name,
                info.server_info.version,
                info.protocol_version
            ),
            None => println!("{} {}", "Server".bold(), name.bold()),
        }

        println!("  {}", "Tools:".cyan());
        for tool in client.list_tools().await? {
            println!(
                "    - {}: {}",
                tool.name,
                tool.description.as_deref().unwrap_or("")
            );
        }

        let resources = client.list_resources().await?;
        if !resources.is_empty() {
            println!("  {}", "Resources:".cyan());
            for resource in resources {
                println!("    - {} ({})", resource.uri, resource.name);
            }
        }

        let prompts = client.list_prompts().await?;
        if !prompts.is_empty() {
            println!("  {}", "Prompts:".cyan());
            for prompt in prompts {
                let arguments: Vec<String> = prompt.arguments.iter().map(|a| a.name.clone()).collect();
                println!("    - {}({})", prompt.name, arguments.join(", "));
            }
        }
    }
    Ok(())
}

async fn shutdown_shared(manager: Arc<MCPManager>) {
    if let Ok(mut manager) = Arc::try_unwrap(manager) {
        manager.shutdown().await;
    }
}

async fn ask_mcp(
    args: &Args,
    manager: Arc<MCPManager>,
    task: &str,
    max_steps: Option<usize>,
) -> Result<()> {
    let agent = FunctionCallingAgent::new(build_client(args)?, manager, max_steps, Some(step_printer()));
    println!("Starting function calling agent over MCP tools with task: {}\n", task);
    print_outcome(&agent.run(task).await?);
    Ok(())
}

async fn call_mcp(manager: &MCPManager, tool: &str, raw: &str) -> Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(raw).context("--args must be valid JSON")?;
    let result = manager.call_tool(tool, arguments).await?;
    if result.is_error {
        println!("{} {}", "Tool error:".red(), result.text());
    } else {
        println!("{}", result.text());
    }
    Ok(())
}

async fn run_mcp(args: &Args, command: &McpCommands, config: &Path, server: Option<&str>) -> Result<()> {
    let manager = Arc::new(connect_manager(config, server).await?);

    let result = match command {
        McpCommands::List => list_mcp(&manager).await,
        McpCommands::Call { tool, args: raw } => call_mcp(&manager, tool, raw).await,
        McpCommands::Ask { task, max_steps } => {
            ask_mcp(args, Arc::clone(&manager), task, *max_steps).await
        }
    };

    shutdown_shared(manager).await;
    result
}

async fn check_mcp(config_path: &Path) -> Result<()> {
    println!("Checking MCP configuration at: {}", config_path.display());

    let config = match load_mcp_config(config_path).await {
        Ok(config) => config,
        Err(e) => {
            println!("{} {}", "Failed to load MCP configuration:".red(), e);
            return Ok(());
        }
    };
    println!("Number of configured servers: {}", config.servers.len());

    for (name, server_config) in &config.servers {
        match (&server_config.command, &server_config.url) {
            (Some(command), _) => {
                println!("  - {}: {} {}", name, command, server_config.args.join(" "))
            }
            (None, Some(url)) => println!("  - {}: {}", name, url),
            (None, None) => println!("  - {}: (no transport)", name),
        }

        let mut manager = MCPManager::new(config.clone());
        match manager.connect_server(name).await {
            Ok(count) => println!("    {} {} tools", "ok".green(), count),
            Err(e) => println!("    {} {}", "failed".red(), e),
        }
        manager.shutdown().await;
    }
    Ok(())
}

/// This binary's own `serve` subcommand, as a stdio server config.
fn self_server_config(workdir: &Path) -> Result<MCPServerConfig> {
    let exe = std::env::current_exe().context("locating the current executable")?;
    Ok(MCPServerConfig::stdio(
        exe.to_string_lossy(),
        vec![
            "serve".to_string(),
            "--workdir".to_string(),
            workdir.to_string_lossy().into_owned(),
        ],
    ))
}

async fn run_compare(
    args: &Args,
    task: &str,
    runs: usize,
    max_steps: Option<usize>,
    config: Option<&Path>,
    self_serve: bool,
    json: bool,
) -> Result<()> {
    let client = build_client(args)?;
    let local: Arc<dyn ToolExecutor> = Arc::new(default_tools(args.workdir.clone()));

    let manager = if self_serve {
        let servers = BTreeMap::from([("local".to_string(), self_server_config(&args.workdir)?)]);
        let mut manager = MCPManager::new(MCPConfig { servers });
        manager.connect_server("local").await?;
        Some(manager)
    } else if let Some(path) = config {
        Some(connect_manager(path, None).await?)
    } else {
        None
    };
    let manager = manager.map(Arc::new);
    let mcp_tools = manager
        .as_ref()
        .map(|m| Arc::clone(m) as Arc<dyn ToolExecutor>);

    let report = Comparison::new(client, local)
        .with_mcp_tools(mcp_tools)
        .with_max_steps(max_steps)
        .run(task, runs)
        .await;

    if json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report.render_table());
    }

    if let Some(manager) = manager {
        shutdown_shared(manager).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match &args.command {
        Commands::Chat => run_chat(build_client(&args)?).await?,

        Commands::React { task, max_steps } => {
            let agent = ReactAgent::new(
                build_client(&args)?,
                Arc::new(default_tools(args.workdir.clone())),
                *max_steps,
                Some(step_printer()),
            );
            println!("Starting ReAct agent with task: {}\n", task);
            print_outcome(&agent.run(task).await?);
        }

        Commands::Call { task, max_steps } => {
            let agent = FunctionCallingAgent::new(
                build_client(&args)?,
                Arc::new(default_tools(args.workdir.clone())),
                *max_steps,
                Some(step_printer()),
            );
            println!("Starting function calling agent with task: {}\n", task);
            print_outcome(&agent.run(task).await?);
        }

        Commands::Mcp {
            command,
            config,
            server,
        } => run_mcp(&args, command, config, server.as_deref()).await?,

        Commands::CheckMcp { config } => check_mcp(config).await?,

        Commands::Serve => {
            tracing::info!(workdir = %args.workdir.display(), "serving built-in tools over stdio");
            default_server(args.workdir.clone()).serve_stdio().await?;
        }

        Commands::Compare {
            task,
            runs,
            max_steps,
            config,
            self_serve,
            json,
        } => {
            run_compare(
                &args,
                task,
                *runs,
                *max_steps,
                config.as_deref(),
                *self_serve,
                *json,
            )
            .await?
        }
    }

    Ok(())
}
