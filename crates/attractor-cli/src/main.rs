//! CLI binary for running, validating, and inspecting Attractor workflows.
//!
//! Accepts both the legacy DOT graph-description surface and the declarative
//! KDL workflow surface; which one a file uses is sniffed from its first
//! non-whitespace byte (`digraph`/`strict` keywords vs. anything else).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use attractor_agent::{AgentSession, SessionConfig};
use attractor_llm::{AnthropicAdapter, LlmClient};
use attractor_pipeline::{
    AutoApproveInterviewer, BackoffPolicy, ConsoleInterviewer, HandlerRegistry, Interviewer,
    LlmBackend, PipelineConfig, PipelineExecutor, PipelineGraph, RunStatus, Severity,
};
use attractor_pipeline::handlers::codergen_handler::{LlmRunOptions, LlmRunResult};
use attractor_tools::{LocalExecutionEnvironment, ToolRegistry};
use attractor_types::{CancellationToken, Context, Outcome, Result as AttractorResult};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "pas", version, about = "Workflow orchestration engine for AI-driven pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ToolsMode {
    None,
    ReadOnly,
    Coding,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ShowFormat {
    Ascii,
    Boxart,
    Dot,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow (DOT or KDL) to completion
    Run {
        /// Path to the workflow file
        workflow: PathBuf,

        /// Resume from the last saved checkpoint under --logs
        #[arg(long)]
        resume: bool,

        /// Auto-approve every human gate instead of prompting on stdin
        #[arg(long)]
        approve_all: bool,

        /// Logs/checkpoint output directory
        #[arg(long, default_value = ".attractor/logs")]
        logs: PathBuf,

        /// Tool access level granted to codergen stages
        #[arg(long, value_enum, default_value = "coding")]
        tools: ToolsMode,

        /// Don't actually call LLMs; codergen stages report success immediately
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a workflow file and print diagnostics
    Validate {
        /// Path to the workflow file
        workflow: PathBuf,
    },

    /// Render a workflow's graph structure
    Show {
        /// Path to the workflow file
        workflow: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "ascii")]
        format: ShowFormat,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    let code = rt.block_on(dispatch(cli))?;
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run {
            workflow,
            resume,
            approve_all,
            logs,
            tools,
            dry_run,
        } => cmd_run(&workflow, resume, approve_all, &logs, tools, dry_run).await,
        Commands::Validate { workflow } => cmd_validate(&workflow),
        Commands::Show { workflow, format } => cmd_show(&workflow, format),
    }
}

/// Load a workflow file through either front-end, sniffing format from
/// content rather than extension so both `.dot` and `.kdl` files (and
/// anything named otherwise) just work.
fn load_workflow(path: &Path) -> anyhow::Result<PipelineGraph> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    let trimmed = source.trim_start();
    if trimmed.starts_with("digraph") || trimmed.starts_with("strict") || trimmed.starts_with("graph") {
        let dot = attractor_dot::parse(&source)?;
        Ok(PipelineGraph::from_dot(dot)?)
    } else {
        Ok(attractor_pipeline::load_workflow(&source)?)
    }
}

fn cmd_validate(path: &Path) -> anyhow::Result<i32> {
    let graph = load_workflow(path)?;
    let diagnostics = attractor_pipeline::validate(&graph);

    if diagnostics.is_empty() {
        println!("workflow is valid");
        return Ok(0);
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{severity}] {}: {}", diag.rule, diag.message);
    }

    Ok(if has_error { 1 } else { 0 })
}

fn cmd_show(path: &Path, format: ShowFormat) -> anyhow::Result<i32> {
    let graph = load_workflow(path)?;
    match format {
        ShowFormat::Ascii => render_ascii(&graph),
        ShowFormat::Boxart => render_boxart(&graph),
        ShowFormat::Dot => render_dot(&graph),
    }
    Ok(0)
}

fn render_ascii(graph: &PipelineGraph) {
    println!("workflow: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("goal: {}", graph.goal);
    }
    println!();
    let mut ids: Vec<_> = graph.all_nodes().map(|n| n.id.clone()).collect();
    ids.sort();
    for id in ids {
        let node = graph.node(&id).unwrap();
        let kind = node.node_type.as_deref().unwrap_or("(default)");
        println!("{id} [{}] shape={} type={kind}", node.label, node.shape);
        for edge in graph.outgoing_edges(&id) {
            let guard = edge.condition.as_deref().unwrap_or("");
            let label = edge.label.as_deref().unwrap_or("");
            println!("  -> {}{}{}", edge.to,
                if label.is_empty() { String::new() } else { format!(" [{label}]") },
                if guard.is_empty() { String::new() } else { format!(" when {guard}") },
            );
        }
    }
}

fn render_boxart(graph: &PipelineGraph) {
    let mut ids: Vec<_> = graph.all_nodes().map(|n| n.id.clone()).collect();
    ids.sort();
    for id in ids {
        let node = graph.node(&id).unwrap();
        let title = format!(" {} ", node.label);
        let width = title.chars().count().max(id.chars().count() + 2) + 2;
        let bar = "-".repeat(width);
        println!("+{bar}+");
        println!("|{title:^width$}|", width = width);
        println!("+{bar}+");
        for edge in graph.outgoing_edges(&id) {
            println!("   |");
            println!("   v  {}", edge.to);
        }
        println!();
    }
}

fn render_dot(graph: &PipelineGraph) {
    println!("digraph {} {{", graph.name);
    if !graph.goal.is_empty() {
        println!("  goal=\"{}\"", graph.goal.replace('"', "\\\""));
    }
    let mut ids: Vec<_> = graph.all_nodes().map(|n| n.id.clone()).collect();
    ids.sort();
    for id in &ids {
        let node = graph.node(id).unwrap();
        println!("  \"{id}\" [shape=\"{}\", label=\"{}\"]", node.shape, node.label.replace('"', "\\\""));
    }
    for id in &ids {
        for edge in graph.outgoing_edges(id) {
            let mut attrs = Vec::new();
            if let Some(ref l) = edge.label {
                attrs.push(format!("label=\"{}\"", l.replace('"', "\\\"")));
            }
            if let Some(ref c) = edge.condition {
                attrs.push(format!("condition=\"{}\"", c.replace('"', "\\\"")));
            }
            let suffix = if attrs.is_empty() { String::new() } else { format!(" [{}]", attrs.join(", ")) };
            println!("  \"{id}\" -> \"{}\"{suffix}", edge.to);
        }
    }
    println!("}}");
}

async fn cmd_run(
    path: &Path,
    resume: bool,
    approve_all: bool,
    logs: &Path,
    tools: ToolsMode,
    dry_run: bool,
) -> anyhow::Result<i32> {
    let graph = load_workflow(path)?;

    println!("running workflow: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("goal: {}", graph.goal);
    }
    if dry_run {
        println!("(dry run -- codergen stages will not call an LLM)");
    }

    std::fs::create_dir_all(logs)?;
    let checkpoint = if resume {
        attractor_pipeline::load_checkpoint(logs).await?
    } else {
        None
    };
    if checkpoint.is_some() {
        println!("resuming from checkpoint in {}", logs.display());
    }

    let interviewer: Arc<dyn Interviewer> = if approve_all {
        Arc::new(AutoApproveInterviewer)
    } else {
        Arc::new(ConsoleInterviewer)
    };

    let registry = build_registry(tools, dry_run, interviewer);
    let executor = PipelineExecutor::new(registry);

    let mut initial_context = std::collections::HashMap::new();
    initial_context.insert(
        "workdir".to_string(),
        serde_json::Value::String(std::env::current_dir()?.to_string_lossy().into_owned()),
    );
    initial_context.insert("dry_run".to_string(), serde_json::Value::Bool(dry_run));

    let abort_signal = CancellationToken::new();
    {
        let abort_signal = abort_signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                abort_signal.cancel();
            }
        });
    }

    let config = PipelineConfig {
        logs_root: logs.to_path_buf(),
        checkpoint,
        abort_signal: abort_signal.clone(),
        cleanup_workspace_on_failure: true,
        backoff: BackoffPolicy::default(),
        initial_context,
        ..PipelineConfig::default()
    };

    let outcome = executor.run(&graph, config).await?;

    println!();
    println!("completed nodes: {:?}", outcome.completed_nodes);
    println!(
        "usage: {} input / {} output tokens, ${:.4}",
        outcome.usage_summary.input_tokens, outcome.usage_summary.output_tokens, outcome.usage_summary.cost
    );

    match outcome.status {
        RunStatus::Success => Ok(0),
        RunStatus::Fail => {
            if let Some(ref summary) = outcome.failure_summary {
                eprintln!("failure: {summary}");
            }
            Ok(1)
        }
        RunStatus::Cancelled => Ok(130),
    }
}

fn build_registry(
    tools: ToolsMode,
    dry_run: bool,
    interviewer: Arc<dyn Interviewer>,
) -> HandlerRegistry {
    let backend: Arc<dyn LlmBackend> = if dry_run {
        Arc::new(DryRunBackend)
    } else {
        Arc::new(AgentBackend { tools })
    };
    attractor_pipeline::full_registry(backend, interviewer)
}

/// Reports immediate success with no LLM call. Used for `--dry-run`.
struct DryRunBackend;

#[async_trait]
impl LlmBackend for DryRunBackend {
    async fn run(
        &self,
        node: &attractor_pipeline::PipelineNode,
        _prompt: &str,
        _context: &Context,
        _opts: LlmRunOptions<'_>,
    ) -> AttractorResult<LlmRunResult> {
        Ok(LlmRunResult::Outcome(Box::new(Outcome::success(format!(
            "dry run: skipped {}",
            node.id
        )))))
    }
}

/// Drives a fresh [`AgentSession`] per stage, scoped to the node's own
/// working directory (workspace isolation per §4.9 means each codergen
/// stage already runs against its own checkout). Tool access is capped by
/// the run's `--tools` mode.
struct AgentBackend {
    tools: ToolsMode,
}

#[async_trait]
impl LlmBackend for AgentBackend {
    async fn run(
        &self,
        node: &attractor_pipeline::PipelineNode,
        prompt: &str,
        context: &Context,
        _opts: LlmRunOptions<'_>,
    ) -> AttractorResult<LlmRunResult> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            attractor_types::AttractorError::AuthError {
                provider: "anthropic".to_string(),
            }
        })?;

        let mut client = LlmClient::new();
        client.register_provider(AnthropicAdapter::new(api_key));

        let workdir = context
            .get("workdir")
            .await
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| ".".to_string());

        let tool_registry = tool_registry_for(self.tools);
        let env = Box::new(LocalExecutionEnvironment::new(workdir));

        let model = node
            .llm_model
            .clone()
            .unwrap_or_else(|| "claude-sonnet-4-5-20250929".to_string());

        let config = SessionConfig {
            model,
            ..SessionConfig::default()
        };

        let mut session = AgentSession::new(client, tool_registry, env, config);
        let text = session.process_input(prompt).await?;
        Ok(LlmRunResult::Text(text))
    }
}

fn tool_registry_for(mode: ToolsMode) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    match mode {
        ToolsMode::None => {}
        ToolsMode::ReadOnly => {
            registry.register(attractor_tools::ReadFileTool);
            registry.register(attractor_tools::GrepTool);
            registry.register(attractor_tools::GlobTool);
        }
        ToolsMode::Coding => {
            registry.register(attractor_tools::ReadFileTool);
            registry.register(attractor_tools::WriteFileTool);
            registry.register(attractor_tools::EditFileTool);
            registry.register(attractor_tools::ShellTool);
            registry.register(attractor_tools::GrepTool);
            registry.register(attractor_tools::GlobTool);
        }
    }
    registry
}
