//! groundcheck - answer one question with checked citations
//!
//! ## Commands
//!
//! - `ask`: run a question through the pipeline against a JSON evidence file
//! - `verify`: check an existing answer's citations against evidence
//! - `ledger`: inspect a ledger snapshot (stats, mined patterns)
//! - `config`: print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, Level};

use groundcheck_core::ledger::write_snapshot;
use groundcheck_core::obs::RequestSpan;
use groundcheck_core::telemetry::init_tracing;
use groundcheck_core::{
    verify_with, Allowlist, AnswerMode, AnswerPipeline, AnswerRequest, AnswerResponse,
    CitationReport, FailureLedger, GenerationService, KeywordChunkScorer, OpenAiCompatConfig,
    OpenAiCompatGenerator, PipelineConfig, Preferences, RetrievedEvidence, StaticRetrieval,
    VerifyOptions,
};

#[derive(Parser)]
#[command(name = "groundcheck")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Grounded answers with verified citations", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file (TOML)
    #[arg(short, long, global = true, env = "GROUNDCHECK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question from a JSON evidence file
    Ask(AskArgs),

    /// Verify the citations in an answer against an evidence file
    Verify {
        /// Evidence file (JSON)
        #[arg(short, long)]
        evidence: PathBuf,

        /// Answer text, or `-` to read stdin
        answer: String,

        /// Also require citation density
        #[arg(long)]
        strict: bool,
    },

    /// Inspect a failure ledger snapshot
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum LedgerAction {
    /// Failure counts by kind and mean scorer scores
    Stats {
        /// Snapshot directory
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Recurring failure patterns with suggested prompt changes
    Patterns {
        /// Snapshot directory
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[derive(Args)]
struct AskArgs {
    /// The question to answer
    question: String,

    /// Evidence file (JSON: claims, quotes, sources, concepts, communities)
    #[arg(short, long)]
    evidence: PathBuf,

    #[arg(short, long, value_enum, default_value_t = ModeArg::Standard)]
    mode: ModeArg,

    /// Require a citation on most factual sentences
    #[arg(long)]
    strict: bool,

    /// Evidence token budget
    #[arg(long)]
    budget: Option<usize>,

    /// Add a short summary of the answer
    #[arg(long)]
    summary: bool,

    #[arg(long)]
    session: Option<String>,

    #[arg(long)]
    graph: Option<String>,

    /// Score evidence by keyword overlap and skip the quality agents
    #[arg(long)]
    offline: bool,

    /// Load and persist the failure ledger here
    #[arg(long)]
    ledger_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// OpenAI-compatible base URL
    #[arg(long, env = "GROUNDCHECK_LLM_URL", default_value = "http://localhost:11434/v1")]
    llm_url: String,

    #[arg(long, env = "GROUNDCHECK_LLM_MODEL", default_value = "llama3.1")]
    model: String,

    #[arg(long, env = "GROUNDCHECK_LLM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Quick,
    Standard,
    Deep,
}

impl From<ModeArg> for AnswerMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Quick => AnswerMode::Quick,
            ModeArg::Standard => AnswerMode::Standard,
            ModeArg::Deep => AnswerMode::Deep,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask(args) => {
            let mut llm = OpenAiCompatConfig::new(&args.llm_url, &args.model);
            if let Some(key) = args.api_key.as_deref() {
                llm = llm.with_api_key(key);
            }
            llm.request_timeout_ms = config.timeouts.generation_ms;
            let generator = Arc::new(
                OpenAiCompatGenerator::new(llm).context("Failed to build generation client")?,
            );
            let response = cmd_ask(generator, &args, config).await?;
            print_response(&response, args.format)
        }
        Commands::Verify {
            evidence,
            answer,
            strict,
        } => {
            let answer = read_answer(&answer)?;
            let report = cmd_verify(&evidence, &answer, strict, &config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                anyhow::bail!(
                    "citation check failed: {} invalid",
                    report.verification.invalid.len()
                );
            }
            Ok(())
        }
        Commands::Ledger { action } => match action {
            LedgerAction::Stats { dir } => cmd_ledger_stats(&dir, &config),
            LedgerAction::Patterns { dir } => cmd_ledger_patterns(&dir, &config),
        },
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => PipelineConfig::from_env().context("Invalid GROUNDCHECK_* environment override"),
    }
}

fn read_answer(arg: &str) -> Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    std::io::read_to_string(std::io::stdin()).context("Failed to read answer from stdin")
}

fn read_evidence(path: &Path) -> Result<RetrievedEvidence> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read evidence file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Evidence file {} is not valid JSON evidence", path.display()))
}

/// Open the ledger, restoring `dir`'s snapshot when one exists.
fn open_ledger(dir: Option<&Path>, config: &PipelineConfig) -> Result<FailureLedger> {
    let ledger = FailureLedger::new(config.ledger.clone());
    if let Some(dir) = dir.filter(|d| d.join("ledger.json").exists()) {
        let restored = ledger
            .load_snapshot(dir)
            .with_context(|| format!("Failed to load ledger snapshot from {}", dir.display()))?;
        info!(records = restored, "ledger restored");
    }
    Ok(ledger)
}

async fn cmd_ask(
    generator: Arc<dyn GenerationService>,
    args: &AskArgs,
    mut config: PipelineConfig,
) -> Result<AnswerResponse> {
    let retrieval = StaticRetrieval::from_json_file(&args.evidence)
        .with_context(|| format!("Failed to load evidence from {}", args.evidence.display()))?;

    if args.offline {
        config.quality.enabled = false;
    }
    let ledger = Arc::new(open_ledger(args.ledger_dir.as_deref(), &config)?);

    let mut builder = AnswerPipeline::builder(generator, Arc::new(retrieval))
        .config(config)
        .ledger(ledger.clone());
    if args.offline {
        builder = builder.scorer(Arc::new(KeywordChunkScorer));
    }
    let pipeline = builder.build();

    let mut request = AnswerRequest::new(&args.question)
        .with_mode(args.mode.into())
        .with_preferences(Preferences {
            want_summary: args.summary,
            ..Preferences::default()
        });
    if let Some(session) = &args.session {
        request = request.with_session(session);
    }
    if let Some(graph) = &args.graph {
        request = request.with_graph(graph);
    }
    if let Some(budget) = args.budget {
        request = request.with_token_budget(budget);
    }
    if args.strict {
        request = request.strict();
    }

    let response = pipeline.answer(request).await;

    if let Some(dir) = &args.ledger_dir {
        let path = write_snapshot(&ledger, dir)
            .with_context(|| format!("Failed to write ledger snapshot to {}", dir.display()))?;
        info!(path = %path.display(), records = ledger.len(), "ledger saved");
    }
    pipeline.metrics().flush();

    Ok(response)
}

fn print_response(response: &AnswerResponse, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    println!("{}", response.answer);
    println!();
    println!(
        "status: {}  regenerated: {}  cached: {}  evidence: {}/{}",
        response.status.as_str(),
        response.regenerated,
        response.cached,
        response.selection.selected,
        response.selection.candidates,
    );
    if !response.citations.is_empty() {
        let cited: Vec<String> = response.citations.iter().map(ToString::to_string).collect();
        println!("citations: {}", cited.join(" "));
    }
    if let Some(quality) = &response.quality {
        println!(
            "quality: fact_check {:.2}  coherence {:.2}  validation {:.2}{}",
            quality.fact_check.score,
            quality.coherence.score,
            quality.validation.score,
            if quality.refined { "  (refined)" } else { "" },
        );
        if let Some(summary) = &quality.summarization {
            println!("summary: {}", summary.payload.summary);
        }
    }
    Ok(())
}

fn cmd_verify(
    evidence: &Path,
    answer: &str,
    strict: bool,
    config: &PipelineConfig,
) -> Result<CitationReport> {
    let _span = RequestSpan::enter("verify");
    let chunks = read_evidence(evidence)?.into_chunks();
    let allowlist = Allowlist::from_chunks(&chunks);
    Ok(verify_with(
        answer,
        &allowlist,
        VerifyOptions {
            strict: strict || config.citation.strict_by_default,
            truncated: false,
        },
        config.citation.min_cited_ratio,
    ))
}

fn cmd_ledger_stats(dir: &Path, config: &PipelineConfig) -> Result<()> {
    let ledger = open_ledger(Some(dir), config)?;
    println!("{}", serde_json::to_string_pretty(&ledger.stats())?);
    Ok(())
}

fn cmd_ledger_patterns(dir: &Path, config: &PipelineConfig) -> Result<()> {
    let ledger = open_ledger(Some(dir), config)?;
    let patterns = ledger.mine();
    if patterns.is_empty() {
        println!(
            "No recurring patterns ({} records, need at least {}).",
            ledger.len(),
            config.ledger.min_records_for_mining
        );
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&patterns)?);
    Ok(())
}
