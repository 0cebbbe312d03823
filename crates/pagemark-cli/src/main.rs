use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use pagemark_core::{
    same_page, ActiveTab, AgentResponse, Browser, HighlightPosition, RetrievalResult,
};
use pagemark_local::config::PagemarkConfig;
use pagemark_local::{
    extract_terms, handoff_store, locate, scan, Document, LocalSession, MemoryPages, PageAgent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};

mod envelope;
use envelope::{add_envelope_fields, error_obj, ErrorCode};

/// Bad combination of arguments that clap cannot express.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(crate) struct UsageError(String);

#[derive(Parser, Debug)]
#[command(name = "pagemark")]
#[command(about = "Locate and highlight retrieved text inside HTML pages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rank the places in a page where a target string occurs (json).
    Locate(LocateCmd),
    /// Highlight terms in a page and print the reply (json).
    Highlight(HighlightCmd),
    /// Extract highlight terms from a snippet or content block (json).
    Terms(TermsCmd),
    /// Rank retrieval results and attach snippets and positions for a query (json).
    Prepare(PrepareCmd),
    /// Serve one page as a JSON-lines agent on stdin/stdout.
    ///
    /// The first output line is the readiness announcement; every input line is one
    /// request envelope and gets exactly one reply line.
    AgentStdio(AgentStdioCmd),
    /// Open a retrieval result: highlight in the active page or hand off and navigate.
    Open(OpenCmd),
    /// Print version info.
    Version(VersionCmd),
}

impl Commands {
    fn kind(&self) -> &'static str {
        match self {
            Self::Locate(_) => "locate",
            Self::Highlight(_) => "highlight",
            Self::Terms(_) => "terms",
            Self::Prepare(_) => "prepare",
            Self::AgentStdio(_) => "agent_stdio",
            Self::Open(_) => "open",
            Self::Version(_) => "version",
        }
    }
}

#[derive(clap::Args, Debug)]
struct LocateCmd {
    /// HTML file to search.
    #[arg(long)]
    html: PathBuf,
    /// Text to look for.
    #[arg(long)]
    target: String,
}

#[derive(clap::Args, Debug)]
struct HighlightCmd {
    /// HTML file to highlight.
    #[arg(long)]
    html: PathBuf,
    /// Term to highlight (repeatable; earlier terms take focus).
    #[arg(long = "term", required = true)]
    terms: Vec<String>,
    /// URL the page was loaded from.
    #[arg(long, default_value = "about:blank")]
    url: String,
    /// Write the highlighted HTML here instead of embedding it in the output.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Marks realized per term (default: PAGEMARK_PER_TERM_CAP or 3).
    #[arg(long)]
    per_term_cap: Option<usize>,
}

#[derive(clap::Args, Debug)]
#[command(group(ArgGroup::new("input").required(true).args(["text", "file"])))]
struct TermsCmd {
    /// Raw text to extract terms from.
    #[arg(long)]
    text: Option<String>,
    /// File whose contents are the raw text.
    #[arg(long)]
    file: Option<PathBuf>,
    #[arg(long, default_value_t = pagemark_local::terms::DEFAULT_MAX_TERMS)]
    max_terms: usize,
}

#[derive(clap::Args, Debug)]
struct PrepareCmd {
    /// The user's query.
    #[arg(long)]
    query: String,
    /// JSON array of retrieval results.
    #[arg(long)]
    results: PathBuf,
}

#[derive(clap::Args, Debug)]
struct AgentStdioCmd {
    /// HTML file holding the page.
    #[arg(long)]
    html: PathBuf,
    /// URL the page was loaded from (hand-offs are matched against it).
    #[arg(long)]
    url: String,
    /// Directory of the file-backed hand-off store.
    #[arg(long)]
    handoff_dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct OpenCmd {
    /// JSON file with one retrieval result.
    #[arg(long)]
    result: PathBuf,
    /// HTML served for the result's URL.
    #[arg(long)]
    html: PathBuf,
    /// URL already showing in the active tab.
    #[arg(long)]
    active_url: Option<String>,
    /// Directory of the file-backed hand-off store.
    #[arg(long)]
    handoff_dir: Option<PathBuf>,
    #[arg(long)]
    initial_delay_ms: Option<u64>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    per_term_cap: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn load_env_file() {
    // Opt-in only. Never overrides the process environment; values are not logged.
    let Ok(p) = std::env::var("PAGEMARK_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v.trim());
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    // PAGEMARK_LOG wins over RUST_LOG. Logs go to stderr; stdout carries JSON only.
    let filter = std::env::var("PAGEMARK_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = read_file(path)?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn resolve_handoff_dir(flag: Option<PathBuf>, config: &PagemarkConfig) -> Option<PathBuf> {
    flag.or_else(|| config.handoff.dir.clone())
        .or_else(|| dirs::cache_dir().map(|d| d.join("pagemark")))
}

fn cmd_locate(args: LocateCmd) -> Result<serde_json::Value> {
    let doc = Document::parse_html(&read_file(&args.html)?);
    let units = scan(&doc);
    let candidates = locate(&args.target, &units);
    Ok(serde_json::json!({
        "target": args.target,
        "units": units.len(),
        "candidates": candidates,
    }))
}

fn cmd_highlight(args: HighlightCmd) -> Result<serde_json::Value> {
    let mut config = PagemarkConfig::from_env();
    if let Some(cap) = args.per_term_cap {
        config.highlight.per_term_cap = cap.max(1);
    }
    let html = read_file(&args.html)?;
    let mut agent = PageAgent::new(&html, &args.url, &config.highlight);
    let positions: Vec<HighlightPosition> =
        args.terms.into_iter().map(HighlightPosition::term).collect();
    let reply = agent.highlight(&positions);
    let snapshot = agent.snapshot();

    let mut payload = serde_json::json!({
        "reply": reply,
        "marks": snapshot.marks,
    });
    match args.out {
        Some(out) => {
            std::fs::write(&out, snapshot.html.as_bytes())
                .with_context(|| format!("writing {}", out.display()))?;
            payload["out"] = serde_json::json!(out.display().to_string());
        }
        None => payload["html"] = serde_json::json!(snapshot.html),
    }
    Ok(payload)
}

fn cmd_terms(args: TermsCmd) -> Result<serde_json::Value> {
    let raw = match (args.text, args.file) {
        (Some(text), _) => text,
        (None, Some(file)) => read_file(&file)?,
        (None, None) => return Err(UsageError("pass --text or --file".into()).into()),
    };
    let terms = extract_terms(&raw, args.max_terms.max(1));
    Ok(serde_json::json!({ "terms": terms }))
}

fn cmd_prepare(args: PrepareCmd) -> Result<serde_json::Value> {
    let results: Vec<RetrievalResult> = read_json(&args.results)?;
    let prepared = pagemark_local::results::prepare_results(&args.query, results);
    Ok(serde_json::json!({
        "query": args.query,
        "results": prepared,
    }))
}

async fn cmd_agent_stdio(args: AgentStdioCmd) -> Result<()> {
    let config = PagemarkConfig::from_env();
    let html = read_file(&args.html)?;
    let mut handoff_config = config.handoff.clone();
    handoff_config.dir = resolve_handoff_dir(args.handoff_dir, &config);
    let store = handoff_store(&handoff_config);

    let mut agent = PageAgent::new(&html, &args.url, &config.highlight);
    let report = agent.on_load(Some(store.as_ref()));
    if let Some(h) = &report.highlight {
        tracing::info!(matches = h.matches_found, "highlighted from hand-off");
    }
    let mut pending = agent
        .take_pending_emphasis()
        .map(|g| (g, Instant::now() + config.highlight.emphasis));
    println!("{}", serde_json::to_string(&report.announcement)?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some((generation, due)) = pending {
            if Instant::now() >= due {
                agent.revert_emphasis(generation);
                pending = None;
            }
        }
        let resp: AgentResponse = agent.handle_json(&line);
        if let Some(g) = agent.take_pending_emphasis() {
            pending = Some((g, Instant::now() + config.highlight.emphasis));
        }
        println!("{}", serde_json::to_string(&resp)?);
    }
    Ok(())
}

async fn cmd_open(args: OpenCmd) -> Result<serde_json::Value> {
    let mut config = PagemarkConfig::from_env();
    if let Some(ms) = args.initial_delay_ms {
        config.delivery.initial_delay = Duration::from_millis(ms);
    }
    if let Some(n) = args.max_attempts {
        config.delivery.max_attempts = n.clamp(1, 10);
    }
    if let Some(cap) = args.per_term_cap {
        config.highlight.per_term_cap = cap.max(1);
    }
    config.handoff.dir = resolve_handoff_dir(args.handoff_dir, &config);

    let result: RetrievalResult = read_json(&args.result)?;
    if url::Url::parse(result.url.trim()).is_err() {
        return Err(pagemark_core::Error::InvalidUrl(result.url.clone()).into());
    }
    let html = read_file(&args.html)?;

    let mut pages = MemoryPages::new().with_page(&result.url, html);
    if let Some(active) = args.active_url.as_deref() {
        if !same_page(active, &result.url) {
            pages.insert(active, "<html><body></body></html>");
        }
    }
    let store = handoff_store(&config.handoff);
    let session = LocalSession::new(Arc::new(pages), store, config);

    let active = match args.active_url.as_deref() {
        Some(url) => {
            let tab = session.open(url, None).await?;
            Some(ActiveTab {
                tab,
                url: url.to_string(),
            })
        }
        None => None,
    };

    let coordinator = session.coordinator();
    let outcome = coordinator.open_result(&result, active.as_ref()).await;
    let tab = outcome.tab;

    let mut payload = serde_json::json!({
        "ok": outcome.error.is_none(),
        "outcome": outcome,
    });
    if let Some(tab) = tab {
        let snapshot = session.snapshot(tab).await?;
        payload["marks"] = serde_json::json!(snapshot.marks);
        payload["html"] = serde_json::json!(snapshot.html);
    }
    Ok(payload)
}

fn cmd_version(args: VersionCmd) {
    let v = serde_json::json!({
        "schema_version": 1,
        "kind": "version",
        "ok": true,
        "name": "pagemark",
        "version": env!("CARGO_PKG_VERSION"),
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => println!("pagemark {}", env!("CARGO_PKG_VERSION")),
        _ => println!("{v}"),
    }
}

async fn run(command: Commands) -> Result<Option<serde_json::Value>> {
    let payload = match command {
        Commands::Locate(args) => cmd_locate(args)?,
        Commands::Highlight(args) => cmd_highlight(args)?,
        Commands::Terms(args) => cmd_terms(args)?,
        Commands::Prepare(args) => cmd_prepare(args)?,
        Commands::Open(args) => cmd_open(args).await?,
        Commands::AgentStdio(args) => {
            cmd_agent_stdio(args).await?;
            return Ok(None);
        }
        Commands::Version(args) => {
            cmd_version(args);
            return Ok(None);
        }
    };
    Ok(Some(payload))
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    init_tracing();

    let cli = Cli::parse();
    let kind = cli.command.kind();
    let started = Instant::now();

    match run(cli.command).await {
        Ok(None) => Ok(()),
        Ok(Some(mut payload)) => {
            add_envelope_fields(&mut payload, kind, started.elapsed().as_millis());
            println!("{payload}");
            Ok(())
        }
        Err(e) => {
            let code = ErrorCode::classify(&e);
            tracing::debug!(error = ?e, code = code.as_str(), "command failed");
            let mut payload = serde_json::json!({
                "ok": false,
                "error": error_obj(code, format!("{e:#}")),
            });
            add_envelope_fields(&mut payload, kind, started.elapsed().as_millis());
            println!("{payload}");
            std::process::exit(1);
        }
    }
}
