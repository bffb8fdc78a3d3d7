use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use pdf_qa_core::config::{
    DEFAULT_INDEX_DIR, DEFAULT_LLM_MODEL, DEFAULT_OLLAMA_URL, DEFAULT_SOURCE_DIR, DEFAULT_TOP_K,
};
use pdf_qa_core::{
    format_sources, AdminSession, AdminWorkflow, EmbeddingProvider, IndexStatus, Notice,
    RagConfig, RagRuntime,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Folder holding the source PDFs
    #[arg(long, global = true, env = "PDF_QA_SOURCE_DIR", default_value = DEFAULT_SOURCE_DIR)]
    source_dir: PathBuf,

    /// Knowledge index directory
    #[arg(long, global = true, env = "PDF_QA_INDEX_DIR", default_value = DEFAULT_INDEX_DIR)]
    index_dir: PathBuf,

    /// Embedding provider: local, ollama or ngram
    #[arg(long, global = true, env = "PDF_QA_EMBEDDING_PROVIDER")]
    embedding_provider: Option<EmbeddingProvider>,

    /// Embedding model name
    #[arg(long, global = true, env = "PDF_QA_EMBEDDING_MODEL")]
    embedding_model: Option<String>,

    /// Ollama base URL, used for generation and Ollama embeddings
    #[arg(long, global = true, env = "OLLAMA_HOST", default_value = DEFAULT_OLLAMA_URL)]
    ollama_url: String,

    /// Language model served by Ollama
    #[arg(long, global = true, env = "PDF_QA_LLM_MODEL", default_value = DEFAULT_LLM_MODEL)]
    llm_model: String,

    /// Number of chunks retrieved per question
    #[arg(long, global = true, env = "PDF_QA_TOP_K", default_value_t = DEFAULT_TOP_K)]
    top_k: usize,

    /// Give up on the language model after this many seconds
    #[arg(long, global = true, env = "PDF_QA_LLM_TIMEOUT_SECS")]
    llm_timeout_secs: Option<u64>,
}

impl Cli {
    fn rag_config(&self) -> RagConfig {
        let mut config = RagConfig {
            source_dir: self.source_dir.clone(),
            index_dir: self.index_dir.clone(),
            ..RagConfig::default()
        };
        if let Some(provider) = self.embedding_provider {
            config.embedding.provider = provider;
        }
        if let Some(model) = &self.embedding_model {
            config.embedding.model = model.clone();
        }
        config.embedding.ollama_url = self.ollama_url.clone();
        config.llm.base_url = self.ollama_url.clone();
        config.llm.model = self.llm_model.clone();
        config.llm.timeout = self.llm_timeout_secs.map(Duration::from_secs);
        config.retrieval.top_k = self.top_k;
        config
    }
}

#[derive(Subcommand)]
enum Command {
    /// Copy PDFs into the source folder, replacing same-named files.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List the source PDFs.
    List,
    /// Delete one source PDF by file name.
    Delete { name: String },
    /// Train with current data, keeping existing knowledge.
    Train,
    /// Delete all knowledge and rebuild it from the current source PDFs.
    Reset {
        /// Skip the confirmation prompt.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Ask a question against the knowledge base.
    Ask {
        #[arg(long)]
        question: String,
    },
    /// Show the index state and source files.
    Status,
    /// Print the effective configuration as JSON.
    Config,
    /// Interactive session for administration and questions.
    Shell,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let runtime = Arc::new(RagRuntime::new(cli.rag_config()).context("invalid configuration")?);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-qa boot"
    );

    match cli.command {
        Command::Upload { files } => {
            let admin = runtime.admin().await?;
            let uploads = read_uploads(&files).await?;
            print_notices(&admin.upload_files(&uploads));
        }
        Command::List => {
            let admin = runtime.admin().await?;
            print_listing(&admin);
        }
        Command::Delete { name } => {
            let admin = runtime.admin().await?;
            print_notices(&admin.delete_file(&name));
        }
        Command::Train => {
            let admin = runtime.admin().await?;
            print_notices(&admin.train().await);
        }
        Command::Reset { yes } => {
            let admin = runtime.admin().await?;
            let mut session = AdminSession::new();
            print_notices(&admin.request_reset(&mut session));
            let confirmed = yes || prompt_yes("type 'yes' to delete all knowledge: ").await?;
            if confirmed {
                print_notices(&admin.confirm_reset(&mut session).await);
            } else {
                print_notices(&admin.cancel_reset(&mut session));
            }
        }
        Command::Ask { question } => ask(&runtime, &question).await,
        Command::Status => print_status(&runtime).await?,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(runtime.config())?);
        }
        Command::Shell => run_shell(&runtime).await?,
    }

    Ok(())
}

async fn read_uploads(paths: &[PathBuf]) -> anyhow::Result<Vec<(String, Vec<u8>)>> {
    let mut uploads = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .with_context(|| format!("{} has no file name", path.display()))?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        uploads.push((name, bytes));
    }
    Ok(uploads)
}

async fn prompt_yes(prompt: &str) -> anyhow::Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await?;
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn print_notices(notices: &[Notice]) {
    for notice in notices {
        println!("{notice}");
    }
}

fn print_answer(answer: &pdf_qa_core::Answer) {
    println!("{}", answer.text);
    if !answer.sources.is_empty() {
        println!("sources:");
        for line in format_sources(&answer.sources) {
            println!("  {line}");
        }
    }
}

fn print_listing(admin: &AdminWorkflow) {
    match admin.list_files() {
        Ok(names) if names.is_empty() => println!("no PDF files uploaded yet"),
        Ok(names) => {
            for name in names {
                println!("{name}");
            }
        }
        Err(notice) => println!("{notice}"),
    }
}

async fn print_status(runtime: &RagRuntime) -> anyhow::Result<()> {
    let status = runtime.status().await?;
    let config = runtime.config();
    match &status.index {
        IndexStatus::Missing => println!("index: missing ({})", config.index_dir.display()),
        IndexStatus::Uninitialized => println!(
            "index: uninitialized ({}); train or reset to rebuild",
            config.index_dir.display()
        ),
        IndexStatus::Ready(manifest) => println!(
            "index: ready, {} chunks, embedding model {}, updated {}",
            manifest.chunk_count,
            manifest.embedding_model,
            manifest.updated_at.to_rfc3339()
        ),
    }
    println!(
        "source files: {} in {}",
        status.source_files.len(),
        config.source_dir.display()
    );
    Ok(())
}

const SHELL_HELP: &str = "commands:
  list                 list source PDFs
  upload <path>...     copy PDFs into the source folder
  delete <name>        delete a source PDF
  train                train with current data
  reset                ask to reset all knowledge
  confirm | cancel     answer a pending reset
  status               show index state
  ask <question>       ask a question (plain text works too)
  help | quit";

async fn run_shell(runtime: &Arc<RagRuntime>) -> anyhow::Result<()> {
    let admin = runtime.admin().await?;
    let mut session = AdminSession::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    println!("{SHELL_HELP}");
    loop {
        let prompt = if session.reset_armed() { "confirm/cancel> " } else { "pdf-qa> " };
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        let (command, rest) = line
            .split_once(char::is_whitespace)
            .map(|(command, rest)| (command, rest.trim()))
            .unwrap_or((line, ""));

        match command {
            "" => {}
            "quit" | "exit" => break,
            "help" => println!("{SHELL_HELP}"),
            "list" => print_listing(&admin),
            "upload" => {
                let paths = rest.split_whitespace().map(PathBuf::from).collect::<Vec<_>>();
                if paths.is_empty() {
                    println!("{}", Notice::warning("usage: upload <path>..."));
                    continue;
                }
                match read_uploads(&paths).await {
                    Ok(uploads) => print_notices(&admin.upload_files(&uploads)),
                    Err(error) => println!("{}", Notice::error(format!("{error:#}"))),
                }
            }
            "delete" => {
                if rest.is_empty() {
                    println!("{}", Notice::warning("usage: delete <name>"));
                } else {
                    print_notices(&admin.delete_file(rest));
                }
            }
            "train" => print_notices(&admin.train().await),
            "reset" => print_notices(&admin.request_reset(&mut session)),
            "confirm" => print_notices(&admin.confirm_reset(&mut session).await),
            "cancel" => print_notices(&admin.cancel_reset(&mut session)),
            "status" => {
                if let Err(error) = print_status(runtime).await {
                    println!("{}", Notice::error(format!("{error:#}")));
                }
            }
            "ask" => ask(runtime, rest).await,
            _ => ask(runtime, line).await,
        }
    }
    Ok(())
}

async fn ask(runtime: &RagRuntime, question: &str) {
    let (answer, notices) = runtime.ask(question).await;
    if let Some(answer) = answer {
        print_answer(&answer);
    }
    print_notices(&notices);
}
