use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use machinist_agent::{AgentManager, GraphEngine, StructuredAnswer};
use machinist_core::config::AppConfig;
use machinist_core::traits::{LlmClient, SessionStore};
use machinist_core::types::{ProgressKind, SessionId, Stage};
use machinist_memory::{ManualIndex, SqliteStore};
use machinist_tools::{ManualLookupTool, ToolRegistry, WebSearchTool};

#[derive(Parser)]
#[command(name = "machinist", version, about = "Machine manual Q&A assistant")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "machinist.toml")]
    config: PathBuf,

    /// Session ID (auto-generated if not provided)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a single question and exit
    Ask {
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Interactive chat with streaming progress
    Chat,
    /// Rebuild the manual index from the manuals directory
    Reindex,
    /// Show the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("machinist=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)?;

    let session = cli
        .session
        .as_deref()
        .map(SessionId::from_str)
        .unwrap_or_default();

    match cli.command {
        Commands::Ask { query } => {
            let question = query.join(" ");
            if question.trim().is_empty() {
                anyhow::bail!("empty question");
            }
            let manager = build_manager(&config)?;
            let answer = manager.invoke(&question, &session).await?;
            print_answer(&answer);
        }
        Commands::Chat => {
            let manager = build_manager(&config)?;
            chat_loop(manager, session).await?;
        }
        Commands::Reindex => {
            let index = ManualIndex::open(&config.db_path())?;
            let count = index.rebuild(
                &config.manuals_dir(),
                config.memory.chunk_size,
                config.memory.chunk_overlap,
            )?;
            println!(
                "Indexed {} chunks from {}",
                count,
                config.manuals_dir().display()
            );
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn build_manager(config: &AppConfig) -> anyhow::Result<Arc<AgentManager>> {
    let llm: Arc<dyn LlmClient> = Arc::from(machinist_llm::create_client(&config.model));

    let index = Arc::new(ManualIndex::open(&config.db_path())?);
    if index.is_empty()? {
        info!(
            manuals_dir = %config.manuals_dir().display(),
            "Manual index is empty; run `machinist reindex` to populate it"
        );
    }

    let mut registry = ToolRegistry::new();
    registry.register(ManualLookupTool::new(
        Arc::clone(&index),
        config.memory.search_k,
    ));
    if let Some(web_search) = &config.web_search {
        registry.register(WebSearchTool::new(&web_search.api_key));
    }

    let engine = Arc::new(GraphEngine::new(
        llm,
        Arc::new(registry),
        config.model.clone(),
        &config.orchestrator,
    ));

    let store: Arc<dyn SessionStore> = Arc::new(SqliteStore::open(&config.db_path())?);

    Ok(Arc::new(AgentManager::new(
        engine,
        store,
        config.orchestrator.history_window,
    )))
}

async fn chat_loop(manager: Arc<AgentManager>, session: SessionId) -> anyhow::Result<()> {
    println!("Ask about machine operation, specs, or troubleshooting.");
    println!("Commands: 'clear' resets the conversation, 'exit' quits.");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();

        match line {
            "" => continue,
            "exit" | "quit" => break,
            "clear" => {
                manager.clear(&session).await?;
                println!("(conversation cleared)");
                continue;
            }
            question => {
                let mut stream = manager.stream(question, &session);
                let mut streamed_any_token = false;

                while let Some(event) = stream.next().await {
                    match event.kind {
                        ProgressKind::Started => {
                            eprintln!("[{}]", event.stage);
                        }
                        ProgressKind::ToolCall => {
                            eprintln!(
                                "[tool] {}",
                                event.payload["tool"].as_str().unwrap_or("?")
                            );
                        }
                        ProgressKind::Token => {
                            print!("{}", event.payload["text"].as_str().unwrap_or(""));
                            io::stdout().flush()?;
                            streamed_any_token = true;
                        }
                        ProgressKind::Completed if event.stage == Stage::Done => {
                            if streamed_any_token {
                                println!();
                            }
                            match serde_json::from_value::<StructuredAnswer>(
                                event.payload.clone(),
                            ) {
                                Ok(answer) => {
                                    println!();
                                    print_answer(&answer);
                                }
                                Err(_) => println!("{}", event.payload),
                            }
                        }
                        ProgressKind::Completed => {}
                        ProgressKind::Error => {
                            eprintln!(
                                "[error] {}",
                                event.payload["message"].as_str().unwrap_or("unknown")
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_answer(answer: &StructuredAnswer) {
    println!("Source: {}", answer.origin.label());
    println!();
    println!("{}", answer.answer);
    println!();
    if !answer.sources.is_empty() {
        println!("Sources:");
        for source in &answer.sources {
            println!("  - {}", source);
        }
    }
    println!("Confidence: {:.0}%", answer.confidence * 100.0);
    if let Some(follow_up) = &answer.follow_up {
        println!("Follow-up: {}", follow_up);
    }
}
