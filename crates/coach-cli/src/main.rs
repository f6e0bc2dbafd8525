//! coach - stream one prompt to several models

mod config;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use coach_chat::{
    ChatService, DispatchRequest, InMemoryRepository, MemoryStore, ModelOutcome,
    MultiStreamCallbacks, MultiStreamOrchestrator, NewConversation, OfflineQueue, RecencyCache,
    SendOutcome,
};
use coach_stream::{StreamConnection, StreamError, StreamOutcome, StreamPart, StreamStatus};

/// coach - stream one prompt to several models
#[derive(Parser, Debug)]
#[command(name = "coach")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Prompt to send (read from stdin when omitted)
    prompt: Option<String>,

    /// Streaming chat endpoint
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Model to send to (repeat for several)
    #[arg(short, long = "model")]
    models: Vec<String>,

    /// User id to create the conversation for
    #[arg(short, long)]
    user: Option<String>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Prints streamed text as it arrives
struct PrintCallbacks {
    /// Prefix each delta with the model id when several models stream at once
    tagged: bool,
}

impl MultiStreamCallbacks for PrintCallbacks {
    fn on_part(&self, model_id: &str, part: &StreamPart) {
        if let StreamPart::Text { content } = part {
            let mut stdout = std::io::stdout().lock();
            let _ = if self.tagged {
                writeln!(stdout, "[{}] {}", model_id, content)
            } else {
                write!(stdout, "{}", content)
            };
            let _ = stdout.flush();
        }
    }

    fn on_error(&self, model_id: &str, error: &StreamError) {
        eprintln!("\n[{}] error: {}", model_id, error);
    }

    fn on_model_complete(&self, model_id: &str, outcome: &StreamOutcome) {
        tracing::debug!("{} finished: {:?}", model_id, outcome.status);
    }
}

fn print_summary(outcomes: &[ModelOutcome]) {
    println!();
    for model in outcomes {
        let status = match &model.outcome.status {
            StreamStatus::Completed => "completed".to_string(),
            StreamStatus::Aborted => "aborted".to_string(),
            StreamStatus::Failed(e) => format!("failed ({}: {})", e.category(), e.message),
        };
        println!(
            "{}: {} - {} chars",
            model.model_id,
            status,
            model.outcome.message.content.chars().count()
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    let subscriber = tracing_subscriber::fmt().with_writer(std::io::stderr);
    if args.verbose {
        subscriber
            .with_env_filter("coach=debug,coach_stream=debug,coach_chat=debug")
            .init();
    } else {
        subscriber
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    let config_path = args.config.clone().unwrap_or_else(config::Config::config_path);

    // Initialize config and exit
    if args.init_config {
        config::Config::init(&config_path)
            .with_context(|| format!("failed to create {}", config_path.display()))?;
        println!("Config file at: {}", config_path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let config = config::Config::load_from(&config_path);

    let endpoint = args
        .endpoint
        .or_else(|| config.endpoint.clone())
        .context("no endpoint given; pass --endpoint or set `endpoint` in the config file")?;
    let models = if args.models.is_empty() {
        config.models.clone()
    } else {
        args.models
    };
    if models.is_empty() {
        bail!("no models given; pass --model or set `models` in the config file");
    }
    let user_id = args
        .user
        .or_else(|| config.user_id.clone())
        .unwrap_or_else(|| "local".to_string());

    let prompt = match args.prompt {
        Some(prompt) => prompt,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        bail!("empty prompt");
    }

    let connection = StreamConnection::with_config(reqwest::Client::new(), config.connection_config());
    let service = ChatService::new(
        Arc::new(InMemoryRepository::new()),
        MultiStreamOrchestrator::new(Arc::new(connection), endpoint),
        RecencyCache::new(config.cache_config()),
        OfflineQueue::new(config.queue_config(), Arc::new(MemoryStore::new())),
    );

    let conversation = service
        .create_conversation(NewConversation {
            id: None,
            user_id,
            title: Some(prompt.chars().take(40).collect()),
        })
        .await?;

    let callbacks = Arc::new(PrintCallbacks {
        tagged: models.len() > 1,
    });
    let sent = match service
        .send_message(DispatchRequest::new(&conversation.id, prompt), &models, callbacks)
        .await?
    {
        SendOutcome::Dispatched(sent) => sent,
        SendOutcome::Queued(action) => {
            bail!("message was queued ({}) instead of sent", action.id);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, aborting streams");
            sent.streams.abort_all();
        }
        _ = sent.streams.wait_all() => {}
    }

    let outcomes = sent.streams.wait_all().await;
    let persisted = sent.persisted.await?;
    tracing::debug!("Persisted {} replies", persisted.len());
    print_summary(&outcomes);

    Ok(())
}
