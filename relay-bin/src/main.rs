use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use relay_core::{
    config::Config,
    consumer::{ChatClient, EntryId, Transcript},
    model::{ChatMessage, ChatRequest},
    provider_factory::build_chat_provider,
    relay::{RelayState, router, router_with_static},
    stream::StreamEvent,
    system_instruction::SystemInstruction,
};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(author, version, about = "Streaming chat relay", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Listen address, overrides `server.bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Chat with a running relay; reads one message per line unless -m is given
    Chat {
        #[arg(long, default_value = "http://localhost:3000")]
        server: String,
        #[arg(short, long, help = "Send a single message and exit")]
        message: Option<String>,
    },
    /// Stream one completion straight from the configured upstream (no relay)
    Ask {
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relay_core=debug,chat_relay=debug".into()),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { bind } => serve(load_config(cli.config.as_deref())?, bind).await,
        Commands::Chat { server, message } => chat(&server, message).await,
        Commands::Ask { message } => ask(load_config(cli.config.as_deref())?, message).await,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let cfg = match path {
        Some(p) => Config::from_path(p).with_context(|| format!("loading config {}", p.display()))?,
        None => Config::default(),
    };
    Ok(cfg.with_env_overrides())
}

async fn serve(cfg: Config, bind: Option<String>) -> anyhow::Result<()> {
    let provider = build_chat_provider(&cfg)?;
    let instruction = SystemInstruction::load(cfg.system_instruction.path.as_deref().map(Path::new));
    let state = Arc::new(RelayState::from_config(&cfg.upstream, provider, instruction));
    let app = match &cfg.server.static_dir {
        Some(dir) => router_with_static(state, dir),
        None => router(state),
    };

    let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        provider = %cfg.upstream.provider,
        model = %cfg.upstream.model,
        "relay listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn chat(server: &str, message: Option<String>) -> anyhow::Result<()> {
    let client = ChatClient::new(server)?;
    let mut term = TerminalTranscript::default();

    if let Some(message) = message {
        client.send_message(&message, &mut term).await;
        term.end_entry();
        if term.failed {
            anyhow::bail!("no reply from {}", client.endpoint());
        }
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        client.send_message(&line, &mut term).await;
        term.end_entry();
        prompt();
    }
    println!();
    Ok(())
}

fn prompt() {
    print!("> ");
    io::stdout().flush().ok();
}

async fn ask(cfg: Config, message: String) -> anyhow::Result<()> {
    let provider = build_chat_provider(&cfg)?;
    let instruction = SystemInstruction::load(cfg.system_instruction.path.as_deref().map(Path::new));
    let req = ChatRequest {
        model: cfg.upstream.model.clone(),
        messages: vec![
            ChatMessage::system(instruction.as_str()),
            ChatMessage::user(message),
        ],
        temperature: cfg.upstream.temperature,
        max_output_tokens: cfg.upstream.max_output_tokens,
        request_id: None,
    };

    let mut stream = provider.chat_stream_events(req).await?;
    let mut saw_delta = false;
    while let Some(ev) = stream.next().await {
        match ev {
            StreamEvent::DeltaText(txt) => {
                saw_delta = true;
                print!("{txt}");
                io::stdout().flush().ok();
            }
            StreamEvent::Usage { prompt, completion } => {
                tracing::debug!(?prompt, ?completion, "usage");
            }
            StreamEvent::Stop { reason } => {
                if saw_delta {
                    println!();
                }
                eprintln!("[stop: {}]", reason.map(|r| r.as_str()).unwrap_or("none"));
            }
            StreamEvent::Final(resp) => println!("{}", resp.text),
            StreamEvent::Error(err) => anyhow::bail!(err),
            _ => {}
        }
    }
    Ok(())
}

/// Prints each bot reply as it grows; the user's own line is already on screen.
#[derive(Default)]
struct TerminalTranscript {
    shown: String,
    placeholder: bool,
    failed: bool,
    next: usize,
}

impl TerminalTranscript {
    fn clear_placeholder(&mut self) {
        if self.placeholder {
            print!("\r\x1b[2K");
            self.placeholder = false;
        }
    }

    fn end_entry(&mut self) {
        self.clear_placeholder();
        if !self.shown.is_empty() || self.failed {
            println!();
        }
        self.shown.clear();
    }

    fn id(&mut self) -> EntryId {
        self.next += 1;
        EntryId(self.next - 1)
    }
}

impl Transcript for TerminalTranscript {
    fn push_user(&mut self, _text: &str) -> EntryId {
        self.id()
    }

    fn push_bot_placeholder(&mut self) -> EntryId {
        self.shown.clear();
        self.failed = false;
        self.placeholder = true;
        print!("{}", relay_core::consumer::TYPING_PLACEHOLDER);
        io::stdout().flush().ok();
        self.id()
    }

    fn render(&mut self, _entry: EntryId, full_text: &str) {
        self.clear_placeholder();
        match full_text.strip_prefix(self.shown.as_str()) {
            Some(rest) => print!("{rest}"),
            None => print!("\n{full_text}"),
        }
        self.shown = full_text.to_string();
        io::stdout().flush().ok();
    }

    fn fail(&mut self, _entry: EntryId, message: &str) {
        self.clear_placeholder();
        if !self.shown.is_empty() {
            println!();
        }
        print!("{message}");
        self.shown.clear();
        self.failed = true;
        io::stdout().flush().ok();
    }
}
