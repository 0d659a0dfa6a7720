//! Tern CLI entry point

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tern::agent::environment::WorkspaceEnvironment;
use tern::agent::tokens::{estimate_tokens, token_limit};
use tern::agent::{create_content_generator, ChatSession, Collaborators, StreamEvent, TurnEngine};
use tern::config::{self, Config};

#[derive(Parser)]
#[command(name = "tern")]
#[command(about = "Tern - conversation core of a terminal coding agent")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Chat with the model
    Chat {
        /// Message to send; starts an interactive session when omitted
        #[arg(short, long)]
        message: Option<String>,

        /// Skip the workspace preamble
        #[arg(long)]
        no_environment: bool,
    },

    /// Count the tokens of a text for the configured model
    Tokens {
        text: String,
    },

    /// Show configuration status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    // The first Ctrl+C cancels the running turn, a second one exits.
    let current: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    let handler_state = current.clone();
    ctrlc::set_handler(move || {
        let running = handler_state
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        match running {
            Some(token) if !token.is_cancelled() => {
                eprintln!("\nCancelling... (press Ctrl+C again to exit)");
                token.cancel();
            }
            _ => {
                eprintln!("\nBye!");
                std::process::exit(0);
            }
        }
    })
    .ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let path = config::config_path();
            if path.exists() && !force {
                println!("Configuration already exists at {}", path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }
            config::save(&Config::default())?;
            println!("Wrote {}", path.display());
            println!("\nNext steps:");
            println!("  1. Set GEMINI_API_KEY, or pick another auth type in the config");
            println!("  2. Chat: tern chat -m \"Hello!\"");
        }

        Commands::Chat {
            message,
            no_environment,
        } => {
            let config = config::load()?;
            let session = build_session(&config, !no_environment).await?;

            match message {
                Some(message) => run_turn(&session, &message, &current).await?,
                None => {
                    println!("Interactive mode (type 'exit' to quit)\n");
                    run_interactive(&session, &current).await?;
                }
            }
        }

        Commands::Tokens { text } => {
            let config = config::load()?;
            let session = build_session(&config, false).await?;
            let counted = session.count_tokens(&text).await;
            println!("Model: {}", config.model);
            println!("Tokens: {}", counted);
            println!("Local estimate: {}", estimate_tokens(&text));
            println!("Context window: {}", token_limit(&config.model));
        }

        Commands::Status => {
            let path = config::config_path();
            let config = config::load()?;
            println!("Tern Status\n");
            println!(
                "Config: {} ({})",
                path.display(),
                if path.exists() { "found" } else { "defaults" }
            );
            println!("Auth: {}", config.auth.auth_type.as_str());
            println!(
                "Credentials: {}",
                if config.auth.api_key.as_deref().is_some_and(|k| !k.is_empty()) {
                    "set"
                } else {
                    "not set"
                }
            );
            if let Some(base_url) = &config.auth.base_url {
                println!("Base URL: {}", base_url);
            }
            println!("Model: {} (fallback {})", config.model, config.fallback_model);
            println!("Context window: {}", token_limit(&config.model));
            println!("Max turns: {}", config.max_turns);
        }
    }

    Ok(())
}

async fn build_session(config: &Config, seed_environment: bool) -> Result<ChatSession> {
    let generator = create_content_generator(&config.auth)?;
    let collaborators = Collaborators::with_defaults(generator.clone(), &config.fallback_model);
    let mut engine = TurnEngine::new(config, generator, collaborators).await;

    if seed_environment {
        let environment = WorkspaceEnvironment::current_dir()?;
        engine.seed_environment(&environment).await?;
    }
    Ok(ChatSession::new(engine))
}

async fn run_turn(
    session: &ChatSession,
    input: &str,
    current: &Mutex<Option<CancellationToken>>,
) -> Result<()> {
    let cancel = CancellationToken::new();
    if let Ok(mut slot) = current.lock() {
        *slot = Some(cancel.clone());
    }

    let mut turn = session.send_message_stream(input, cancel);
    let mut stdout = io::stdout();
    let mut thinking = false;

    while let Some(event) = turn.events.next().await {
        match event {
            StreamEvent::ThoughtDelta(thought) => {
                if !thinking {
                    write!(stdout, "\x1b[2m")?;
                    thinking = true;
                }
                write!(stdout, "{}", thought)?;
            }
            other => {
                if thinking {
                    writeln!(stdout, "\x1b[0m")?;
                    thinking = false;
                }
                render(&mut stdout, other)?;
            }
        }
        stdout.flush()?;
    }
    if thinking {
        write!(stdout, "\x1b[0m")?;
    }

    let outcome = turn.finish().await?;
    if let Ok(mut slot) = current.lock() {
        *slot = None;
    }
    writeln!(stdout)?;
    if outcome.cancelled {
        println!("\x1b[33m(cancelled)\x1b[0m");
    }
    Ok(())
}

fn render(out: &mut impl Write, event: StreamEvent) -> io::Result<()> {
    match event {
        StreamEvent::TextDelta(text) => write!(out, "{}", text),
        StreamEvent::ThoughtDelta(thought) => write!(out, "{}", thought),
        StreamEvent::ToolCallRequest(call) => {
            writeln!(out, "\n\x1b[36m[tool] {}({})\x1b[0m", call.name, call.arguments)
        }
        StreamEvent::UsageMetadata(usage) => {
            tracing::debug!(total = usage.total_token_count, "Usage");
            Ok(())
        }
        StreamEvent::Compressed(info) => writeln!(
            out,
            "\x1b[2m[history compressed: {} -> {} tokens]\x1b[0m",
            info.original_token_count, info.new_token_count
        ),
        StreamEvent::ModelSwitched { from, to } => writeln!(
            out,
            "\x1b[33m[quota exhausted on {}, switched to {}]\x1b[0m",
            from, to
        ),
        StreamEvent::LoopDetected => {
            writeln!(out, "\n\x1b[33m[loop detected, stopping]\x1b[0m")
        }
        StreamEvent::MaxTurnsReached => {
            writeln!(out, "\n\x1b[33m[turn limit reached]\x1b[0m")
        }
        StreamEvent::Error(error) => writeln!(
            out,
            "\n\x1b[1;31mError\x1b[0m ({:?}, {} during {}): {}",
            error.kind, error.model, error.operation, error.message
        ),
    }
}

async fn run_interactive(
    session: &ChatSession,
    current: &Mutex<Option<CancellationToken>>,
) -> Result<()> {
    loop {
        print!("\x1b[1;34mYou\x1b[0m: ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            println!("Bye!");
            break;
        }
        if input.is_empty() {
            continue;
        }
        if input == "/compress" {
            match session.try_compress(true, &CancellationToken::new()).await {
                Ok(Some(checkpoint)) => println!(
                    "Compressed {} -> {} tokens\n",
                    checkpoint.original_token_count, checkpoint.new_token_count
                ),
                Ok(None) => println!("Nothing to compress\n"),
                Err(e) => println!("\x1b[1;31mError\x1b[0m: {}\n", e),
            }
            continue;
        }

        print!("\x1b[1;32mModel\x1b[0m: ");
        run_turn(session, input, current).await?;
        println!();
    }

    Ok(())
}
