//! Terminal chat client: type a message, watch the reply stream in.
//!
//! Commands: `/history`, `/cancel` (or Ctrl-C while a reply streams), `/quit`.

mod render;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hearth_stream::prelude::*;
use hearth_stream::init_observability;
use tokio::io::{AsyncBufReadExt as _, BufReader, Lines, Stdin};
use tracing::{debug, info};

use crate::render::{Renderer, write_history, write_outcome};

/// Chat with the Hearth assistant from the terminal.
#[derive(Debug, Parser)]
#[command(name = "hearth-chat", version)]
struct Cli {
    /// Assistant API base URL (overrides HEARTH_API_URL)
    #[arg(long)]
    url: Option<String>,

    /// Bearer token (overrides HEARTH_API_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Conversation id forwarded with every message
    #[arg(long, short = 'c')]
    conversation: Option<String>,

    /// Seconds to wait for a reply stream to open
    #[arg(long)]
    open_timeout: Option<u64>,

    /// Drop partial replies after an error or cancellation
    #[arg(long)]
    discard_partial: bool,

    /// Print the assistant's reasoning as it streams
    #[arg(long)]
    show_thinking: bool,
}

type InputLines = Lines<BufReader<Stdin>>;

enum Command<'a> {
    Quit,
    History,
    Cancel,
    Send(&'a str),
    Empty,
}

fn parse_command(line: &str) -> Command<'_> {
    match line.trim() {
        "" => Command::Empty,
        "/quit" | "/exit" => Command::Quit,
        "/history" => Command::History,
        "/cancel" => Command::Cancel,
        text => Command::Send(text),
    }
}

fn supervisor_from_cli(cli: &Cli) -> Result<Supervisor, SupervisorError> {
    let mut endpoint_config = match cli.url.as_ref() {
        Some(url) => EndpointConfig::new(url.clone()),
        None => EndpointConfig::from_env()?,
    };
    if let Some(token) = cli.token.as_ref() {
        endpoint_config = endpoint_config.api_token(token.clone());
    } else if endpoint_config.api_token.is_none()
        && let Ok(token) = std::env::var("HEARTH_API_TOKEN")
        && !token.trim().is_empty()
    {
        endpoint_config = endpoint_config.api_token(token);
    }
    let endpoint = HttpEndpoint::new(endpoint_config)?;

    let mut config = SupervisorConfig::default();
    if cli.discard_partial {
        config = config.partial_content(PartialContentPolicy::Discard);
    }
    if let Some(secs) = cli.open_timeout {
        config = config.open_timeout(Duration::from_secs(secs));
    }
    if let Some(id) = cli.conversation.as_ref() {
        config = config.conversation_id(id.clone());
    }
    Ok(Supervisor::new(Arc::new(endpoint), config))
}

/// Renders the active turn until it closes. Returns `true` if the user asked to quit.
async fn stream_reply(
    supervisor: &mut Supervisor,
    lines: &mut InputLines,
    show_thinking: bool,
) -> std::io::Result<bool> {
    let mut updates = supervisor.subscribe();
    // The turn may already have published past the point of subscription.
    updates.mark_changed();
    let mut renderer = Renderer::new(show_thinking);
    let mut stdout = std::io::stdout();
    let mut quit = false;
    let mut cancelled = None;

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                let Some(snapshot) = snapshot else { break };
                renderer.draw(&snapshot, &mut stdout)?;
                if !snapshot.is_active {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("ctrl-c while streaming");
                cancelled = supervisor.cancel_active().await;
                break;
            }
            line = lines.next_line() => {
                match line?.as_deref().map(parse_command) {
                    None | Some(Command::Quit) => {
                        quit = true;
                        cancelled = supervisor.cancel_active().await;
                        break;
                    }
                    Some(Command::Cancel) => {
                        cancelled = supervisor.cancel_active().await;
                        break;
                    }
                    Some(Command::Empty) => {}
                    Some(_) => eprintln!("\n(a reply is still streaming; /cancel it first)"),
                }
            }
        }
    }

    let outcome = match cancelled {
        Some(outcome) => Some(outcome),
        None => supervisor.wait_active().await,
    };
    if let Some(outcome) = outcome {
        write_outcome(&outcome, renderer.last_rate(), &mut stdout)?;
    }
    Ok(quit)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    init_observability();
    let cli = Cli::parse();
    let mut supervisor = supervisor_from_cli(&cli)?;
    info!("hearth-chat ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = std::io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match parse_command(&line) {
            Command::Empty => {}
            Command::Quit => break,
            Command::History => write_history(&supervisor.history(), &mut stdout)?,
            Command::Cancel => println!("(nothing is streaming)"),
            Command::Send(text) => match supervisor.submit(text).await {
                Ok(_) => {
                    if stream_reply(&mut supervisor, &mut lines, cli.show_thinking).await? {
                        break;
                    }
                }
                Err(err) => eprintln!("{err}"),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_trimmed_and_recognised() {
        assert!(matches!(parse_command("  /quit "), Command::Quit));
        assert!(matches!(parse_command("/exit"), Command::Quit));
        assert!(matches!(parse_command("/history"), Command::History));
        assert!(matches!(parse_command("/cancel"), Command::Cancel));
        assert!(matches!(parse_command("   "), Command::Empty));
        assert!(matches!(parse_command(" dinner? "), Command::Send("dinner?")));
    }

    #[test]
    fn cli_flags_shape_the_supervisor_config() {
        let cli = Cli::parse_from([
            "hearth-chat",
            "--url",
            "http://assistant.local:8000",
            "--discard-partial",
            "--open-timeout",
            "5",
            "-c",
            "family",
        ]);
        assert_eq!(cli.open_timeout, Some(5));
        assert!(cli.discard_partial);
        assert!(supervisor_from_cli(&cli).is_ok());
    }
}
