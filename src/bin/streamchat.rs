//! Interactive chat application for a streaming chat service.
//!
//! This binary provides a REPL that streams replies from a chat service as they are
//! generated.
//!
//! # Usage
//!
//! ```bash
//! # Talk to http://localhost:8000 (or $STREAMCHAT_BASE_URL)
//! streamchat
//!
//! # Talk to another service
//! streamchat --base-url http://chat.internal:8080
//!
//! # Disable colors (useful for piping output)
//! streamchat --no-color
//! ```
//!
//! # Commands
//!
//! While chatting, you can use slash commands:
//! - `/help` - Show available commands
//! - `/clear` - Clear conversation history
//! - `/history` - Show the conversation so far
//! - `/health` - Check the chat service
//! - `/stats` - Show session statistics
//! - `/quit` - Exit the application
//!
//! Ctrl-C while a reply is streaming stops the reply.  A signal that arrives while no reply is
//! streaming (SIGTERM, for instance) exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use streamchat::chat::{
    ChatArgs, ChatCommand, ChatConfig, ChatSession, PlainTextRenderer, Renderer, help_text,
    parse_command,
};
use streamchat::{HealthStatus, MessageRole};

/// Main entry point for the streamchat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let (args, _) = ChatArgs::from_command_line_relaxed("streamchat [OPTIONS]");
    let config = ChatConfig::from(args);

    let client = config.client()?;
    let session =
        ChatSession::with_renderer(client, PlainTextRenderer::with_color(config.use_color));
    let mut renderer = PlainTextRenderer::with_color(config.use_color);
    let mut rl = DefaultEditor::new()?;

    // A signal while a reply streams stops the reply; any other time it ends the process.
    let interrupt = Arc::new(Notify::new());
    let streaming = Arc::new(AtomicBool::new(false));
    let handler_interrupt = Arc::clone(&interrupt);
    let handler_streaming = Arc::clone(&streaming);
    ctrlc::set_handler(move || {
        if !interrupt_reply(&handler_streaming, &handler_interrupt) {
            std::process::exit(130);
        }
    })?;

    println!("streamchat ({})", session.client().base_url());
    println!("Type /help for commands, /quit to exit\n");

    loop {
        let readline = rl.readline("You: ");

        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                // Check for slash commands
                if let Some(cmd) = parse_command(line) {
                    match cmd {
                        ChatCommand::Quit => {
                            session.cancel();
                            println!("Goodbye!");
                            break;
                        }
                        ChatCommand::Clear => {
                            session.clear_history();
                            renderer.print_info("Conversation cleared.");
                        }
                        ChatCommand::History => print_history(&session),
                        ChatCommand::Health => {
                            let health = session.client().health_check().await;
                            print_health(&health);
                        }
                        ChatCommand::Stats => print_stats(&session),
                        ChatCommand::Help => {
                            for line in help_text().lines() {
                                println!("    {}", line);
                            }
                        }
                        ChatCommand::Invalid(message) => {
                            renderer.print_error(&message);
                        }
                    }
                    continue;
                }

                // Register for Ctrl-C before the reply can start.
                let interrupted = interrupt.notified();
                tokio::pin!(interrupted);
                interrupted.as_mut().enable();

                println!("Assistant:");
                streaming.store(true, Ordering::Relaxed);
                if !session.send_message(line) {
                    streaming.store(false, Ordering::Relaxed);
                    renderer.print_error("A reply is already streaming.");
                    continue;
                }
                tokio::select! {
                    _ = session.wait_until_idle() => {}
                    _ = &mut interrupted => session.cancel(),
                }
                streaming.store(false, Ordering::Relaxed);
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {}", err));
                break;
            }
        }
    }

    Ok(())
}

/// Wakes the REPL's wait on a streaming reply.  Returns false when no reply is streaming.
fn interrupt_reply(streaming: &AtomicBool, interrupt: &Notify) -> bool {
    if streaming.load(Ordering::Relaxed) {
        interrupt.notify_waiters();
        true
    } else {
        false
    }
}

fn print_history(session: &ChatSession) {
    let transcript = session.transcript();
    if transcript.is_empty() {
        println!("    (no messages)");
        return;
    }
    for message in transcript {
        let speaker = match message.role {
            MessageRole::User => "You",
            MessageRole::Assistant => "Assistant",
        };
        let time = message.timestamp.time();
        println!(
            "    [{:02}:{:02}:{:02}] {speaker}: {}",
            time.hour(),
            time.minute(),
            time.second(),
            message.content
        );
    }
}

fn print_health(health: &HealthStatus) {
    println!("    Service Health:");
    println!("      Status: {}", health.status);
    if let Some(model) = health.model.as_deref() {
        println!("      Model: {}", model);
    }
    if let Some(configured) = health.api_configured {
        println!(
            "      API configured: {}",
            if configured { "yes" } else { "no" }
        );
    }
    if let Some(timestamp) = health.timestamp.as_deref() {
        println!("      Checked at: {}", timestamp);
    }
}

fn print_stats(session: &ChatSession) {
    let stats = session.stats();
    println!("    Session Statistics:");
    println!("      Endpoint: {}", stats.base_url);
    println!("      Messages: {}", stats.message_count);
    println!(
        "      Streaming: {}",
        if stats.is_loading { "yes" } else { "no" }
    );
    println!(
        "      Replies: {} completed / {} failed / {} cancelled",
        stats.completed_streams, stats.failed_streams, stats.cancelled_streams
    );
}
