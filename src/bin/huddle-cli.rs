//! Huddle CLI - console driver for the conversation engine
//!
//! Reads events from stdin, one per line, as `<group|-> <user> <text>`, and
//! dispatches them through a small demo route table. Outbound messages are
//! printed as they are sent.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use huddle::runtime::dispatch::{Dispatcher, Route};
use huddle::runtime::{Directive, Engine, EngineConfig, Input, MemoryOutbox, Message, Scope, Script};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "huddle")]
#[command(about = "Drive chat conversations from the console", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the timeout grace period, in milliseconds
    #[arg(long)]
    grace_ms: Option<u64>,
}

/// Number-guessing conversation
struct GuessingGame {
    secret: u32,
    tries: u32,
    queued: VecDeque<Directive>,
}

impl GuessingGame {
    fn new() -> Self {
        let secret = (uuid::Uuid::new_v4().as_u128() % 100) as u32 + 1;
        Self {
            secret,
            tries: 0,
            queued: VecDeque::new(),
        }
    }
}

impl Script for GuessingGame {
    fn resume(&mut self, input: Input) -> anyhow::Result<Option<Directive>> {
        match input {
            Input::Start => self.queued.extend([
                Directive::timeout(Duration::from_secs(60)),
                Directive::emit("I picked a number between 1 and 100. Guess!"),
                Directive::Receive,
            ]),
            Input::Reply(reply) => match reply.text().map(|text| text.trim().parse::<u32>()) {
                None => self.queued.push_back(Directive::emit("Too slow, game over.")),
                // Not a number: leave it for other routes.
                Some(Err(_)) => self.queued.push_back(Directive::not_matched()),
                Some(Ok(guess)) => {
                    self.tries += 1;
                    if guess == self.secret {
                        self.queued.push_back(Directive::emit(format!(
                            "Correct! {} tries.",
                            self.tries
                        )));
                    } else {
                        let hint = if guess < self.secret { "Higher" } else { "Lower" };
                        self.queued
                            .extend([Directive::emit(hint), Directive::Receive]);
                    }
                }
            },
            Input::Continue | Input::Resumed => {}
        }
        Ok(self.queued.pop_front())
    }
}

fn start_game(engine: &Engine, scope: &Scope, message: &Message) -> anyhow::Result<bool> {
    if message.text.trim() != "guess" {
        return Ok(false);
    }
    engine.start(scope, GuessingGame::new());
    Ok(true)
}

fn ask_name(engine: &Engine, scope: &Scope, message: &Message) -> anyhow::Result<bool> {
    if message.text.trim() != "ask" {
        return Ok(false);
    }
    let dialogue = engine
        .dialogue(scope)
        .with_timeout(Duration::from_secs(30));
    tokio::spawn(async move {
        let outcome = match dialogue.send_and_wait("What's your name?").await {
            Ok(Some(reply)) => dialogue.send(&format!("Nice to meet you, {}!", reply.message.text)),
            Ok(None) => dialogue.send("No answer, never mind."),
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "ask dialogue failed");
        }
    });
    Ok(true)
}

fn help(engine: &Engine, scope: &Scope, _message: &Message) -> anyhow::Result<bool> {
    engine.send(scope, "Commands: guess, ask")?;
    Ok(true)
}

fn parse_event(line: &str) -> Option<(Scope, Message)> {
    let mut parts = line.trim().splitn(3, char::is_whitespace);
    let group = parts.next()?;
    let user = parts.next()?.parse().ok()?;
    let text = parts.next().unwrap_or_default();

    let scope = match group {
        "-" => Scope::private(user),
        group => Scope::in_group(group.parse().ok()?, user),
    };
    Some((scope, Message::new(text)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(grace_ms) = cli.grace_ms {
        config.timeout_grace_ms = grace_ms;
    }

    let outbox = Arc::new(MemoryOutbox::new());
    let mut sent = outbox.watch();
    tokio::spawn(async move {
        while let Some(message) = sent.recv().await {
            println!("-> {}: {}", message.scope, message.text);
        }
    });

    let engine = Engine::new(config, outbox)?;
    let mut faults = engine.subscribe_faults();
    tokio::spawn(async move {
        while let Ok(fault) = faults.recv().await {
            eprintln!("conversation {} failed: {}", fault.conversation, fault.error);
        }
    });

    let dispatcher = Dispatcher::builder(engine)
        .route(Route::new("guess", start_game).priority(10))
        .route(Route::new("ask", ask_name).priority(10).serialized())
        .route(Route::new("help", help).private_only().priority(100))
        .build();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some((scope, message)) = parse_event(&line) else {
            eprintln!("expected: <group|-> <user> <text>");
            continue;
        };
        match dispatcher.dispatch(scope, message) {
            Ok(Some(completion)) if !completion.is_handled() => println!("(unhandled)"),
            Ok(_) => {}
            Err(err) => eprintln!("error: {err}"),
        }
    }

    dispatcher.shutdown();
    Ok(())
}
