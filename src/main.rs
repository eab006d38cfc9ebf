//! Storyweave terminal client
//!
//! Talks to a story server from the terminal: lines typed are sent to the
//! current character, replies are typed out as they arrive. Commands start
//! with a slash, see `/help`.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use storyweave_client::{
    DialogueEngine, EngineConfig, EngineError, Notice, PresentationOutcome, RenderTarget,
};
use storyweave_shared::{CharacterRef, Message, Speaker};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "\
commands:
  /character <name>   talk to another character
  /characters         list the characters of the current story
  /choices            show the offered replies
  /choose <n>         answer with reply number n
  /model <name>       switch the server's model
  /reset              clear the conversation
  /reconnect          reconnect after the connection was lost
  /quit               leave";

/// Prints dialogue to stdout.
struct TerminalTarget;

impl TerminalTarget {
    fn flush() {
        let _ = std::io::stdout().flush();
    }
}

impl RenderTarget for TerminalTarget {
    fn show_typing(&self, character: &CharacterRef) {
        println!("  ({} is typing...)", character);
    }

    fn hide_typing(&self, _character: &CharacterRef) {}

    fn begin_message(&self, message: &Message) {
        match message.speaker {
            Speaker::User => print!("you> "),
            Speaker::Character => print!("{}> ", message.speaker_name()),
        }
        Self::flush();
    }

    fn append_text(&self, _message: &Message, text: &str) {
        print!("{}", text);
        Self::flush();
    }

    fn end_message(&self, _message: &Message, outcome: PresentationOutcome) {
        match outcome {
            PresentationOutcome::Completed => println!(),
            PresentationOutcome::Cancelled => println!(" [...]"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Say(String),
    Character(String),
    Characters,
    Choices,
    Choose(usize),
    Model(String),
    Reset,
    Reconnect,
    Help,
    Quit,
    Empty,
    Unknown(String),
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Input::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Input::Say(line.to_string());
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match (name, arg) {
            ("quit" | "exit", _) => Input::Quit,
            ("help", _) => Input::Help,
            ("reset", _) => Input::Reset,
            ("reconnect", _) => Input::Reconnect,
            ("choices", _) => Input::Choices,
            ("characters", _) => Input::Characters,
            ("character", name) if !name.is_empty() => Input::Character(name.to_string()),
            ("model", model) if !model.is_empty() => Input::Model(model.to_string()),
            // Choices are shown 1-based.
            ("choose", n) => match n.parse::<usize>() {
                Ok(n) if n > 0 => Input::Choose(n - 1),
                _ => Input::Unknown(line.to_string()),
            },
            _ => Input::Unknown(line.to_string()),
        }
    }
}

fn print_notice(notice: &Notice) {
    match notice {
        Notice::Connected => eprintln!("* connected"),
        Notice::Error(e) => eprintln!("! {}", e),
        Notice::ConnectivityLost { attempts } => {
            eprintln!("!! connection lost after {} attempts; type /reconnect to retry", attempts)
        }
    }
}

async fn handle(engine: &DialogueEngine, input: Input) -> anyhow::Result<bool> {
    match input {
        Input::Empty => {}
        Input::Quit => return Ok(false),
        Input::Help => println!("{}", HELP),
        Input::Unknown(line) => println!("unknown command '{}', try /help", line),
        Input::Say(text) => match engine.send_message(&text) {
            // Reported through the notice channel.
            Ok(_) | Err(EngineError::NotConnected { .. }) => {}
            Err(e) => println!("{}", e),
        },
        Input::Choose(index) => {
            if let Err(e) = engine.choose(index) {
                println!("{}", e);
            }
        }
        Input::Choices => {
            let choices = engine.store().pending_choices();
            if choices.is_empty() {
                println!("no replies on offer");
            }
            for (i, choice) in choices.iter().enumerate() {
                println!("  {}. {}", i + 1, choice.text);
            }
        }
        Input::Character(name) => {
            let character = engine.select_character(&name).await?;
            println!("now talking to {}", character);
        }
        Input::Characters => {
            let characters = engine
                .api()
                .characters()
                .await
                .context("failed to list characters")?;
            for character in characters {
                println!(
                    "  {} (affection {}) {}",
                    character.name,
                    character.affection_level(),
                    character.personality
                );
            }
        }
        Input::Model(model) => {
            engine
                .set_model(&model)
                .await
                .with_context(|| format!("failed to switch to model '{}'", model))?;
            println!("model set to {}", model);
        }
        Input::Reset => {
            engine.reset().await;
            println!("conversation cleared");
        }
        Input::Reconnect => {
            if !engine.reconnect() {
                println!("already connected or connecting");
            }
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storyweave=info,storyweave_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        server = %config.server_url,
        socket = %config.socket.url,
        "starting storyweave"
    );

    let engine = DialogueEngine::new(config, Arc::new(TerminalTarget))?;
    let mut notices = engine.subscribe_notices();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => print_notice(&notice),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    engine.start();
    engine.wait_restored().await;
    match engine.store().current_character() {
        Some(character) => println!("talking to {} (/help for commands)", character),
        None => println!("pick someone with /character <name> (/help for commands)"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        match handle(&engine, Input::parse(&line)).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("! {:#}", e),
        }
    }

    engine.session().flush().await;
    engine.shutdown();
    Ok(())
}
