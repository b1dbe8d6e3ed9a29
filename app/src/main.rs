//! localchat: точка входа: инициализация состояния, REPL, Ctrl-C → остановка генерации.

mod commands;
mod state;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::commands::{dispatch, Flow, HELP};
use crate::state::{AppError, AppState};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("localchat: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = AppState::init()?;
    state.restore().await?;

    println!("localchat {} (logs: {})", env!("CARGO_PKG_VERSION"), state.log_path.display());
    match state.chat.active_model() {
        Some(model) => println!("model: {}", model.name),
        None => println!("no model loaded, use /models to pick one"),
    }
    println!("{HELP}");

    let chat = Arc::clone(&state.chat);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !chat.stop() {
                println!("\n(nothing to stop, type /quit to exit)");
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if let Flow::Quit = dispatch(&state, &line).await {
            break;
        }
    }

    state.chat.unload().await;
    tracing::info!("localchat exiting");
    Ok(())
}
