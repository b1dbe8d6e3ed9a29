//! Команды терминала: /models, /download, /use, /delete, /set, /clear, /help, /quit.
//!
//! Всё, что не начинается с `/`, уходит в чат. Ответ печатается по мере генерации.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use ai_runtime::{ChatError, ChatSettings};
use local_provider::hardware_detect::{bytes_to_gb, ram_bytes, ram_sufficient};
use local_provider::{AiModelDescriptor, DownloadState, MODEL_CATALOG};

use crate::state::{AppError, AppState};

pub const HELP: &str = "\
Commands:
  /models             list models and their download state
  /download <n>       download model n (resumes a partial download)
  /use <n>            load model n for chat
  /delete <n>         delete model n from disk
  /set <key> <value>  temperature | top_p | top_k | max_tokens | system_prompt
  /clear              delete the conversation
  /help               show this help
  /quit               exit
Anything else is sent to the model. Ctrl-C stops the current answer.";

pub enum Flow {
    Continue,
    Quit,
}

/// Разбирает строку ввода и выполняет команду.
pub async fn dispatch(state: &AppState, line: &str) -> Flow {
    let line = line.trim();
    if line.is_empty() {
        return Flow::Continue;
    }
    let Some(command) = line.strip_prefix('/') else {
        chat_turn(state, line).await;
        return Flow::Continue;
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map(|(n, r)| (n, r.trim()))
        .unwrap_or((command, ""));
    let result = match name {
        "quit" | "exit" => return Flow::Quit,
        "help" => {
            println!("{HELP}");
            Ok(())
        }
        "models" => {
            list_models(state);
            Ok(())
        }
        "download" => with_model(rest, |m| start_download(state, m)),
        "use" => match pick_model(rest) {
            Some(m) => use_model(state, m).await,
            None => Ok(()),
        },
        "delete" => match pick_model(rest) {
            Some(m) => delete_model(state, m).await,
            None => Ok(()),
        },
        "set" => set_option(state, rest),
        "clear" => state.chat.clear().await.map_err(AppError::from),
        other => {
            println!("unknown command /{other}, try /help");
            Ok(())
        }
    };
    if let Err(e) = result {
        tracing::warn!(command = name, error = %e, "command failed");
        println!("error: {}", describe(&e));
    }
    Flow::Continue
}

fn describe(e: &AppError) -> String {
    match e {
        AppError::Provider(p) | AppError::Chat(ChatError::Provider(p)) => p.user_message(),
        other => other.to_string(),
    }
}

fn pick_model(arg: &str) -> Option<&'static AiModelDescriptor> {
    let model = arg
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| MODEL_CATALOG.get(i));
    if model.is_none() {
        println!("expected a model number from /models (1-{})", MODEL_CATALOG.len());
    }
    model
}

fn with_model(
    arg: &str,
    f: impl FnOnce(&'static AiModelDescriptor),
) -> Result<(), AppError> {
    if let Some(model) = pick_model(arg) {
        f(model);
    }
    Ok(())
}

fn list_models(state: &AppState) {
    let active = state.chat.active_model().map(|m| m.filename);
    for (i, model) in MODEL_CATALOG.iter().enumerate() {
        let status = match state.models.state(model.filename) {
            Some(DownloadState::Success) => "downloaded".to_string(),
            Some(DownloadState::Downloading { progress, .. }) => {
                format!("downloading {:.0}%", progress * 100.0)
            }
            Some(DownloadState::Checking) => "checking".to_string(),
            Some(DownloadState::Verifying) => "verifying".to_string(),
            Some(DownloadState::Error { message, .. }) => format!("failed: {message}"),
            Some(DownloadState::Idle) | None => "not downloaded".to_string(),
        };
        let marker = if active == Some(model.filename) { "*" } else { " " };
        println!(
            "{marker}{:>2}. {:<18} {:>5.2} GB  {} GB RAM  {:<22} {}",
            i + 1,
            model.name,
            model.size_bytes as f64 / 1e9,
            model.ram_required_gb,
            status,
            model.description
        );
    }
}

/// Загрузка в фоне; прогресс печатается шагами по 10 %.
fn start_download(state: &AppState, model: &'static AiModelDescriptor) {
    let models = Arc::clone(&state.models);
    let chat = Arc::clone(&state.chat);
    let settings_path = state.settings_path.clone();

    if let Some(mut rx) = models.subscribe(model.filename) {
        tokio::spawn(async move {
            let mut last_step = -1i32;
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                match snapshot {
                    DownloadState::Downloading { progress, .. } => {
                        let step = (progress * 10.0) as i32;
                        if step > last_step {
                            last_step = step;
                            println!("[{}] {}%", model.name, step * 10);
                        }
                    }
                    DownloadState::Success | DownloadState::Error { .. } => break,
                    _ => {}
                }
            }
        });
    }

    tokio::spawn(async move {
        match models.download(model).await {
            Ok(path) => {
                println!("[{}] downloaded", model.name);
                if chat.active_model().is_none() {
                    match chat.switch_model(model, &path).await {
                        Ok(()) => {
                            println!("[{}] loaded, you can start chatting", model.name);
                            save_settings_logged(&settings_path, &chat.settings());
                        }
                        Err(e) => println!("[{}] could not load: {e}", model.name),
                    }
                }
            }
            Err(e) => println!("[{}] download failed: {}", model.name, e.user_message()),
        }
    });
}

/// Сохранение из фоновой задачи. Ошибка только логируется.
fn save_settings_logged(path: &Path, settings: &ChatSettings) -> bool {
    match ai_runtime::save_settings(path, settings) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not save settings");
            false
        }
    }
}

async fn use_model(state: &AppState, model: &'static AiModelDescriptor) -> Result<(), AppError> {
    if !state.models.is_downloaded(model).await {
        println!("{} is not downloaded yet, use /download first", model.name);
        return Ok(());
    }
    let available = ram_bytes();
    if !ram_sufficient(model.ram_required_gb, available) {
        tracing::warn!(model = %model.filename, required_gb = model.ram_required_gb, available_bytes = available, "low memory for model");
        println!(
            "warning: {} needs about {} GB RAM, {:.1} GB available; loading may be slow or fail",
            model.name,
            model.ram_required_gb,
            bytes_to_gb(available)
        );
    }
    println!("loading {}...", model.name);
    state
        .chat
        .switch_model(model, &state.models.model_path(model))
        .await?;
    state.save_settings()?;
    println!("{} ready", model.name);
    Ok(())
}

async fn delete_model(state: &AppState, model: &'static AiModelDescriptor) -> Result<(), AppError> {
    if state.chat.active_model().map(|m| m.filename) == Some(model.filename) {
        state.chat.unload().await;
    }
    state.models.delete(model).await?;
    println!("{} deleted", model.name);
    Ok(())
}

fn set_option(state: &AppState, rest: &str) -> Result<(), AppError> {
    let Some((key, value)) = rest.split_once(char::is_whitespace) else {
        println!("usage: /set <key> <value>");
        return Ok(());
    };
    let mut settings = state.chat.settings();
    settings.set(key, value.trim())?;
    state.chat.apply_settings(&settings);
    state.save_settings()?;
    println!("{key} updated");
    Ok(())
}

/// Отправляет сообщение и печатает черновик по мере роста.
async fn chat_turn(state: &AppState, text: &str) {
    let chat = Arc::clone(&state.chat);
    let mut draft = chat.subscribe_draft();
    let text = text.to_string();
    let mut turn = tokio::spawn(async move { chat.submit(&text).await });

    let mut stdout = std::io::stdout();
    let mut seen = String::new();
    let result = loop {
        tokio::select! {
            changed = draft.changed() => {
                if changed.is_err() {
                    break (&mut turn).await;
                }
                let current = draft.borrow_and_update().clone();
                if let Some(delta) = current.strip_prefix(seen.as_str()) {
                    let _ = write!(stdout, "{delta}");
                    let _ = stdout.flush();
                    seen = current;
                }
            }
            result = &mut turn => break result,
        }
    };

    match result {
        Ok(Ok(turn)) => {
            // Хвост, который пришёл вместе с завершением хода.
            if let Some(reply) = &turn.reply {
                if let Some(tail) = reply.content.strip_prefix(seen.trim_start()) {
                    print!("{tail}");
                }
                if reply.interrupted {
                    print!(" [stopped]");
                }
            }
            println!();
        }
        Ok(Err(ChatError::NoModel)) => println!("no model loaded, use /models and /use <n>"),
        Ok(Err(e)) => {
            println!();
            println!("error: {}", describe(&AppError::from(e)));
        }
        Err(e) => {
            tracing::warn!(error = %e, "chat task failed");
            println!("error: {e}");
        }
    }
}
