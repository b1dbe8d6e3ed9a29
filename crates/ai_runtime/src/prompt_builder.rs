//! PromptBuilder: история → текст для движка в разметке модели.
//!
//! Чистая функция без ошибок. Результат всегда заканчивается открытым ходом ассистента.

use backend_core::{Message, Role};
use local_provider::PromptTemplate;

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful, concise assistant running entirely on this device.";

/// Промпт и стоп-строки для его семейства.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedPrompt {
    pub text: String,
    pub stop_sequences: Vec<String>,
}

pub struct PromptBuilder;

impl PromptBuilder {
    /// Собирает промпт из системной инструкции и истории.
    pub fn build(template: PromptTemplate, system_prompt: &str, history: &[Message]) -> FormattedPrompt {
        let text = match template {
            PromptTemplate::ChatMl => Self::chat_ml(system_prompt, history),
            PromptTemplate::Phi3 => Self::phi3(system_prompt, history),
            PromptTemplate::Mistral => Self::mistral(system_prompt, history),
            PromptTemplate::Zephyr => Self::zephyr(system_prompt, history),
        };
        FormattedPrompt {
            text,
            stop_sequences: Self::stop_sequences(template),
        }
    }

    pub fn stop_sequences(template: PromptTemplate) -> Vec<String> {
        let stops: &[&str] = match template {
            PromptTemplate::ChatMl => &["<|im_end|>", "<|im_start|>"],
            PromptTemplate::Phi3 => &[
                "<|end|>",
                "<|endoftext|>",
                "<|user|>",
                "<|assistant|>",
                "<|system|>",
            ],
            PromptTemplate::Mistral => &["</s>", "[INST]"],
            PromptTemplate::Zephyr => &["</s>", "<|user|>", "<|system|>", "<|assistant|>"],
        };
        stops.iter().map(|s| s.to_string()).collect()
    }

    fn chat_ml(system: &str, history: &[Message]) -> String {
        let mut out = String::new();
        if !system.is_empty() {
            out.push_str(&format!("<|im_start|>system\n{system}<|im_end|>\n"));
        }
        for m in history {
            out.push_str(&format!(
                "<|im_start|>{}\n{}<|im_end|>\n",
                m.role.as_str(),
                m.content
            ));
        }
        out.push_str("<|im_start|>assistant\n");
        out
    }

    fn phi3(system: &str, history: &[Message]) -> String {
        let mut out = String::new();
        if !system.is_empty() {
            out.push_str(&format!("<|system|>\n{system}<|end|>\n"));
        }
        for m in history {
            out.push_str(&format!("<|{}|>\n{}<|end|>\n", m.role.as_str(), m.content));
        }
        out.push_str("<|assistant|>\n");
        out
    }

    fn zephyr(system: &str, history: &[Message]) -> String {
        let mut out = String::new();
        if !system.is_empty() {
            out.push_str(&format!("<|system|>\n{system}</s>\n"));
        }
        for m in history {
            out.push_str(&format!("<|{}|>\n{}</s>\n", m.role.as_str(), m.content));
        }
        out.push_str("<|assistant|>\n");
        out
    }

    /// `[INST] sys\n\nuser [/INST] answer</s>[INST] user [/INST]`.
    /// Системной роли нет, инструкция идёт в первый `[INST]`. BOS добавляет движок при токенизации.
    fn mistral(system: &str, history: &[Message]) -> String {
        let mut out = String::from("[INST] ");
        if !system.is_empty() {
            out.push_str(system);
            out.push_str("\n\n");
        }
        // pending_inst: `[INST]` открыт и ждёт `[/INST]`;
        // awaiting: `[/INST]` закрыт, ответ ассистента ещё не записан.
        let mut pending_inst = true;
        let mut awaiting = false;
        for m in history {
            match m.role {
                Role::User => {
                    if awaiting {
                        // Два пользовательских хода подряд: закрываем пустой ответ.
                        out.push_str("</s>");
                        awaiting = false;
                    }
                    if !pending_inst {
                        out.push_str("[INST] ");
                    }
                    out.push_str(&m.content);
                }
                Role::Assistant => {
                    if pending_inst {
                        out.push_str(" [/INST]");
                        pending_inst = false;
                    }
                    out.push(' ');
                    out.push_str(&m.content);
                    out.push_str("</s>");
                    awaiting = false;
                    continue;
                }
            }
            out.push_str(" [/INST]");
            pending_inst = false;
            awaiting = true;
        }
        if pending_inst {
            out.push_str(" [/INST]");
        } else if !awaiting {
            out.push_str("[INST]  [/INST]");
        }
        out
    }
}
