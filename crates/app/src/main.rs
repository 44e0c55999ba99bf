use std::error::Error;
use std::io::Write;

use sokhan_chat::{
    ChatCommand, ChatController, ChatIdentity, ChatSnapshot, MessageId, RetryMode, SendRequest,
    Sender, SettingsStore,
};
use sokhan_llm::{create_backend, default_models};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const HELP: &str = "/new  /open <chat-id>  /retry  /continue  /cancel  /reset  /models  /quit";

#[derive(Debug)]
enum Input {
    Prompt(String),
    Command(ChatCommand),
    Models,
    Help,
    Quit,
}

fn parse_input(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Input::Prompt(line.to_string())));
    }

    let (name, argument) = line
        .split_once(char::is_whitespace)
        .map(|(name, argument)| (name, argument.trim()))
        .unwrap_or((line, ""));

    let input = match name {
        "/new" => Input::Command(ChatCommand::ClearChat),
        "/retry" => Input::Command(ChatCommand::Retry(RetryMode::RestartFresh)),
        "/continue" => Input::Command(ChatCommand::Retry(RetryMode::ContinueLast)),
        "/cancel" => Input::Command(ChatCommand::Cancel),
        "/reset" => Input::Command(ChatCommand::Reset),
        "/open" => {
            let chat = ChatIdentity::parse(argument).map_err(|error| error.to_string())?;
            Input::Command(ChatCommand::OpenChat(chat))
        }
        "/models" => Input::Models,
        "/help" => Input::Help,
        "/quit" | "/exit" => Input::Quit,
        other => return Err(format!("unknown command {other}; try /help")),
    };
    Ok(Some(input))
}

/// Prints the growing AI answer as deltas between snapshots.
#[derive(Debug, Default)]
struct Renderer {
    message_id: Option<MessageId>,
    reasoning_len: usize,
    text_len: usize,
    finished: bool,
}

impl Renderer {
    fn render(&mut self, snapshot: &ChatSnapshot) -> String {
        let Some(message) = snapshot.last_message().filter(|message| message.sender == Sender::Ai)
        else {
            return String::new();
        };

        let mut out = String::new();
        if self.message_id.as_ref() != Some(&message.id) {
            *self = Self {
                message_id: Some(message.id.clone()),
                ..Self::default()
            };
        } else if self.finished && !message.is_streaming {
            // Reconciliation may still rewrite a finished answer.
            if message.text.len() == self.text_len {
                return out;
            }
            self.text_len = 0;
            out.push_str("\n[updated] ");
        }
        self.finished = false;

        if let Some(reasoning) = &message.reasoning_text {
            if let Some(delta) = reasoning.get(self.reasoning_len..).filter(|delta| !delta.is_empty()) {
                if self.reasoning_len == 0 {
                    out.push_str("[thinking] ");
                }
                out.push_str(delta);
                self.reasoning_len = reasoning.len();
            }
        }

        match message.text.get(self.text_len..) {
            Some(delta) if !delta.is_empty() => {
                if self.text_len == 0 && self.reasoning_len > 0 {
                    out.push('\n');
                }
                out.push_str(delta);
            }
            Some(_) => {}
            // The text was rewritten (error suffix replaced on continue); show it whole.
            None => {
                out.push('\n');
                out.push_str(&message.text);
            }
        }
        self.text_len = message.text.len();

        if !message.is_streaming {
            self.finished = true;
            out.push('\n');
        }
        out
    }
}

async fn print_snapshots(mut snapshots: watch::Receiver<ChatSnapshot>) {
    let mut renderer = Renderer::default();
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        let out = renderer.render(&snapshot);
        if out.is_empty() {
            continue;
        }

        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(out.as_bytes());
        let _ = stdout.flush();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        endpoint = %settings.endpoint,
        model = %settings.model_type,
        config = ?settings_store.config_path(),
        "starting chat client"
    );

    let backend = create_backend(settings.backend_config())?;
    let controller =
        ChatController::new(backend.clone(), backend, settings.controller_options());
    let (handle, controller_task) = controller.spawn();
    let printer = tokio::spawn(print_snapshots(handle.subscribe()));

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse_input(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };

        match input {
            Input::Prompt(prompt) => {
                if let Err(error) = handle.send(SendRequest::new(prompt)).await {
                    eprintln!("{error}");
                }
            }
            Input::Command(command) => handle.command(command).await?,
            Input::Models => {
                for model in default_models() {
                    let marker = if model.id == settings.model_type { "*" } else { " " };
                    println!(
                        "{marker} {} {}",
                        model.id,
                        model.description.unwrap_or_default()
                    );
                }
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
        }
    }

    drop(handle);
    controller_task.await?;
    printer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sokhan_chat::{Message, MessagePatch};

    #[test]
    fn parses_prompts_and_commands() {
        assert!(matches!(parse_input("   "), Ok(None)));
        assert!(matches!(
            parse_input(" سلام "),
            Ok(Some(Input::Prompt(prompt))) if prompt == "سلام"
        ));
        assert!(matches!(
            parse_input("/continue"),
            Ok(Some(Input::Command(ChatCommand::Retry(RetryMode::ContinueLast))))
        ));
        assert!(matches!(
            parse_input("/open  c42 "),
            Ok(Some(Input::Command(ChatCommand::OpenChat(chat)))) if chat.as_str() == "c42"
        ));
        assert!(parse_input("/open").is_err());
        assert_eq!(
            parse_input("/bogus").err(),
            Some("unknown command /bogus; try /help".to_string())
        );
    }

    #[test]
    fn renderer_prints_only_deltas() {
        let id = MessageId::new_local();
        let mut message = Message::ai_placeholder(id);
        let mut snapshot = ChatSnapshot {
            messages: vec![message.clone()],
            is_streaming: true,
            ..ChatSnapshot::default()
        };
        let mut renderer = Renderer::default();

        message.apply(MessagePatch {
            reasoning_text: Some(Some("hm".to_string())),
            ..MessagePatch::default()
        });
        snapshot.messages = vec![message.clone()];
        assert_eq!(renderer.render(&snapshot), "[thinking] hm");

        message.apply(MessagePatch {
            text: Some("hi".to_string()),
            ..MessagePatch::default()
        });
        snapshot.messages = vec![message.clone()];
        assert_eq!(renderer.render(&snapshot), "\nhi");

        message.apply(MessagePatch {
            text: Some("hi there".to_string()),
            ..MessagePatch::finished()
        });
        snapshot.messages = vec![message.clone()];
        assert_eq!(renderer.render(&snapshot), " there\n");
        assert_eq!(renderer.render(&snapshot), "");
    }
}
