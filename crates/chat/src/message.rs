use sokhan_llm::ServerError;

use crate::ids::MessageId;

/// Shown when the connection drops mid-stream.
pub const TRANSPORT_ERROR_TEXT: &str = "ارتباط با سرور قطع شد. لطفاً دوباره تلاش کنید.";
/// Shown when the stall watchdog fires.
pub const TIMEOUT_ERROR_TEXT: &str = "سرعت اینترنت شما پایین است. پاسخ با تأخیر دریافت شد.";
/// Fallback for server errors without text and for empty responses.
pub const GENERIC_ERROR_TEXT: &str = "خطایی رخ داد. لطفاً دوباره تلاش کنید.";
/// Separates preserved partial content from an appended error message.
pub const ERROR_SEPARATOR: &str = "\n\n";

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Ai,
}

/// File metadata attached when a message is created. Never patched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Attachment {
    pub file_url: String,
    pub file_type: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
}

impl Attachment {
    pub fn new(file_url: impl Into<String>) -> Self {
        Self {
            file_url: file_url.into(),
            ..Self::default()
        }
    }
}

/// Billing hints carried by structured server errors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Remediation {
    pub remaining_credit: Option<f64>,
    pub button_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Server { error_type: Option<String> },
    NoCredit,
    EmptyResponse,
}

impl ErrorKind {
    pub fn from_server(error: &ServerError) -> Self {
        if error.is_no_credit() {
            Self::NoCredit
        } else {
            Self::Server {
                error_type: error.error_type.clone(),
            }
        }
    }

    /// Billing stops surface a call to action instead of a background refetch.
    pub fn allows_reconciliation(&self) -> bool {
        !matches!(self, Self::NoCredit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageError {
    pub kind: ErrorKind,
    pub message: String,
    pub remediation: Option<Remediation>,
}

impl MessageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            remediation: None,
        }
    }

    pub fn transport() -> Self {
        Self::new(ErrorKind::Transport, TRANSPORT_ERROR_TEXT)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, TIMEOUT_ERROR_TEXT)
    }

    pub fn empty_response() -> Self {
        Self::new(ErrorKind::EmptyResponse, GENERIC_ERROR_TEXT)
    }

    pub fn from_server(error: &ServerError) -> Self {
        let message = if error.message.trim().is_empty() {
            GENERIC_ERROR_TEXT.to_string()
        } else {
            error.message.clone()
        };

        let remediation = (error.remaining_credit.is_some() || error.button_message.is_some())
            .then(|| Remediation {
                remaining_credit: error.remaining_credit,
                button_label: error.button_message.clone(),
            });

        Self {
            kind: ErrorKind::from_server(error),
            message,
            remediation,
        }
    }
}

/// One chat turn as the UI renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub text: String,
    pub reasoning_text: Option<String>,
    pub is_streaming: bool,
    pub is_reasoning_complete: bool,
    pub is_error: bool,
    pub error: Option<MessageError>,
    pub attachment: Option<Attachment>,
}

impl Message {
    pub fn new(id: MessageId, sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id,
            sender,
            text: text.into(),
            reasoning_text: None,
            is_streaming: false,
            is_reasoning_complete: false,
            is_error: false,
            error: None,
            attachment: None,
        }
    }

    /// Creates the optimistic user turn appended on send.
    pub fn user(id: MessageId, text: impl Into<String>, attachment: Option<Attachment>) -> Self {
        Self {
            attachment,
            ..Self::new(id, Sender::User, text)
        }
    }

    /// Creates the empty AI placeholder a stream writes into.
    pub fn ai_placeholder(id: MessageId) -> Self {
        Self {
            is_streaming: true,
            ..Self::new(id, Sender::Ai, String::new())
        }
    }

    /// Answer text without an appended error message.
    pub fn partial_text(&self) -> &str {
        let Some(error) = &self.error else {
            return &self.text;
        };

        if self.text == error.message {
            return "";
        }

        self.text
            .strip_suffix(error.message.as_str())
            .and_then(|text| text.strip_suffix(ERROR_SEPARATOR))
            .unwrap_or(&self.text)
    }

    pub fn apply(&mut self, patch: MessagePatch) {
        if let Some(text) = patch.text {
            self.text = text;
        }
        if let Some(reasoning_text) = patch.reasoning_text {
            self.reasoning_text = reasoning_text;
        }
        if let Some(is_streaming) = patch.is_streaming {
            self.is_streaming = is_streaming;
        }
        if let Some(is_reasoning_complete) = patch.is_reasoning_complete {
            self.is_reasoning_complete = is_reasoning_complete;
        }
        if let Some(error) = patch.error {
            self.is_error = error.is_some();
            self.error = error;
        }
    }
}

/// Builds the text shown for a failed stream: partial content is kept and the
/// error message follows it.
pub fn error_text(partial: &str, error: &MessageError) -> String {
    if partial.trim().is_empty() {
        error.message.clone()
    } else {
        format!("{partial}{ERROR_SEPARATOR}{}", error.message)
    }
}

/// Partial update merged into an existing message. `None` leaves a field alone.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub reasoning_text: Option<Option<String>>,
    pub is_streaming: Option<bool>,
    pub is_reasoning_complete: Option<bool>,
    pub error: Option<Option<MessageError>>,
}

impl MessagePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn finished() -> Self {
        Self {
            is_streaming: Some(false),
            ..Self::default()
        }
    }

    pub fn failed(text: String, error: MessageError) -> Self {
        Self {
            text: Some(text),
            is_streaming: Some(false),
            error: Some(Some(error)),
            ..Self::default()
        }
    }
}

/// Retry affordance state: the most recent failure of the active chat.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub message_id: MessageId,
    pub error: MessageError,
}
