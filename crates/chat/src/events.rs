use sokhan_llm::{BackendResult, HistoryRow, ModelParameters, StreamEvent};
use tokio::sync::oneshot;

use crate::error::ChatResult;
use crate::guard::SessionTicket;
use crate::ids::{ChatIdentity, Generation, MessageId};
use crate::message::{Attachment, Message, StreamFailure};
use crate::retry::RetryMode;

/// Everything background tasks hand back to the controller.
#[derive(Debug)]
pub(crate) enum Inbound {
    Session {
        ticket: SessionTicket,
        event: StreamEvent,
    },
    Reconciled {
        chat: ChatIdentity,
        generation: Generation,
        message_id: MessageId,
        result: BackendResult<Vec<HistoryRow>>,
    },
}

/// A prompt submitted by the user.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub prompt: String,
    pub parameters: Option<ModelParameters>,
    pub attachment: Option<Attachment>,
}

impl SendRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            parameters: None,
            attachment: None,
        }
    }

    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

/// Ids of the turn a send created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub chat: ChatIdentity,
    pub user_message_id: Option<MessageId>,
    pub ai_message_id: MessageId,
}

/// Commands accepted by [`crate::ChatController::run`].
#[derive(Debug)]
pub enum ChatCommand {
    Send {
        request: SendRequest,
        reply: Option<oneshot::Sender<ChatResult<SendReceipt>>>,
    },
    Cancel,
    Retry(RetryMode),
    SwitchChat(Option<ChatIdentity>),
    OpenChat(ChatIdentity),
    ClearChat,
    Reset,
}

/// What a UI renders after each change.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatSnapshot {
    pub chat: Option<ChatIdentity>,
    pub messages: Vec<Message>,
    pub is_streaming: bool,
    pub streaming_error: Option<StreamFailure>,
    pub is_resetting: bool,
}

impl ChatSnapshot {
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}
