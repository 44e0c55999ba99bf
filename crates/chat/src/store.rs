use snafu::{OptionExt, Snafu, ensure};

use crate::ids::MessageId;
use crate::message::{Message, MessagePatch, Sender};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("message '{id}' is already in the store"))]
    DuplicateMessage { stage: &'static str, id: MessageId },
    #[snafu(display("message '{id}' was not found"))]
    MessageNotFound { stage: &'static str, id: MessageId },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ordered, in-memory list of the active chat's messages.
///
/// Streams only ever patch by id; direct user actions only append.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.get(id).is_some()
    }

    /// The user turn `id` answers: the nearest user message before it.
    pub fn prompt_for(&self, id: &MessageId) -> Option<&Message> {
        let index = self.messages.iter().position(|message| &message.id == id)?;
        self.messages[..index]
            .iter()
            .rev()
            .find(|message| message.sender == Sender::User)
    }

    pub fn streaming_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|message| message.is_streaming)
            .count()
    }

    pub fn append(&mut self, message: Message) -> StoreResult<()> {
        ensure!(
            !self.contains(&message.id),
            DuplicateMessageSnafu {
                stage: "append-message",
                id: message.id.clone(),
            }
        );

        self.messages.push(message);
        Ok(())
    }

    /// Merges `patch` into the message with `id` and returns the result.
    pub fn patch(&mut self, id: &MessageId, patch: MessagePatch) -> StoreResult<&Message> {
        let message = self
            .messages
            .iter_mut()
            .find(|message| &message.id == id)
            .context(MessageNotFoundSnafu {
                stage: "patch-message",
                id: id.clone(),
            })?;

        message.apply(patch);
        Ok(message)
    }

    pub fn remove(&mut self, id: &MessageId) -> StoreResult<Message> {
        let index = self
            .messages
            .iter()
            .position(|message| &message.id == id)
            .context(MessageNotFoundSnafu {
                stage: "remove-message",
                id: id.clone(),
            })?;

        Ok(self.messages.remove(index))
    }

    /// Replaces everything, e.g. when hydrating a chat from history.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
