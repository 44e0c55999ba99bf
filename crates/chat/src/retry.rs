use sokhan_llm::ModelParameters;

use crate::ids::MessageId;
use crate::message::{Attachment, Message, Sender};
use crate::store::MessageStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Drop the failed answer and stream a new one.
    RestartFresh,
    /// Re-stream into the failed answer, keeping its partial text.
    ContinueLast,
}

/// What a send left behind for a later retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecord {
    pub prompt: String,
    pub parameters: ModelParameters,
    pub attachment: Option<Attachment>,
    pub target: MessageId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryPlan {
    Restart {
        record: RetryRecord,
        remove: MessageId,
    },
    Continue {
        record: RetryRecord,
        target: Message,
    },
}

impl RetryPlan {
    pub fn record(&self) -> &RetryRecord {
        match self {
            Self::Restart { record, .. } | Self::Continue { record, .. } => record,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    last: Option<RetryRecord>,
}

impl RetryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&RetryRecord> {
        self.last.as_ref()
    }

    pub fn record(&mut self, record: RetryRecord) {
        self.last = Some(record);
    }

    /// Points the record at the placeholder a restart created.
    pub fn retarget(&mut self, target: MessageId) {
        if let Some(record) = self.last.as_mut() {
            record.target = target;
        }
    }

    pub fn clear(&mut self) {
        self.last = None;
    }

    /// Resolves `mode` against the store.
    ///
    /// Only a failed AI answer is retried: `None` when nothing was recorded,
    /// the target is gone or still streaming, or it finished without error.
    pub fn plan(&self, mode: RetryMode, store: &MessageStore) -> Option<RetryPlan> {
        let record = self.last.clone()?;
        let target = store.get(&record.target)?;
        if target.sender != Sender::Ai || target.is_streaming || !target.is_error {
            return None;
        }

        Some(match mode {
            RetryMode::RestartFresh => RetryPlan::Restart {
                remove: target.id.clone(),
                record,
            },
            RetryMode::ContinueLast => RetryPlan::Continue {
                target: target.clone(),
                record,
            },
        })
    }
}
