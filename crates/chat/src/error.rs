use snafu::Snafu;
use sokhan_llm::BackendError;

use crate::guard::StreamTransitionRejection;
use crate::store::StoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("'{raw}' is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("cannot send an empty prompt"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("chat is resetting; `{stage}` was refused"))]
    Resetting { stage: &'static str },
    #[snafu(display("failed to create chat on `{stage}`, {source}"))]
    CreateChat {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("failed to load history for chat '{chat_id}', {source}"))]
    LoadHistory {
        stage: &'static str,
        chat_id: String,
        source: BackendError,
    },
    #[snafu(display("message store rejected `{stage}`, {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("no chat is active on `{stage}`"))]
    NoActiveChat { stage: &'static str },
    #[snafu(display("stream session refused on `{stage}`: {rejection:?}"))]
    SessionRejected {
        stage: &'static str,
        rejection: StreamTransitionRejection,
    },
    #[snafu(display("chat controller is no longer running"))]
    ControllerClosed { stage: &'static str },
}

pub type ChatResult<T> = Result<T, ChatError>;
