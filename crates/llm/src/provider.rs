use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use super::frame::StreamEvent;
use super::model::ModelParameters;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl BackendConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into().trim().to_string();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }
}

/// Body of the streaming chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub text: String,
    pub chat_id: String,
    pub model_type: String,
    pub web_search: bool,
    pub reasoning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl ChatRequest {
    pub fn new(
        chat_id: impl Into<String>,
        text: impl Into<String>,
        parameters: &ModelParameters,
    ) -> Self {
        Self {
            text: text.into(),
            chat_id: chat_id.into(),
            model_type: parameters.model_type.clone(),
            web_search: parameters.web_search,
            reasoning: parameters.reasoning,
            file_url: None,
        }
    }

    pub fn with_file_url(mut self, file_url: impl Into<String>) -> Self {
        self.file_url = Some(file_url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatRequest {
    pub title: String,
    pub model_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatResponse {
    pub chat_id: String,
}

/// One persisted message as the history endpoint returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub id: String,
    pub sender: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ChatEventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("backend endpoint is not configured"))]
    MissingEndpoint { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`, {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`, {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("{url} returned status {status}: {body}"))]
    Status {
        stage: &'static str,
        url: String,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode response from {url} on `{stage}`, {source}"))]
    Decode {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned an empty chat identifier"))]
    EmptyChatId { stage: &'static str },
}

/// Streaming chat endpoint plus chat creation.
pub trait ChatBackend: Send + Sync {
    /// Creates a conversation and returns its identifier.
    fn create_chat<'a>(&'a self, request: NewChatRequest) -> BoxFuture<'a, BackendResult<String>>;

    /// Opens the response stream for one prompt.
    ///
    /// Transport failures after the response started are reported in-band as
    /// [`StreamEvent::Aborted`], never as an `Err`.
    fn open_stream<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, ChatEventStream>;
}

/// Read access to persisted conversation history.
pub trait HistoryBackend: Send + Sync {
    fn fetch_messages<'a>(&'a self, chat_id: &'a str) -> BoxFuture<'a, BackendResult<Vec<HistoryRow>>>;
}
