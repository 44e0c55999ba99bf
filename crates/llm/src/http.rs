use std::time::Duration;

use futures::stream;
use reqwest::RequestBuilder;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use snafu::{ResultExt, ensure};

use super::frame::{AbortReason, StreamEvent, decode_byte_stream, parse_error_body};
use super::provider::{
    BackendConfig, BackendError, BackendResult, BoxFuture, BuildClientSnafu, ChatBackend,
    ChatEventStream, ChatRequest, DecodeSnafu, EmptyChatIdSnafu, HistoryBackend, HistoryRow,
    MissingEndpointSnafu, NewChatRequest, NewChatResponse, RequestSnafu, StatusSnafu,
};

pub const STREAM_PATH: &str = "chat/stream";
pub const NEW_CHAT_PATH: &str = "chat/new";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryPayload {
    Rows(Vec<HistoryRow>),
    Wrapped { messages: Vec<HistoryRow> },
}

/// reqwest-backed client for the chat backend.
///
/// No overall request timeout is set; stalls are detected per frame by the
/// caller's watchdog.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        ensure!(
            !config.endpoint.is_empty(),
            MissingEndpointSnafu {
                stage: "http-backend-new",
            }
        );

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context(BuildClientSnafu {
                stage: "build-client",
            })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint, path.trim_start_matches('/'))
    }

    fn history_url(&self, chat_id: &str) -> String {
        self.url(&format!("chat/{chat_id}/messages"))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.api_key {
            Some(api_key) => builder.bearer_auth(api_key),
            None => builder,
        }
    }

    async fn ensure_success(
        response: reqwest::Response,
        url: &str,
        stage: &'static str,
    ) -> BackendResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        StatusSnafu {
            stage,
            url,
            status: status.as_u16(),
            body,
        }
        .fail()
    }

    fn single_event(event: StreamEvent) -> ChatEventStream {
        Box::pin(stream::iter([event]))
    }

    fn rejected_stream_event(url: &str, status: u16, body: String) -> StreamEvent {
        if let Some(error) = parse_error_body(&body) {
            return StreamEvent::Error(error);
        }

        let error = BackendError::Status {
            stage: "stream-http-status",
            url: url.to_string(),
            status,
            body,
        };
        StreamEvent::Aborted(AbortReason::Transport(error.to_string()))
    }
}

impl ChatBackend for HttpBackend {
    fn create_chat<'a>(&'a self, request: NewChatRequest) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move {
            let url = self.url(NEW_CHAT_PATH);
            let response = self
                .authorize(self.client.post(&url))
                .json(&request)
                .send()
                .await
                .context(RequestSnafu {
                    stage: "send-new-chat-request",
                    url: &url,
                })?;
            let response = Self::ensure_success(response, &url, "new-chat-status").await?;

            let body = response
                .json::<NewChatResponse>()
                .await
                .context(DecodeSnafu {
                    stage: "decode-new-chat-response",
                    url: &url,
                })?;

            let chat_id = body.chat_id.trim().to_string();
            ensure!(
                !chat_id.is_empty(),
                EmptyChatIdSnafu {
                    stage: "new-chat-response",
                }
            );

            tracing::info!(chat_id = %chat_id, "created chat");
            Ok(chat_id)
        })
    }

    fn open_stream<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, ChatEventStream> {
        Box::pin(async move {
            let url = self.url(STREAM_PATH);
            let sent = self
                .authorize(self.client.post(&url))
                .header(ACCEPT, "text/event-stream")
                .json(&request)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(source) => {
                    let error = BackendError::Request {
                        stage: "send-stream-request",
                        url,
                        source,
                    };
                    tracing::warn!(
                        chat_id = %request.chat_id,
                        error = %error,
                        "failed to open chat stream"
                    );
                    return Self::single_event(StreamEvent::Aborted(AbortReason::Transport(
                        error.to_string(),
                    )));
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(
                    chat_id = %request.chat_id,
                    status = status.as_u16(),
                    body = %body,
                    "chat stream request was rejected"
                );
                return Self::single_event(Self::rejected_stream_event(
                    &url,
                    status.as_u16(),
                    body,
                ));
            }

            tracing::debug!(
                chat_id = %request.chat_id,
                model_type = %request.model_type,
                "chat stream opened"
            );
            let events: ChatEventStream =
                Box::pin(decode_byte_stream(Box::pin(response.bytes_stream())));
            events
        })
    }
}

impl HistoryBackend for HttpBackend {
    fn fetch_messages<'a>(&'a self, chat_id: &'a str) -> BoxFuture<'a, BackendResult<Vec<HistoryRow>>> {
        Box::pin(async move {
            let url = self.history_url(chat_id);
            let response = self
                .authorize(self.client.get(&url))
                .send()
                .await
                .context(RequestSnafu {
                    stage: "send-history-request",
                    url: &url,
                })?;
            let response = Self::ensure_success(response, &url, "history-status").await?;

            let payload = response
                .json::<HistoryPayload>()
                .await
                .context(DecodeSnafu {
                    stage: "decode-history-response",
                    url: &url,
                })?;

            let rows = match payload {
                HistoryPayload::Rows(rows) | HistoryPayload::Wrapped { messages: rows } => rows,
            };
            tracing::debug!(chat_id = %chat_id, row_count = rows.len(), "fetched chat history");
            Ok(rows)
        })
    }
}
