//! Line-delimited `data:` frame decoding for the chat stream endpoint.
//!
//! The backend writes one JSON payload per line, each prefixed with `data:`,
//! and closes the logical stream with `data: [DONE]`. Bytes arrive in
//! arbitrary chunks, so the decoder buffers the unterminated tail and only
//! parses lines once their newline has been seen.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use serde_json::Value;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";
pub const REASONING_FRAME_TYPE: &str = "reasoning";
pub const NO_CREDIT_ERROR_TYPE: &str = "no_credit";

/// Structured error frame sent by the backend in place of content.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    pub message: String,
    pub error_type: Option<String>,
    pub remaining_credit: Option<f64>,
    pub button_message: Option<String>,
}

impl ServerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            remaining_credit: None,
            button_message: None,
        }
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Billing stops are final; no background reconciliation can fix them.
    pub fn is_no_credit(&self) -> bool {
        self.error_type.as_deref() == Some(NO_CREDIT_ERROR_TYPE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller asked the session to stop.
    Cancelled,
    /// The connection failed underneath the decoder.
    Transport(String),
}

/// One decoded application-level event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Reasoning(String),
    Error(ServerError),
    Done,
    Aborted(AbortReason),
}

impl StreamEvent {
    /// Terminal events end both the decoded sequence and the owning session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_) | Self::Done | Self::Aborted(_))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFrame {
    content: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    error: Option<Value>,
    error_type: Option<String>,
    remaining_credit: Option<f64>,
    button_message: Option<String>,
}

impl WireFrame {
    fn into_event(self) -> Option<StreamEvent> {
        if let Some(error) = self.error.filter(|error| !error.is_null()) {
            return Some(StreamEvent::Error(ServerError {
                message: error_message(&error),
                error_type: non_blank(self.error_type),
                remaining_credit: self.remaining_credit,
                button_message: non_blank(self.button_message),
            }));
        }

        let content = self.content.filter(|content| !content.is_empty())?;
        match self.kind.as_deref() {
            None => Some(StreamEvent::Content(content)),
            Some(REASONING_FRAME_TYPE) => Some(StreamEvent::Reasoning(content)),
            Some(other) => {
                tracing::debug!(frame_type = %other, "ignoring stream frame with unknown type");
                None
            }
        }
    }
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Incremental decoder from raw body bytes to [`StreamEvent`]s.
///
/// Feeding the same bytes split at any boundaries yields the same events.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the terminator was seen or [`FrameDecoder::finish`] ran.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Appends a chunk and returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let line_end = consumed + offset;
            let event = decode_line(&self.buffer[consumed..line_end]);
            consumed = line_end + 1;

            if let Some(event) = event {
                let done = matches!(event, StreamEvent::Done);
                events.push(event);
                if done {
                    self.finished = true;
                    self.buffer.clear();
                    return events;
                }
            }
        }

        // The unterminated tail stays buffered until its newline arrives.
        self.buffer.drain(..consumed);
        events
    }

    /// Flushes the buffered tail at end of body.
    ///
    /// A body that closes without the terminator still completes with
    /// [`StreamEvent::Done`].
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let remainder = std::mem::take(&mut self.buffer);
        let mut events = decode_line(&remainder).into_iter().collect::<Vec<_>>();
        if !matches!(events.last(), Some(StreamEvent::Done)) {
            events.push(StreamEvent::Done);
        }
        events
    }
}

fn decode_line(raw: &[u8]) -> Option<StreamEvent> {
    let line = match std::str::from_utf8(raw) {
        Ok(line) => line.trim(),
        Err(error) => {
            tracing::warn!(error = %error, "dropping stream line that is not valid UTF-8");
            return None;
        }
    };

    if line.is_empty() {
        return None;
    }

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        tracing::trace!(line = %line, "ignoring non-data stream line");
        return None;
    };

    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    decode_payload(payload)
}

fn decode_payload(payload: &str) -> Option<StreamEvent> {
    let value = match serde_json::from_str::<Value>(payload) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(error = %error, payload = %payload, "dropping malformed stream frame");
            return None;
        }
    };

    if !value.is_object() {
        tracing::debug!(payload = %payload, "ignoring non-object stream frame");
        return None;
    }

    match serde_json::from_value::<WireFrame>(value) {
        Ok(frame) => frame.into_event(),
        Err(error) => {
            tracing::warn!(error = %error, payload = %payload, "dropping stream frame with unexpected field types");
            None
        }
    }
}

/// Reads a structured error out of a rejected (non-2xx) response body.
pub fn parse_error_body(body: &str) -> Option<ServerError> {
    let frame = serde_json::from_str::<WireFrame>(body.trim()).ok()?;
    match frame.into_event() {
        Some(StreamEvent::Error(error)) => Some(error),
        _ => None,
    }
}

struct DecodeState<S> {
    bytes: S,
    decoder: FrameDecoder,
    pending: VecDeque<StreamEvent>,
    exhausted: bool,
}

/// Adapts a response body into a finite stream of decoded events.
///
/// The stream ends right after its first terminal event. A failing body
/// yields [`AbortReason::Transport`] instead of an error item.
pub fn decode_byte_stream<S, B, E>(bytes: S) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        bytes,
        decoder: FrameDecoder::new(),
        pending: VecDeque::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                if event.is_terminal() {
                    state.exhausted = true;
                    state.pending.clear();
                }
                return Some((event, state));
            }

            if state.exhausted {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(chunk.as_ref());
                    state.pending.extend(events);
                }
                Some(Err(error)) => {
                    tracing::warn!(error = %error, "stream body failed mid-read");
                    state
                        .pending
                        .push_back(StreamEvent::Aborted(AbortReason::Transport(error.to_string())));
                }
                None => {
                    let events = state.decoder.finish();
                    state.pending.extend(events);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = concat!(
        "data: {\"type\":\"reasoning\",\"content\":\"فکر می‌کنم...\"}\n",
        "\n",
        ": keep-alive\n",
        "data: {\"content\":\"سلام\"}\r\n",
        "data: {\"content\":\" دنیا\"}\n",
        "data: {\"usage\":{\"tokens\":3}}\n",
        "data: [DONE]\n",
    );

    fn expected_sample_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::Reasoning("فکر می‌کنم...".to_string()),
            StreamEvent::Content("سلام".to_string()),
            StreamEvent::Content(" دنیا".to_string()),
            StreamEvent::Done,
        ]
    }

    fn decode_in_pieces(bytes: &[u8], boundaries: &[usize]) -> Vec<StreamEvent> {
        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        let mut start = 0;
        for &end in boundaries {
            events.extend(decoder.push(&bytes[start..end]));
            start = end;
        }
        events.extend(decoder.push(&bytes[start..]));
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn decodes_reasoning_content_and_terminator() {
        let events = decode_in_pieces(SAMPLE.as_bytes(), &[]);
        assert_eq!(events, expected_sample_events());
    }

    #[test]
    fn every_two_way_split_decodes_identically() {
        let bytes = SAMPLE.as_bytes();
        for split in 0..=bytes.len() {
            assert_eq!(
                decode_in_pieces(bytes, &[split]),
                expected_sample_events(),
                "split at byte {split}"
            );
        }
    }

    #[test]
    fn byte_by_byte_feed_never_surfaces_partial_frames() {
        let bytes = SAMPLE.as_bytes();
        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        for byte in bytes {
            events.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert!(decoder.is_finished());
        assert_eq!(events, expected_sample_events());
    }

    #[test]
    fn partial_json_waits_for_its_newline() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"conte").is_empty());
        assert!(decoder.push(b"nt\":\"hi\"").is_empty());
        assert_eq!(
            decoder.push(b"}\n"),
            vec![StreamEvent::Content("hi".to_string())]
        );
    }

    #[test]
    fn error_frame_carries_remediation_metadata() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(
            "data: {\"error\":\"no credit\",\"errorType\":\"no_credit\",\"remainingCredit\":0,\"buttonMessage\":\"افزایش اعتبار\"}\n"
                .as_bytes(),
        );

        let [StreamEvent::Error(error)] = events.as_slice() else {
            panic!("expected one error event, got {events:?}");
        };
        assert_eq!(error.message, "no credit");
        assert!(error.is_no_credit());
        assert_eq!(error.remaining_credit, Some(0.0));
        assert_eq!(error.button_message.as_deref(), Some("افزایش اعتبار"));
    }

    #[test]
    fn nested_error_objects_use_their_message() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"data: {\"error\":{\"message\":\"rate limited\"}}\n");
        assert_eq!(
            events,
            vec![StreamEvent::Error(ServerError::new("rate limited"))]
        );
    }

    #[test]
    fn malformed_and_unrecognized_frames_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(
            concat!(
                "data: {not json}\n",
                "data: 42\n",
                "data: {\"content\":\"\"}\n",
                "data: {\"type\":\"tool\",\"content\":\"x\"}\n",
                "event: ping\n",
                "data: {\"content\":\"ok\"}\n",
            )
            .as_bytes(),
        );
        assert_eq!(events, vec![StreamEvent::Content("ok".to_string())]);
    }

    #[test]
    fn bytes_after_terminator_are_ignored() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"data: [DONE]\ndata: {\"content\":\"late\"}\n");
        assert_eq!(events, vec![StreamEvent::Done]);
        assert!(decoder.push(b"data: {\"content\":\"later\"}\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn finish_parses_unterminated_tail_and_completes() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: {\"content\":\"tail\"}").is_empty());
        assert_eq!(
            decoder.finish(),
            vec![StreamEvent::Content("tail".to_string()), StreamEvent::Done]
        );
    }

    #[test]
    fn compact_marker_without_space_is_accepted() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(
            decoder.push(b"data:{\"content\":\"x\"}\ndata:[DONE]\n"),
            vec![StreamEvent::Content("x".to_string()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn byte_stream_failure_becomes_transport_abort() {
        let chunks: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"content\":\"par".to_vec()),
            Ok(b"tial\"}\n".to_vec()),
            Err("connection reset by peer".to_string()),
            Ok(b"data: {\"content\":\"never\"}\n".to_vec()),
        ];

        let events = decode_byte_stream(stream::iter(chunks))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Content("partial".to_string()),
                StreamEvent::Aborted(AbortReason::Transport(
                    "connection reset by peer".to_string()
                )),
            ]
        );
    }

    #[tokio::test]
    async fn byte_stream_ends_after_server_error() {
        let chunks: Vec<Result<&'static [u8], String>> = vec![Ok(
            &b"data: {\"error\":\"boom\"}\ndata: {\"content\":\"after\"}\ndata: [DONE]\n"[..],
        )];

        let events = decode_byte_stream(stream::iter(chunks))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events, vec![StreamEvent::Error(ServerError::new("boom"))]);
    }

    #[tokio::test]
    async fn byte_stream_without_terminator_still_completes() {
        let chunks: Vec<Result<&'static [u8], String>> = vec![Ok(&b"data: {\"content\":\"a\"}\n"[..])];

        let events = decode_byte_stream(stream::iter(chunks))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(
            events,
            vec![StreamEvent::Content("a".to_string()), StreamEvent::Done]
        );
    }
}
