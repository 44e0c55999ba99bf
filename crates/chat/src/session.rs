//! One in-flight chat request.
//!
//! [`StreamSession`] is the controller-side record: accumulators for the two
//! text channels, the target message and the cancellation handle. The network
//! side runs in a spawned task that only forwards decoded events, tagged with
//! the session's ticket, into the controller inbox.

use std::sync::Arc;

use futures::StreamExt;
use sokhan_llm::{AbortReason, ChatBackend, ChatRequest, StreamEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::Instrument;

use crate::events::Inbound;
use crate::guard::SessionTicket;
use crate::ids::MessageId;
use crate::message::{Message, MessageError, MessagePatch, StreamFailure, error_text};

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Final accumulated answer text.
    Completed { content: String },
    Failed(StreamFailure),
    Cancelled,
}

/// Result of applying one event to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStep {
    Continue(MessagePatch),
    Finished {
        patch: MessagePatch,
        outcome: SessionOutcome,
    },
}

#[derive(Debug)]
pub struct StreamSession {
    ticket: SessionTicket,
    message_id: MessageId,
    content: String,
    reasoning: String,
    reasoning_complete: bool,
    frames: usize,
    started_at: Instant,
    last_frame_at: Instant,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl StreamSession {
    /// Session writing into a fresh placeholder.
    pub fn new(ticket: SessionTicket, message_id: MessageId) -> Self {
        let now = Instant::now();
        Self {
            ticket,
            message_id,
            content: String::new(),
            reasoning: String::new(),
            reasoning_complete: false,
            frames: 0,
            started_at: now,
            last_frame_at: now,
            cancel_tx: None,
        }
    }

    /// Session continuing into an existing message; its partial text and
    /// reasoning seed the accumulators.
    pub fn continuing(ticket: SessionTicket, message: &Message) -> Self {
        let mut session = Self::new(ticket, message.id.clone());
        session.content = message.partial_text().to_string();
        session.reasoning = message.reasoning_text.clone().unwrap_or_default();
        session
    }

    pub fn ticket(&self) -> &SessionTicket {
        &self.ticket
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_frame_at(&self) -> Instant {
        self.last_frame_at
    }

    /// Message state a continuation starts from.
    pub fn restart_patch(&self) -> MessagePatch {
        MessagePatch {
            text: Some(self.content.clone()),
            is_streaming: Some(true),
            is_reasoning_complete: Some(false),
            error: Some(None),
            ..MessagePatch::default()
        }
    }

    /// Applies one decoded event in arrival order.
    pub fn apply(&mut self, event: StreamEvent) -> SessionStep {
        self.frames += 1;
        self.last_frame_at = Instant::now();

        match event {
            StreamEvent::Reasoning(delta) => {
                self.reasoning.push_str(&delta);
                SessionStep::Continue(MessagePatch {
                    reasoning_text: Some(Some(self.reasoning.clone())),
                    ..MessagePatch::default()
                })
            }
            StreamEvent::Content(delta) => {
                let mut patch = MessagePatch::default();
                // Reasoning always precedes content, so the first content frame closes it.
                if !self.reasoning_complete && !self.reasoning.is_empty() {
                    self.reasoning_complete = true;
                    patch.is_reasoning_complete = Some(true);
                }
                self.content.push_str(&delta);
                patch.text = Some(self.content.clone());
                SessionStep::Continue(patch)
            }
            StreamEvent::Error(error) => {
                tracing::warn!(
                    chat_id = %self.ticket.chat,
                    session_id = self.ticket.session_id.0,
                    error_type = ?error.error_type,
                    message = %error.message,
                    "stream ended with a server error"
                );
                self.fail(MessageError::from_server(&error))
            }
            StreamEvent::Done => {
                if self.content.trim().is_empty() {
                    tracing::warn!(
                        chat_id = %self.ticket.chat,
                        session_id = self.ticket.session_id.0,
                        "stream completed without any content"
                    );
                    return self.fail(MessageError::empty_response());
                }

                SessionStep::Finished {
                    patch: MessagePatch::finished(),
                    outcome: SessionOutcome::Completed {
                        content: self.content.clone(),
                    },
                }
            }
            StreamEvent::Aborted(AbortReason::Cancelled) => SessionStep::Finished {
                patch: MessagePatch::finished(),
                outcome: SessionOutcome::Cancelled,
            },
            StreamEvent::Aborted(AbortReason::Transport(detail)) => {
                tracing::warn!(
                    chat_id = %self.ticket.chat,
                    session_id = self.ticket.session_id.0,
                    detail = %detail,
                    "stream transport failed"
                );
                self.fail(MessageError::transport())
            }
        }
    }

    /// Finalizes the session after the stall watchdog fired.
    pub fn time_out(&mut self) -> SessionStep {
        self.fail(MessageError::timeout())
    }

    fn fail(&self, error: MessageError) -> SessionStep {
        let text = error_text(&self.content, &error);
        SessionStep::Finished {
            patch: MessagePatch::failed(text, error.clone()),
            outcome: SessionOutcome::Failed(StreamFailure {
                message_id: self.message_id.clone(),
                error,
            }),
        }
    }

    /// Starts the network side of the session.
    pub(crate) fn spawn(
        &mut self,
        backend: Arc<dyn ChatBackend>,
        request: ChatRequest,
        inbox: mpsc::UnboundedSender<Inbound>,
    ) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel_tx = Some(cancel_tx);

        let span = tracing::info_span!(
            "stream_session",
            chat_id = %self.ticket.chat,
            session_id = self.ticket.session_id.0,
        );
        tokio::spawn(drive(backend, request, self.ticket.clone(), inbox, cancel_rx).instrument(span));
    }

    /// Asks the network task to stop. Returns false when there was nothing to signal.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    /// Lets the network task run to completion unobserved.
    pub fn detach(&mut self) {
        self.cancel_tx = None;
    }
}

async fn drive(
    backend: Arc<dyn ChatBackend>,
    request: ChatRequest,
    ticket: SessionTicket,
    inbox: mpsc::UnboundedSender<Inbound>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let forward = |event: StreamEvent| {
        inbox
            .send(Inbound::Session {
                ticket: ticket.clone(),
                event,
            })
            .is_ok()
    };

    // A dropped sender means "detached": keep going, nobody is listening for cancel.
    let mut cancel_open = true;

    let open = backend.open_stream(request);
    tokio::pin!(open);

    let mut events = loop {
        tokio::select! {
            result = &mut cancel_rx, if cancel_open => {
                cancel_open = false;
                if result.is_ok() {
                    tracing::debug!("session cancelled before the stream opened");
                    forward(StreamEvent::Aborted(AbortReason::Cancelled));
                    return;
                }
            }
            events = &mut open => break events,
        }
    };

    loop {
        tokio::select! {
            result = &mut cancel_rx, if cancel_open => {
                cancel_open = false;
                if result.is_ok() {
                    // Dropping `events` drops the response body and closes the connection.
                    tracing::debug!("session cancelled mid-stream");
                    forward(StreamEvent::Aborted(AbortReason::Cancelled));
                    return;
                }
                tracing::debug!("session detached; draining the rest of the stream");
            }
            next = events.next() => {
                let Some(event) = next else {
                    forward(StreamEvent::Aborted(AbortReason::Transport(
                        "stream closed without a terminal frame".to_string(),
                    )));
                    return;
                };

                let terminal = event.is_terminal();
                if !forward(event) || terminal {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{ChatIdentity, Generation, StreamSessionId};
    use crate::message::{ErrorKind, GENERIC_ERROR_TEXT, TRANSPORT_ERROR_TEXT};
    use pretty_assertions::assert_eq;
    use sokhan_llm::ServerError;

    fn session() -> StreamSession {
        let ticket = SessionTicket {
            chat: ChatIdentity::parse("c1").expect("valid chat id"),
            generation: Generation::default(),
            session_id: StreamSessionId::new(1),
        };
        StreamSession::new(ticket, MessageId::new_local())
    }

    fn apply_all(session: &mut StreamSession, events: Vec<StreamEvent>) -> Message {
        let mut message = Message::ai_placeholder(session.message_id().clone());
        for event in events {
            match session.apply(event) {
                SessionStep::Continue(patch) | SessionStep::Finished { patch, .. } => {
                    message.apply(patch)
                }
            }
        }
        message
    }

    #[test]
    fn reasoning_completes_exactly_once_at_first_content() {
        let mut session = session();
        let mut completions = 0;
        let events = vec![
            StreamEvent::Reasoning("a".to_string()),
            StreamEvent::Reasoning("b".to_string()),
            StreamEvent::Content("x".to_string()),
            StreamEvent::Content("y".to_string()),
        ];

        for event in events {
            if let SessionStep::Continue(patch) = session.apply(event)
                && patch.is_reasoning_complete == Some(true)
            {
                completions += 1;
            }
        }

        assert_eq!(completions, 1);
        assert_eq!(session.reasoning(), "ab");
        assert_eq!(session.content(), "xy");
    }

    #[test]
    fn content_without_reasoning_never_marks_reasoning_complete() {
        let mut session = session();
        let message = apply_all(
            &mut session,
            vec![StreamEvent::Content("hi".to_string()), StreamEvent::Done],
        );

        assert!(!message.is_reasoning_complete);
        assert_eq!(message.reasoning_text, None);
        assert_eq!(message.text, "hi");
        assert!(!message.is_streaming);
    }

    #[test]
    fn done_without_content_is_an_error() {
        let mut session = session();
        let step = session.apply(StreamEvent::Done);

        let SessionStep::Finished { outcome, .. } = step else {
            panic!("done must finish the session");
        };
        let SessionOutcome::Failed(failure) = outcome else {
            panic!("empty completion must fail");
        };
        assert_eq!(failure.error.kind, ErrorKind::EmptyResponse);
        assert_eq!(failure.error.message, GENERIC_ERROR_TEXT);
    }

    #[test]
    fn server_error_after_partial_content_keeps_the_content() {
        let mut session = session();
        let message = apply_all(
            &mut session,
            vec![
                StreamEvent::Content("part".to_string()),
                StreamEvent::Error(ServerError::new("overloaded")),
            ],
        );

        assert!(message.is_error);
        assert_eq!(message.text, "part\n\noverloaded");
        assert_eq!(message.partial_text(), "part");
    }

    #[test]
    fn transport_abort_uses_network_message() {
        let mut session = session();
        let message = apply_all(
            &mut session,
            vec![StreamEvent::Aborted(AbortReason::Transport("reset".to_string()))],
        );

        assert_eq!(message.text, TRANSPORT_ERROR_TEXT);
        assert_eq!(
            message.error.map(|error| error.kind),
            Some(ErrorKind::Transport)
        );
    }

    #[test]
    fn cancellation_finalizes_quietly() {
        let mut session = session();
        let message = apply_all(
            &mut session,
            vec![
                StreamEvent::Content("half".to_string()),
                StreamEvent::Aborted(AbortReason::Cancelled),
            ],
        );

        assert!(!message.is_error);
        assert!(!message.is_streaming);
        assert_eq!(message.text, "half");
    }

    #[test]
    fn continuation_seeds_accumulators_from_the_failed_message() {
        let mut failed = Message::ai_placeholder(MessageId::new_local());
        failed.reasoning_text = Some("r".to_string());
        let error = MessageError::timeout();
        failed.apply(MessagePatch::failed(error_text("old", &error), error));

        let ticket = session().ticket().clone();
        let mut session = StreamSession::continuing(ticket, &failed);
        assert_eq!(session.content(), "old");

        failed.apply(session.restart_patch());
        assert!(!failed.is_error);
        assert!(failed.is_streaming);
        assert_eq!(failed.text, "old");

        if let SessionStep::Continue(patch) = session.apply(StreamEvent::Content(" new".to_string())) {
            failed.apply(patch);
        }
        assert_eq!(failed.text, "old new");
        assert!(failed.is_reasoning_complete);
    }

    #[test]
    fn cancel_without_a_running_task_is_a_no_op() {
        let mut session = session();
        assert!(!session.cancel());
        assert!(!session.cancel());
    }
}
