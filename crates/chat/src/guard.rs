use crate::ids::{ChatIdentity, Generation, StreamSessionId};

/// Identity a stream session captured when it started.
///
/// Every mutation the session causes is checked against the guard's current
/// view; any divergence means the session's output is stale.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTicket {
    pub chat: ChatIdentity,
    pub generation: Generation,
    pub session_id: StreamSessionId,
}

/// Streaming slot state for the active chat. Only one session owns it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(SessionTicket),
    Done(SessionTicket),
    Failed(SessionTicket),
    Cancelled(SessionTicket),
    /// Superseded or abandoned without aborting its connection.
    Detached(SessionTicket),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(SessionTicket),
    Complete(SessionTicket),
    Fail(SessionTicket),
    Cancel(SessionTicket),
    Detach(SessionTicket),
    ResetToIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: SessionTicket,
        attempted: SessionTicket,
    },
    NoActiveStream,
    SessionMismatch {
        active: SessionTicket,
        attempted: SessionTicket,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn active_ticket(&self) -> Option<&SessionTicket> {
        match self {
            Self::Streaming(ticket) => Some(ticket),
            Self::Idle
            | Self::Done(_)
            | Self::Failed(_)
            | Self::Cancelled(_)
            | Self::Detached(_) => None,
        }
    }

    pub fn accepts_stream_event(&self, ticket: &SessionTicket) -> bool {
        matches!(self, Self::Streaming(active) if active == ticket)
    }

    /// Applies one transition.
    ///
    /// Non-streaming states may start a new session directly. Terminal
    /// transitions must name the currently active session exactly; a new
    /// session while one is streaming must detach the old one first.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(ticket) => self.apply_start(ticket),
            StreamTransition::Complete(ticket) => self.apply_terminal(ticket, Self::Done),
            StreamTransition::Fail(ticket) => self.apply_terminal(ticket, Self::Failed),
            StreamTransition::Cancel(ticket) => self.apply_terminal(ticket, Self::Cancelled),
            StreamTransition::Detach(ticket) => self.apply_terminal(ticket, Self::Detached),
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, ticket: SessionTicket) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active != ticket => {
                Err(StreamTransitionRejection::AlreadyStreaming {
                    active: active.clone(),
                    attempted: ticket,
                })
            }
            Self::Streaming(_) => Ok(self.clone()),
            Self::Idle
            | Self::Done(_)
            | Self::Failed(_)
            | Self::Cancelled(_)
            | Self::Detached(_) => Ok(Self::Streaming(ticket)),
        }
    }

    fn apply_terminal(
        &self,
        ticket: SessionTicket,
        terminal: fn(SessionTicket) -> Self,
    ) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == ticket => Ok(terminal(ticket)),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: active.clone(),
                attempted: ticket,
            }),
            Self::Idle
            | Self::Done(_)
            | Self::Failed(_)
            | Self::Cancelled(_)
            | Self::Detached(_) => Err(StreamTransitionRejection::NoActiveStream),
        }
    }
}

/// Decides whether data delivered for a session may still be applied.
///
/// The guard never cancels network work; it only answers "is this still
/// relevant" at each mutation point.
#[derive(Debug, Clone, Default)]
pub struct SessionIdentityGuard {
    current: Option<ChatIdentity>,
    generation: Generation,
    state: StreamState,
    resetting: bool,
    next_session_id: u64,
}

impl SessionIdentityGuard {
    pub fn new(current: Option<ChatIdentity>) -> Self {
        Self {
            current,
            next_session_id: 1,
            ..Self::default()
        }
    }

    pub fn current(&self) -> Option<&ChatIdentity> {
        self.current.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn active_ticket(&self) -> Option<&SessionTicket> {
        self.state.active_ticket()
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting
    }

    /// Points the guard at another chat. Returns false when nothing changed.
    pub fn switch_to(&mut self, next: Option<ChatIdentity>) -> bool {
        if self.current == next {
            return false;
        }

        tracing::debug!(
            from = ?self.current,
            to = ?next,
            generation = self.generation.next().0,
            "chat identity switched"
        );
        self.current = next;
        self.invalidate();
        true
    }

    /// Invalidates every outstanding ticket without changing the chat.
    pub fn invalidate(&mut self) {
        self.generation = self.generation.next();
        self.state = StreamState::Idle;
    }

    pub fn begin_reset(&mut self) {
        self.resetting = true;
    }

    pub fn end_reset(&mut self) {
        self.resetting = false;
    }

    /// Captures the current identity for a new session.
    ///
    /// Returns `None` while resetting or when no chat is active.
    pub fn issue(&mut self) -> Option<SessionTicket> {
        if self.resetting {
            return None;
        }

        let chat = self.current.clone()?;
        let session_id = StreamSessionId::new(self.next_session_id);
        // Reserve immediately so a follow-up send never reuses a ticket.
        self.next_session_id = self.next_session_id.saturating_add(1);

        Some(SessionTicket {
            chat,
            generation: self.generation,
            session_id,
        })
    }

    pub fn transition(&mut self, transition: StreamTransition) -> StreamTransitionResult {
        let next_state = self.state.apply(transition)?;
        self.state = next_state.clone();
        Ok(next_state)
    }

    /// True while `chat`/`generation` still describe what the user is looking at.
    pub fn admits_chat(&self, chat: &ChatIdentity, generation: Generation) -> bool {
        !self.resetting && self.current.as_ref() == Some(chat) && self.generation == generation
    }

    /// True when `ticket` belongs to the active session of the current chat.
    pub fn admits(&self, ticket: &SessionTicket) -> bool {
        self.admits_chat(&ticket.chat, ticket.generation) && self.state.accepts_stream_event(ticket)
    }
}
