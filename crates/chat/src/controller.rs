use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, ensure};
use sokhan_llm::{
    BackendResult, ChatBackend, ChatRequest, HistoryBackend, HistoryRow, ModelParameters,
    NewChatRequest, StreamEvent,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{
    ChatResult, ControllerClosedSnafu, CreateChatSnafu, EmptyPromptSnafu, LoadHistorySnafu,
    NoActiveChatSnafu, ResettingSnafu, SessionRejectedSnafu, StoreSnafu,
};
use crate::events::{ChatCommand, ChatSnapshot, Inbound, SendReceipt, SendRequest};
use crate::guard::{SessionIdentityGuard, SessionTicket, StreamState, StreamTransition};
use crate::history::{hydrate, reconcile_patch};
use crate::ids::{ChatIdentity, Generation, MessageId};
use crate::message::{Message, MessagePatch, StreamFailure};
use crate::retry::{RetryCoordinator, RetryMode, RetryPlan, RetryRecord};
use crate::session::{SessionOutcome, SessionStep, StreamSession};
use crate::store::MessageStore;
use crate::watchdog::{DEFAULT_STALL_TIMEOUT, StallWatchdog};

/// Wait before asking history for the authoritative answer after a failure.
pub const DEFAULT_RECONCILE_DELAY: Duration = Duration::from_secs(3);
pub const COMMAND_BUFFER: usize = 32;
const CHAT_TITLE_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    pub stall_timeout: Duration,
    pub reconcile_delay: Duration,
    pub parameters: ModelParameters,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            reconcile_delay: DEFAULT_RECONCILE_DELAY,
            parameters: ModelParameters::default(),
        }
    }
}

/// Single owner of the active chat's messages and its streaming slot.
///
/// Background work (stream sessions, reconciliation fetches) only posts into
/// the inbox; every state change happens in a `&mut self` method after the
/// identity guard has admitted it.
pub struct ChatController {
    backend: Arc<dyn ChatBackend>,
    history: Arc<dyn HistoryBackend>,
    options: ControllerOptions,
    store: MessageStore,
    guard: SessionIdentityGuard,
    watchdog: StallWatchdog,
    active: Option<StreamSession>,
    retry: RetryCoordinator,
    streaming_error: Option<StreamFailure>,
    pending_reconciliations: usize,
    inbox_tx: mpsc::UnboundedSender<Inbound>,
    inbox_rx: mpsc::UnboundedReceiver<Inbound>,
}

impl ChatController {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        history: Arc<dyn HistoryBackend>,
        options: ControllerOptions,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            history,
            watchdog: StallWatchdog::new(options.stall_timeout),
            options,
            store: MessageStore::new(),
            guard: SessionIdentityGuard::new(None),
            active: None,
            retry: RetryCoordinator::new(),
            streaming_error: None,
            pending_reconciliations: 0,
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.options
    }

    pub fn set_parameters(&mut self, parameters: ModelParameters) {
        self.options.parameters = parameters;
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn current_chat(&self) -> Option<&ChatIdentity> {
        self.guard.current()
    }

    pub fn generation(&self) -> Generation {
        self.guard.generation()
    }

    pub fn stream_state(&self) -> &StreamState {
        self.guard.state()
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_resetting(&self) -> bool {
        self.guard.is_resetting()
    }

    /// Most recent failure; drives the retry affordance.
    pub fn streaming_error(&self) -> Option<&StreamFailure> {
        self.streaming_error.as_ref()
    }

    pub fn pending_reconciliations(&self) -> usize {
        self.pending_reconciliations
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            chat: self.guard.current().cloned(),
            messages: self.store.messages().to_vec(),
            is_streaming: self.is_streaming(),
            streaming_error: self.streaming_error.clone(),
            is_resetting: self.guard.is_resetting(),
        }
    }

    /// Appends the user turn plus an AI placeholder and starts streaming into it.
    ///
    /// Creates a chat first when none is active. A session still streaming is
    /// superseded: its placeholder is finalized and its output ignored.
    pub async fn send(&mut self, request: SendRequest) -> ChatResult<SendReceipt> {
        let prompt = request.prompt.trim().to_string();
        ensure!(!prompt.is_empty(), EmptyPromptSnafu { stage: "send" });
        ensure!(!self.guard.is_resetting(), ResettingSnafu { stage: "send" });

        let parameters = request
            .parameters
            .unwrap_or_else(|| self.options.parameters.clone());

        if self.guard.current().is_none() {
            self.create_chat(&prompt, &parameters).await?;
        }

        let ticket = self.begin_session("send")?;
        let user_message_id = MessageId::new_local();
        let ai_message_id = MessageId::new_local();

        let appended = self
            .store
            .append(Message::user(
                user_message_id.clone(),
                prompt.clone(),
                request.attachment.clone(),
            ))
            .and_then(|()| {
                self.store
                    .append(Message::ai_placeholder(ai_message_id.clone()))
            })
            .context(StoreSnafu {
                stage: "append-turn",
            });
        if let Err(error) = appended {
            let _ = self.guard.transition(StreamTransition::ResetToIdle);
            return Err(error);
        }

        let record = RetryRecord {
            prompt,
            parameters,
            attachment: request.attachment,
            target: ai_message_id.clone(),
        };
        self.retry.record(record.clone());
        self.streaming_error = None;
        self.launch(StreamSession::new(ticket.clone(), ai_message_id.clone()), &record);

        Ok(SendReceipt {
            chat: ticket.chat,
            user_message_id: Some(user_message_id),
            ai_message_id,
        })
    }

    /// Re-runs the last recorded prompt. Returns `Ok(false)` when there is
    /// nothing to retry.
    pub fn retry(&mut self, mode: RetryMode) -> ChatResult<bool> {
        ensure!(!self.guard.is_resetting(), ResettingSnafu { stage: "retry" });

        let Some(plan) = self.retry.plan(mode, &self.store) else {
            tracing::debug!(?mode, "nothing to retry");
            return Ok(false);
        };

        let ticket = self.begin_session("retry")?;
        let record = plan.record().clone();

        let session = match plan {
            RetryPlan::Restart { remove, .. } => {
                let ai_message_id = MessageId::new_local();
                let replaced = self
                    .store
                    .remove(&remove)
                    .and_then(|_| {
                        self.store
                            .append(Message::ai_placeholder(ai_message_id.clone()))
                    })
                    .context(StoreSnafu {
                        stage: "restart-fresh",
                    });
                if let Err(error) = replaced {
                    let _ = self.guard.transition(StreamTransition::ResetToIdle);
                    return Err(error);
                }

                self.retry.retarget(ai_message_id.clone());
                StreamSession::new(ticket, ai_message_id)
            }
            RetryPlan::Continue { target, .. } => {
                let session = StreamSession::continuing(ticket, &target);
                self.patch_message(&target.id, session.restart_patch());
                session
            }
        };

        tracing::info!(
            chat_id = %session.ticket().chat,
            message_id = %session.message_id(),
            ?mode,
            "retrying last prompt"
        );
        self.streaming_error = None;
        self.launch(session, &record);
        Ok(true)
    }

    /// Stops the active session. Idempotent: returns false when nothing was streaming.
    pub fn cancel(&mut self) -> bool {
        let Some(mut session) = self.active.take() else {
            return false;
        };

        let signalled = session.cancel();
        self.watchdog.disarm();
        let _ = self
            .guard
            .transition(StreamTransition::Cancel(session.ticket().clone()));

        if !self.guard.is_resetting() {
            self.patch_message(session.message_id(), MessagePatch::finished());
        }

        tracing::info!(
            chat_id = %session.ticket().chat,
            session_id = session.ticket().session_id.0,
            signalled,
            "stream cancelled"
        );
        true
    }

    /// Points the controller at another chat. The store is emptied; the old
    /// session keeps running detached and its output is dropped.
    pub fn switch_chat(&mut self, next: Option<ChatIdentity>) -> bool {
        if self.guard.current() == next.as_ref() {
            return false;
        }

        self.release_active(false);
        self.guard.switch_to(next);
        self.store.clear();
        self.retry.clear();
        self.streaming_error = None;
        true
    }

    /// Switches to `chat` and hydrates it from history when the store is empty.
    pub async fn open_chat(&mut self, chat: ChatIdentity) -> ChatResult<usize> {
        ensure!(!self.guard.is_resetting(), ResettingSnafu { stage: "open-chat" });

        self.switch_chat(Some(chat.clone()));
        if !self.store.is_empty() {
            return Ok(self.store.len());
        }

        let rows = self
            .history
            .fetch_messages(chat.as_str())
            .await
            .context(LoadHistorySnafu {
                stage: "open-chat",
                chat_id: chat.to_string(),
            })?;

        self.store.replace_all(hydrate(&rows));
        tracing::info!(chat_id = %chat, messages = self.store.len(), "chat hydrated from history");
        Ok(self.store.len())
    }

    /// Manual "new chat": forget the identity and everything shown for it.
    pub fn clear_chat(&mut self) {
        self.release_active(false);
        if !self.guard.switch_to(None) {
            self.guard.invalidate();
        }
        self.store.clear();
        self.retry.clear();
        self.streaming_error = None;
        tracing::info!(generation = self.guard.generation().0, "chat cleared");
    }

    /// Full reset. Nothing queued before or during it is applied.
    pub fn reset(&mut self) {
        self.guard.begin_reset();
        tracing::info!("chat reset started");

        self.cancel();
        self.watchdog.disarm();
        while let Ok(inbound) = self.inbox_rx.try_recv() {
            let _ = self.handle_inbound(inbound);
        }

        self.clear_chat();
        self.guard.end_reset();
        tracing::info!(generation = self.guard.generation().0, "chat reset finished");
    }

    /// Waits for one inbox item or the stall deadline and applies it.
    ///
    /// Returns the outcome when a session finished during this step.
    pub async fn step(&mut self) -> Option<SessionOutcome> {
        tokio::select! {
            Some(inbound) = self.inbox_rx.recv() => self.handle_inbound(inbound),
            () = self.watchdog.expired() => self.handle_stall(),
        }
    }

    /// Steps until no session is active and returns how the last one ended.
    pub async fn run_until_idle(&mut self) -> Option<SessionOutcome> {
        let mut outcome = None;
        while self.active.is_some() {
            if let Some(finished) = self.step().await {
                outcome = Some(finished);
            }
        }
        outcome
    }

    /// Like [`Self::run_until_idle`], but also waits for scheduled reconciliations.
    pub async fn settle(&mut self) -> Option<SessionOutcome> {
        let mut outcome = self.run_until_idle().await;
        while self.active.is_some() || self.pending_reconciliations > 0 {
            if let Some(finished) = self.step().await {
                outcome = Some(finished);
            }
        }
        outcome
    }

    /// Serves `commands` until every sender is gone, publishing a snapshot
    /// after each command and each applied inbox item.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ChatCommand>,
        snapshots: watch::Sender<ChatSnapshot>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!("command channel closed; chat controller stopping");
                        break;
                    };
                    self.handle_command(command).await;
                }
                _ = self.step() => {}
            }

            snapshots.send_replace(self.snapshot());
        }

        self.cancel();
    }

    /// Moves the controller onto its own task.
    pub fn spawn(self) -> (ChatHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(self.snapshot());
        let task = tokio::spawn(self.run(command_rx, snapshot_tx));

        (
            ChatHandle {
                commands: command_tx,
                snapshots: snapshot_rx,
            },
            task,
        )
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::Send { request, reply } => {
                let result = self.send(request).await;
                if let Err(error) = &result {
                    tracing::warn!(error = %error, "send failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            ChatCommand::Cancel => {
                self.cancel();
            }
            ChatCommand::Retry(mode) => {
                if let Err(error) = self.retry(mode) {
                    tracing::warn!(error = %error, ?mode, "retry failed");
                }
            }
            ChatCommand::SwitchChat(chat) => {
                self.switch_chat(chat);
            }
            ChatCommand::OpenChat(chat) => {
                if let Err(error) = self.open_chat(chat).await {
                    tracing::warn!(error = %error, "failed to open chat");
                }
            }
            ChatCommand::ClearChat => self.clear_chat(),
            ChatCommand::Reset => self.reset(),
        }
    }

    async fn create_chat(&mut self, prompt: &str, parameters: &ModelParameters) -> ChatResult<()> {
        let request = NewChatRequest {
            title: prompt.chars().take(CHAT_TITLE_CHARS).collect(),
            model_type: parameters.model_type.clone(),
        };
        let raw = self
            .backend
            .create_chat(request)
            .await
            .context(CreateChatSnafu { stage: "send" })?;
        let chat = ChatIdentity::parse(&raw)?;

        tracing::info!(chat_id = %chat, "chat created");
        self.guard.switch_to(Some(chat));
        Ok(())
    }

    /// Frees the streaming slot and issues a ticket for the next session.
    fn begin_session(&mut self, stage: &'static str) -> ChatResult<SessionTicket> {
        self.release_active(true);

        let ticket = self.guard.issue().context(NoActiveChatSnafu { stage })?;
        self.guard
            .transition(StreamTransition::Start(ticket.clone()))
            .map_err(|rejection| SessionRejectedSnafu { stage, rejection }.build())?;
        Ok(ticket)
    }

    fn launch(&mut self, mut session: StreamSession, record: &RetryRecord) {
        let mut request = ChatRequest::new(
            session.ticket().chat.as_str(),
            record.prompt.as_str(),
            &record.parameters,
        );
        if let Some(attachment) = &record.attachment {
            request = request.with_file_url(attachment.file_url.clone());
        }

        tracing::info!(
            chat_id = %session.ticket().chat,
            session_id = session.ticket().session_id.0,
            generation = session.ticket().generation.0,
            message_id = %session.message_id(),
            model = %record.parameters.model_type,
            "stream session started"
        );

        session.spawn(self.backend.clone(), request, self.inbox_tx.clone());
        self.watchdog.arm();
        self.active = Some(session);
    }

    /// Detaches the active session without signalling it. With `finalize`
    /// its placeholder stops streaming in place.
    fn release_active(&mut self, finalize: bool) {
        let Some(mut session) = self.active.take() else {
            return;
        };

        session.detach();
        self.watchdog.disarm();
        let _ = self
            .guard
            .transition(StreamTransition::Detach(session.ticket().clone()));

        if finalize {
            self.patch_message(session.message_id(), MessagePatch::finished());
        }

        tracing::debug!(
            chat_id = %session.ticket().chat,
            session_id = session.ticket().session_id.0,
            frames = session.frames(),
            "stream session detached"
        );
    }

    fn handle_inbound(&mut self, inbound: Inbound) -> Option<SessionOutcome> {
        match inbound {
            Inbound::Session { ticket, event } => self.handle_session_event(ticket, event),
            Inbound::Reconciled {
                chat,
                generation,
                message_id,
                result,
            } => {
                self.apply_reconciliation(chat, generation, message_id, result);
                None
            }
        }
    }

    fn handle_session_event(
        &mut self,
        ticket: SessionTicket,
        event: StreamEvent,
    ) -> Option<SessionOutcome> {
        if !self.guard.admits(&ticket) {
            tracing::debug!(
                chat_id = %ticket.chat,
                session_id = ticket.session_id.0,
                generation = ticket.generation.0,
                "dropping stale stream event"
            );
            return None;
        }

        let (message_id, step) = {
            let session = self
                .active
                .as_mut()
                .filter(|session| session.ticket() == &ticket)?;
            (session.message_id().clone(), session.apply(event))
        };

        match step {
            SessionStep::Continue(patch) => {
                self.watchdog.arm();
                self.patch_message(&message_id, patch);
                None
            }
            SessionStep::Finished { patch, outcome } => Some(self.finish(patch, outcome)),
        }
    }

    fn handle_stall(&mut self) -> Option<SessionOutcome> {
        self.watchdog.disarm();

        let step = {
            let session = self.active.as_mut()?;
            tracing::warn!(
                chat_id = %session.ticket().chat,
                session_id = session.ticket().session_id.0,
                quiet_for = ?session.last_frame_at().elapsed(),
                frames = session.frames(),
                "stream stalled"
            );
            session.cancel();
            session.time_out()
        };

        match step {
            SessionStep::Finished { patch, outcome } => Some(self.finish(patch, outcome)),
            SessionStep::Continue(_) => None,
        }
    }

    fn finish(&mut self, patch: MessagePatch, outcome: SessionOutcome) -> SessionOutcome {
        let Some(session) = self.active.take() else {
            return outcome;
        };

        self.watchdog.disarm();
        let ticket = session.ticket().clone();
        let transition = match &outcome {
            SessionOutcome::Completed { .. } => StreamTransition::Complete(ticket.clone()),
            SessionOutcome::Failed(_) => StreamTransition::Fail(ticket.clone()),
            SessionOutcome::Cancelled => StreamTransition::Cancel(ticket.clone()),
        };
        if let Err(rejection) = self.guard.transition(transition) {
            tracing::warn!(?rejection, session_id = ticket.session_id.0, "terminal transition rejected");
        }
        self.patch_message(session.message_id(), patch);

        match &outcome {
            SessionOutcome::Completed { content } => {
                tracing::info!(
                    chat_id = %ticket.chat,
                    session_id = ticket.session_id.0,
                    frames = session.frames(),
                    chars = content.chars().count(),
                    elapsed = ?session.started_at().elapsed(),
                    "stream completed"
                );
            }
            SessionOutcome::Failed(failure) => {
                self.streaming_error = Some(failure.clone());
                if failure.error.kind.allows_reconciliation() {
                    self.schedule_reconciliation(&ticket, failure.message_id.clone());
                } else {
                    tracing::info!(
                        chat_id = %ticket.chat,
                        kind = ?failure.error.kind,
                        "reconciliation suppressed"
                    );
                }
            }
            SessionOutcome::Cancelled => {
                tracing::info!(chat_id = %ticket.chat, session_id = ticket.session_id.0, "stream aborted");
            }
        }

        outcome
    }

    fn schedule_reconciliation(&mut self, ticket: &SessionTicket, message_id: MessageId) {
        self.pending_reconciliations += 1;

        let history = Arc::clone(&self.history);
        let inbox = self.inbox_tx.clone();
        let delay = self.options.reconcile_delay;
        let chat = ticket.chat.clone();
        let generation = ticket.generation;
        let span = tracing::info_span!("reconcile", chat_id = %chat, message_id = %message_id);

        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                let result = history.fetch_messages(chat.as_str()).await;
                let _ = inbox.send(Inbound::Reconciled {
                    chat,
                    generation,
                    message_id,
                    result,
                });
            }
            .instrument(span),
        );
    }

    fn apply_reconciliation(
        &mut self,
        chat: ChatIdentity,
        generation: Generation,
        message_id: MessageId,
        result: BackendResult<Vec<HistoryRow>>,
    ) {
        self.pending_reconciliations = self.pending_reconciliations.saturating_sub(1);

        if !self.guard.admits_chat(&chat, generation) {
            tracing::debug!(chat_id = %chat, "dropping stale reconciliation");
            return;
        }

        let rows = match result {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(chat_id = %chat, error = %error, "reconciliation fetch failed");
                return;
            }
        };

        // A retry may already be writing into the message, or it may be gone.
        let still_failed = self
            .store
            .get(&message_id)
            .is_some_and(|message| message.is_error && !message.is_streaming);
        if !still_failed {
            tracing::debug!(chat_id = %chat, message_id = %message_id, "message changed since failure");
            return;
        }

        let prompt = self
            .store
            .prompt_for(&message_id)
            .map(|message| message.text.as_str());
        let Some(patch) = reconcile_patch(&rows, &message_id, prompt) else {
            tracing::info!(chat_id = %chat, message_id = %message_id, "history has no answer yet");
            return;
        };

        self.patch_message(&message_id, patch);
        if self
            .streaming_error
            .as_ref()
            .is_some_and(|failure| failure.message_id == message_id)
        {
            self.streaming_error = None;
        }
        tracing::info!(chat_id = %chat, message_id = %message_id, "message reconciled from history");
    }

    fn patch_message(&mut self, id: &MessageId, patch: MessagePatch) {
        if let Err(error) = self.store.patch(id, patch) {
            tracing::warn!(error = %error, "dropping message patch");
        }
    }
}

/// Cloneable front end of a spawned [`ChatController`].
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::Sender<ChatCommand>,
    snapshots: watch::Receiver<ChatSnapshot>,
}

impl ChatHandle {
    pub async fn command(&self, command: ChatCommand) -> ChatResult<()> {
        self.commands
            .send(command)
            .await
            .ok()
            .context(ControllerClosedSnafu { stage: "command" })
    }

    pub async fn send(&self, request: SendRequest) -> ChatResult<SendReceipt> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(ChatCommand::Send {
            request,
            reply: Some(reply_tx),
        })
        .await?;

        reply_rx
            .await
            .ok()
            .context(ControllerClosedSnafu { stage: "send-reply" })?
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.clone()
    }
}
