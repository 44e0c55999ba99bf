//! Chat state core: the message store, the stream session lifecycle and the
//! controller that owns them.
#![deny(unsafe_code)]

mod controller;
mod error;
mod events;
pub mod guard;
pub mod history;
mod ids;
mod message;
mod retry;
mod session;
pub mod settings;
mod store;
mod watchdog;

pub use controller::{
    COMMAND_BUFFER, ChatController, ChatHandle, ControllerOptions, DEFAULT_RECONCILE_DELAY,
};
pub use error::{ChatError, ChatResult};
pub use events::{ChatCommand, ChatSnapshot, SendReceipt, SendRequest};
pub use guard::{SessionIdentityGuard, SessionTicket, StreamState};
pub use ids::{ChatIdentity, Generation, MessageId, StreamSessionId};
pub use message::{
    Attachment, ERROR_SEPARATOR, ErrorKind, GENERIC_ERROR_TEXT, Message, MessageError,
    MessagePatch, Remediation, Sender, StreamFailure, TIMEOUT_ERROR_TEXT, TRANSPORT_ERROR_TEXT,
    error_text,
};
pub use retry::{RetryCoordinator, RetryMode, RetryPlan, RetryRecord};
pub use session::{SessionOutcome, SessionStep, StreamSession};
pub use settings::{ChatSettings, SettingsError, SettingsStore};
pub use store::{MessageStore, StoreError, StoreResult};
pub use watchdog::{DEFAULT_STALL_TIMEOUT, StallWatchdog};
