//! Action tokens and the registry of in-flight operations
//!
//! Every connect, disconnect, publish, subscribe and unsubscribe returns an
//! [`ActionToken`]. The engine task completes it exactly once; callers can poll
//! it, await it, or park an OS thread on it. Tokens are cheap handles around a
//! shared completion cell, so cloning one never duplicates the operation.

use crate::error::{MqttError, MqttResult};
use crate::protocol::{Message, QoS};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

pub type TokenId = u64;

/// Operation a token tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Connect,
    Disconnect,
    Publish,
    Subscribe,
    Unsubscribe,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Connect => "connect",
            TokenKind::Disconnect => "disconnect",
            TokenKind::Publish => "publish",
            TokenKind::Subscribe => "subscribe",
            TokenKind::Unsubscribe => "unsubscribe",
        };
        f.write_str(name)
    }
}

/// Successful outcome of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Connected { session_present: bool },
    Disconnected,
    Published,
    Subscribed { granted: QoS },
    Unsubscribed { existed: bool },
}

/// Completion state of a token
#[derive(Debug, Clone, PartialEq)]
pub enum TokenState {
    Pending,
    Complete(ActionResult),
    Failed(MqttError),
}

impl TokenState {
    pub fn is_pending(&self) -> bool {
        matches!(self, TokenState::Pending)
    }
}

/// Per-operation completion listener.
///
/// Listeners run on the engine task, one at a time and in packet-processing
/// order. A listener that blocks stalls the whole client.
pub trait ActionListener: Send + Sync {
    fn on_success(&self, token: &ActionToken);
    fn on_failure(&self, token: &ActionToken, cause: &MqttError);
}

struct TokenCell {
    id: TokenId,
    kind: TokenKind,
    message: Option<Message>,
    listener: Option<Arc<dyn ActionListener>>,
    packet_id: Mutex<Option<u16>>,
    state: Mutex<TokenState>,
    parked: Condvar,
    notify: Notify,
}

/// Handle to one in-flight operation
#[derive(Clone)]
pub struct ActionToken {
    cell: Arc<TokenCell>,
}

impl ActionToken {
    fn new(
        id: TokenId,
        kind: TokenKind,
        message: Option<Message>,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> Self {
        Self {
            cell: Arc::new(TokenCell {
                id,
                kind,
                message,
                listener,
                packet_id: Mutex::new(None),
                state: Mutex::new(TokenState::Pending),
                parked: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> TokenId {
        self.cell.id
    }

    pub fn kind(&self) -> TokenKind {
        self.cell.kind
    }

    /// The message of a publish token
    pub fn message(&self) -> Option<&Message> {
        self.cell.message.as_ref()
    }

    /// Packet id assigned to a QoS 1/2 publish, subscribe or unsubscribe
    pub fn packet_id(&self) -> Option<u16> {
        self.cell
            .packet_id
            .lock()
            .map(|id| *id)
            .unwrap_or_default()
    }

    pub(crate) fn set_packet_id(&self, packet_id: Option<u16>) {
        if let Ok(mut slot) = self.cell.packet_id.lock() {
            *slot = packet_id;
        }
    }

    pub(crate) fn listener(&self) -> Option<&Arc<dyn ActionListener>> {
        self.cell.listener.as_ref()
    }

    pub fn state(&self) -> TokenState {
        self.lock_state().clone()
    }

    pub fn is_complete(&self) -> bool {
        !self.lock_state().is_pending()
    }

    /// The error of a failed token
    pub fn error(&self) -> Option<MqttError> {
        match &*self.lock_state() {
            TokenState::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        // State is only ever replaced wholesale, a poisoned guard still holds a valid value
        self.cell
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn outcome(state: &TokenState) -> Option<MqttResult<ActionResult>> {
        match state {
            TokenState::Pending => None,
            TokenState::Complete(result) => Some(Ok(result.clone())),
            TokenState::Failed(error) => Some(Err(error.clone())),
        }
    }

    /// Move the token out of Pending. Returns false if it had already completed.
    pub(crate) fn transition(&self, next: TokenState) -> bool {
        let mut state = self.lock_state();
        if !state.is_pending() {
            return false;
        }
        *state = next;
        drop(state);
        self.cell.parked.notify_all();
        self.cell.notify.notify_waiters();
        true
    }

    /// Wait for the operation to finish.
    ///
    /// With a timeout, an expired wait returns `Err(Timeout)` and leaves the
    /// token pending: the operation itself still completes or fails later.
    pub async fn wait_for_completion(&self, timeout: Option<Duration>) -> MqttResult<ActionResult> {
        let wait = async {
            loop {
                let notified = self.cell.notify.notified();
                let outcome = Self::outcome(&self.lock_state());
                if let Some(outcome) = outcome {
                    return outcome;
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                MqttError::timeout(format!(
                    "{} token {} still pending after {:?}",
                    self.kind(),
                    self.id(),
                    limit
                ))
            })?,
            None => wait.await,
        }
    }

    /// Blocking variant of [`wait_for_completion`](Self::wait_for_completion).
    /// Parks the calling thread; never call it from inside an async task.
    pub fn wait_for_completion_blocking(&self, timeout: Option<Duration>) -> MqttResult<ActionResult> {
        let state = self.lock_state();
        let state = match timeout {
            Some(limit) => {
                let (state, result) = self
                    .cell
                    .parked
                    .wait_timeout_while(state, limit, |s| s.is_pending())
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                if result.timed_out() && state.is_pending() {
                    return Err(MqttError::timeout(format!(
                        "{} token {} still pending after {:?}",
                        self.kind(),
                        self.id(),
                        limit
                    )));
                }
                state
            }
            None => self
                .cell
                .parked
                .wait_while(state, |s| s.is_pending())
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        };
        Self::outcome(&state).unwrap_or_else(|| Err(MqttError::timeout("token still pending")))
    }
}

impl fmt::Debug for ActionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionToken")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("packet_id", &self.packet_id())
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of every pending token of one client.
///
/// Tokens leave the registry on completion. Callers only ever get snapshots.
#[derive(Default)]
pub struct TokenRegistry {
    next_id: AtomicU64,
    tokens: Mutex<HashMap<TokenId, ActionToken>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<TokenId, ActionToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(
        &self,
        kind: TokenKind,
        message: Option<Message>,
        listener: Option<Arc<dyn ActionListener>>,
    ) -> ActionToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = ActionToken::new(id, kind, message, listener);
        self.map().insert(id, token.clone());
        token
    }

    pub fn get(&self, id: TokenId) -> Option<ActionToken> {
        self.map().get(&id).cloned()
    }

    /// Drop a token that was never handed out
    pub(crate) fn forget(&self, id: TokenId) {
        self.map().remove(&id);
    }

    /// Complete a pending token. Returns it so its listener can be notified.
    pub fn complete(&self, id: TokenId, result: ActionResult) -> Option<ActionToken> {
        self.finish(id, TokenState::Complete(result))
    }

    /// Fail a pending token. Returns it so its listener can be notified.
    pub fn fail(&self, id: TokenId, error: MqttError) -> Option<ActionToken> {
        self.finish(id, TokenState::Failed(error))
    }

    fn finish(&self, id: TokenId, next: TokenState) -> Option<ActionToken> {
        let Some(token) = self.map().remove(&id) else {
            warn!(token_id = id, outcome = ?next, "Ignoring completion of unknown or finished token");
            return None;
        };
        if token.transition(next.clone()) {
            Some(token)
        } else {
            warn!(token_id = id, outcome = ?next, "Token completed twice, keeping first outcome");
            None
        }
    }

    /// Snapshot of all pending tokens, oldest first
    pub fn pending_tokens(&self) -> Vec<ActionToken> {
        let mut tokens: Vec<ActionToken> = self.map().values().cloned().collect();
        tokens.sort_by_key(ActionToken::id);
        tokens
    }

    /// Snapshot of pending publish tokens, oldest first
    pub fn pending_delivery_tokens(&self) -> Vec<ActionToken> {
        self.pending_tokens()
            .into_iter()
            .filter(|token| token.kind() == TokenKind::Publish)
            .collect()
    }

    pub fn pending_of_kind(&self, kind: TokenKind) -> Vec<ActionToken> {
        self.pending_tokens()
            .into_iter()
            .filter(|token| token.kind() == kind)
            .collect()
    }

    /// Remove every pending token, used when the engine shuts down
    pub(crate) fn drain(&self) -> Vec<ActionToken> {
        let mut tokens: Vec<ActionToken> = self.map().drain().map(|(_, token)| token).collect();
        tokens.sort_by_key(ActionToken::id);
        tokens
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
