//! Awaitable answers collecting the results of dispatched commands.
//!
//! An [`Answer`] correlates one dispatched [`Command`] with the results
//! produced for it — one per handler or peer that accepted the command.
//! The [`AnswerQueue`] is the synchronization point: a worker parks in
//! [`AnswerQueue::wait`] and wakes whenever any registered answer is
//! marked updated.
//!
//! All result storage lives inside the `Answer` behind a single lock, and
//! mutation is funneled through `Answer` methods. Lock scopes are short
//! and never held across an await.
//!
//! [`Command`]: crate::command::Command

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::types::DeviceId;

/// Status of one [`CommandResult`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultStatus {
    /// No outcome yet.
    #[default]
    Pending,
    /// The command succeeded.
    Success,
    /// The command failed.
    Failed,
}

impl ResultStatus {
    /// True once the status can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Integer carried in the `result_status` wire field.
    #[must_use]
    pub const fn as_wire(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Success => 1,
            Self::Failed => 2,
        }
    }

    /// Parses the `result_status` wire field.
    #[must_use]
    pub const fn from_wire(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::Pending),
            1 => Some(Self::Success),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Extended outcome of a set-value command.
///
/// The `Gw*` states are observed by the gateway itself; the `Device*`
/// states are reported by the remote peer. They are distinct because a
/// gateway-level timeout can fire before any device-level status arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetValueStatus {
    /// Gateway confirmed the set succeeded.
    GwSuccess,
    /// Gateway concluded the set failed.
    GwFailed,
    /// Gateway gave up waiting for a device-reported outcome.
    GwTimeout,
    /// Peer reported the device accepted the value.
    DeviceSuccess,
    /// Peer reported the device rejected the value.
    DeviceFailed,
    /// Peer reported the device timed out.
    DeviceTimeout,
}

impl SetValueStatus {
    /// Integer carried in the `extended_set_status` wire field.
    #[must_use]
    pub const fn as_wire(self) -> i64 {
        match self {
            Self::GwSuccess => 0,
            Self::GwFailed => 1,
            Self::GwTimeout => 2,
            Self::DeviceSuccess => 3,
            Self::DeviceFailed => 4,
            Self::DeviceTimeout => 5,
        }
    }

    /// Parses the `extended_set_status` wire field.
    #[must_use]
    pub const fn from_wire(raw: i64) -> Option<Self> {
        match raw {
            0 => Some(Self::GwSuccess),
            1 => Some(Self::GwFailed),
            2 => Some(Self::GwTimeout),
            3 => Some(Self::DeviceSuccess),
            4 => Some(Self::DeviceFailed),
            5 => Some(Self::DeviceTimeout),
            _ => None,
        }
    }
}

/// Payload carried by a [`CommandResult`], depending on the command kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ResultData {
    /// No payload beyond the status.
    #[default]
    None,
    /// Extended outcome of a set-value command.
    SetValue {
        /// Device- or gateway-observed outcome, once known.
        extended: Option<SetValueStatus>,
    },
    /// Last stored value of a module.
    LastValue {
        /// The value, if one exists.
        value: Option<f64>,
    },
    /// List of paired devices.
    DeviceList {
        /// Devices paired under the requested prefix.
        devices: Vec<DeviceId>,
    },
}

/// One outcome of one command, owned by an [`Answer`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    /// Current status.
    pub status: ResultStatus,
    /// Kind-specific payload.
    pub data: ResultData,
}

impl CommandResult {
    /// A pending result with no payload.
    #[must_use]
    pub const fn pending() -> Self {
        Self {
            status: ResultStatus::Pending,
            data: ResultData::None,
        }
    }

    /// A pending set-value result with no extended status yet.
    #[must_use]
    pub const fn pending_set_value() -> Self {
        Self {
            status: ResultStatus::Pending,
            data: ResultData::SetValue { extended: None },
        }
    }

    /// True once the status can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Extended set-value outcome, if this is a set-value result.
    #[must_use]
    pub const fn extended_status(&self) -> Option<SetValueStatus> {
        match self.data {
            ResultData::SetValue { extended } => extended,
            _ => None,
        }
    }
}

struct AnswerState {
    results: Vec<CommandResult>,
    commands: usize,
    dirty: bool,
}

/// Correlates one dispatched command with the results produced for it.
///
/// Created through [`AnswerQueue::answer`], which registers the answer
/// with the queue for its whole lifetime. Shared ownership (`Arc`) keeps
/// the answer alive while the caller and any broker correlation table
/// still reference it.
pub struct Answer {
    shared: Arc<QueueShared>,
    state: Mutex<AnswerState>,
}

impl Answer {
    fn new(shared: Arc<QueueShared>) -> Self {
        Self {
            shared,
            state: Mutex::new(AnswerState {
                results: Vec::new(),
                commands: 0,
                dirty: false,
            }),
        }
    }

    /// Records that one more handler (or peer) accepted the command.
    ///
    /// The first call changes emptiness and implicitly marks the answer
    /// updated.
    pub fn add_command(&self) {
        let was_empty = {
            let mut state = self.lock();
            let was_empty = state.commands == 0;
            state.commands += 1;
            if was_empty {
                state.dirty = true;
            }
            was_empty
        };
        if was_empty {
            self.shared.notify.notify_waiters();
        }
    }

    /// Appends a result. Does not mark the answer updated.
    ///
    /// Returns the index of the new result, used later to update it.
    pub fn add_result(&self, result: CommandResult) -> usize {
        let mut state = self.lock();
        debug_assert!(
            state.results.len() < state.commands,
            "more results than accepted commands"
        );
        state.results.push(result);
        state.results.len() - 1
    }

    /// Mutates the result at `index` under the answer's lock.
    ///
    /// Returns false if no such result exists. Does not mark the answer
    /// updated; call [`Answer::notify_updated`] once the change should be
    /// observed.
    pub fn update_result<F>(&self, index: usize, f: F) -> bool
    where
        F: FnOnce(&mut CommandResult),
    {
        let mut state = self.lock();
        match state.results.get_mut(index) {
            Some(result) => {
                f(result);
                true
            }
            None => false,
        }
    }

    /// Marks the answer updated and wakes queue waiters.
    pub fn notify_updated(&self) {
        self.lock().dirty = true;
        self.shared.notify.notify_waiters();
    }

    /// True if a result changed since the dirty state was last consumed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// True while at least one owned result is non-terminal.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.lock().results.iter().any(|r| !r.is_terminal())
    }

    /// True iff no handler accepted the command (yet).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().commands == 0
    }

    /// Number of owned results.
    #[must_use]
    pub fn results_count(&self) -> usize {
        self.lock().results.len()
    }

    /// Number of handlers/peers that accepted the command.
    #[must_use]
    pub fn commands_count(&self) -> usize {
        self.lock().commands
    }

    /// Snapshot of the result at `index`, in insertion order.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<CommandResult> {
        self.lock().results.get(index).cloned()
    }

    /// Snapshot of all owned results, in insertion order.
    #[must_use]
    pub fn results(&self) -> Vec<CommandResult> {
        self.lock().results.clone()
    }

    /// Clears and returns the dirty flag.
    fn take_dirty(&self) -> bool {
        let mut state = self.lock();
        std::mem::take(&mut state.dirty)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AnswerState> {
        // Lock scopes are short and no user code runs under the lock.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Answer")
            .field("commands", &state.commands)
            .field("results", &state.results.len())
            .field("dirty", &state.dirty)
            .finish()
    }
}

struct QueueShared {
    answers: Mutex<Vec<Arc<Answer>>>,
    notify: Notify,
}

/// Collection of in-flight [`Answer`]s plus their wakeup primitive.
///
/// Cloning the queue is cheap; clones share the same answer set.
#[derive(Clone)]
pub struct AnswerQueue {
    shared: Arc<QueueShared>,
}

impl AnswerQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                answers: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Creates a new answer registered with this queue.
    #[must_use]
    pub fn answer(&self) -> Arc<Answer> {
        let answer = Arc::new(Answer::new(Arc::clone(&self.shared)));
        self.answers_lock().push(Arc::clone(&answer));
        answer
    }

    /// Waits up to `timeout` for answers to become dirty.
    ///
    /// Returns the set of answers whose state changed since the last
    /// drain, clearing their dirty flags atomically. Multiple independent
    /// waiters are safe: each drains only the dirty set visible when it
    /// wakes; unconsumed dirty answers stay dirty for the next caller.
    pub async fn wait(&self, timeout: Duration) -> Vec<Arc<Answer>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register for the wakeup before checking, so a notify that
            // races with the drain is not lost.
            let notified = self.shared.notify.notified();

            let dirty = self.drain_dirty();
            if !dirty.is_empty() {
                return dirty;
            }

            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }

            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return self.drain_dirty();
            }
        }
    }

    /// Removes an answer whose lifecycle has ended.
    pub fn remove(&self, answer: &Arc<Answer>) {
        self.answers_lock().retain(|a| !Arc::ptr_eq(a, answer));
    }

    /// Number of registered answers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.answers_lock().len()
    }

    /// True if no answer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.answers_lock().is_empty()
    }

    fn drain_dirty(&self) -> Vec<Arc<Answer>> {
        // Queue lock is always taken before any per-answer lock, never
        // the other way around.
        self.answers_lock()
            .iter()
            .filter(|a| a.take_dirty())
            .cloned()
            .collect()
    }

    fn answers_lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Answer>>> {
        self.shared
            .answers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for AnswerQueue {
    fn default() -> Self {
        Self::new()
    }
}
