//! Transactional undo/redo built from recorded commands.
//!
//! Mutations are recorded as [`Command`]s into the [`Operation`] currently
//! open on an [`UndoStack`]. A committed operation is undone and redone as a
//! single unit.
//!
//! # State Machine
//!
//! ```text
//!            start_operation
//!   IDLE ───────────────────────▶ RECORDING
//!    ▲  ◀─────────────────────────    │
//!    │   commit_operation (push)      │ add_command
//!    │   cancel_operation (revert)    ▼
//!    │
//!    └── undo / redo (IDLE only, replay one operation)
//! ```
//!
//! While a stack is recording it is bound as the thread's *current* stack,
//! so code deep in a call chain can contribute with [`UndoStack::record`]
//! without holding a reference to the stack. Undo and redo refuse to run
//! while any stack on the thread is recording.
//!
//! # Example
//!
//! ```
//! use statecraft_core::{Property, UndoStack};
//!
//! let stack = UndoStack::new();
//! let width = Property::new(0);
//! width.track_undo(&stack);
//!
//! stack.start_operation().unwrap();
//! width.set(5);
//! stack.commit_operation().unwrap();
//!
//! stack.undo().unwrap();
//! assert_eq!(width.get(), 0);
//! stack.redo().unwrap();
//! assert_eq!(width.get(), 5);
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::UndoError;
use crate::list::{ListChange, ListProperty};
use crate::listener::ListenerId;
use crate::logging::PerfSpan;
use crate::property::{Property, ReadOnlyProperty};
use crate::thread_check::ThreadAffinity;

thread_local! {
    /// Stacks currently recording on this thread, most recently started last.
    static ACTIVE_STACKS: RefCell<Vec<Weak<UndoStackInner>>> = const { RefCell::new(Vec::new()) };
}

fn bind_current(inner: &Arc<UndoStackInner>) {
    ACTIVE_STACKS.with(|stacks| {
        let mut stacks = stacks.borrow_mut();
        stacks.retain(|stack| stack.strong_count() > 0);
        stacks.push(Arc::downgrade(inner));
    });
}

fn unbind_current(inner: &Arc<UndoStackInner>) {
    let target = Arc::downgrade(inner);
    ACTIVE_STACKS.with(|stacks| {
        stacks
            .borrow_mut()
            .retain(|stack| stack.strong_count() > 0 && !Weak::ptr_eq(stack, &target));
    });
}

fn any_recording() -> bool {
    ACTIVE_STACKS.with(|stacks| stacks.borrow().iter().any(|stack| stack.strong_count() > 0))
}

// -----------------------------------------------------------------------------
// Commands
// -----------------------------------------------------------------------------

/// A reversible unit of change.
///
/// Implement this for commands that carry their own state. Simple commands
/// can be built from a closure pair with [`Command::new`] instead.
pub trait UndoableCommand: Send + Sync {
    /// Re-apply the change.
    fn perform(&self);

    /// Reverse the change.
    fn undo(&self);

    /// Short human-readable description.
    fn description(&self) -> &str {
        "command"
    }
}

type Action = Box<dyn Fn() + Send + Sync>;

enum CommandKind {
    Actions {
        description: String,
        perform: Action,
        undo: Action,
    },
    Custom(Box<dyn UndoableCommand>),
}

/// A recorded, reversible change.
///
/// Commands are immutable once built.
pub struct Command {
    kind: CommandKind,
}

impl Command {
    /// Build a command from a forward and an inverse action.
    pub fn new<P, U>(description: impl Into<String>, perform: P, undo: U) -> Self
    where
        P: Fn() + Send + Sync + 'static,
        U: Fn() + Send + Sync + 'static,
    {
        Self {
            kind: CommandKind::Actions {
                description: description.into(),
                perform: Box::new(perform),
                undo: Box::new(undo),
            },
        }
    }

    /// Wrap a custom [`UndoableCommand`].
    pub fn custom<C>(command: C) -> Self
    where
        C: UndoableCommand + 'static,
    {
        Self {
            kind: CommandKind::Custom(Box::new(command)),
        }
    }

    /// A property change from `old` to `new`.
    pub fn set_value<T>(property: &Property<T>, old: T, new: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let forward = property.clone();
        let backward = property.clone();
        Self::new(
            "set value",
            move || {
                forward.set(new.clone());
            },
            move || {
                backward.set(old.clone());
            },
        )
    }

    /// `element` was inserted into `list` at `index`.
    pub fn list_added<E>(list: &ListProperty<E>, index: usize, element: E) -> Self
    where
        E: Clone + Send + Sync + 'static,
    {
        let forward = list.clone();
        let backward = list.clone();
        Self::new(
            "list insert",
            move || {
                if let Err(err) = forward.insert(index, element.clone()) {
                    tracing::warn!(target: "statecraft_core::undo", %err, "list insert replay skipped");
                }
            },
            move || {
                if let Err(err) = backward.remove(index) {
                    tracing::warn!(target: "statecraft_core::undo", %err, "list insert revert skipped");
                }
            },
        )
    }

    /// `element` was removed from `list` at `index`.
    pub fn list_removed<E>(list: &ListProperty<E>, index: usize, element: E) -> Self
    where
        E: Clone + Send + Sync + 'static,
    {
        let forward = list.clone();
        let backward = list.clone();
        Self::new(
            "list remove",
            move || {
                if let Err(err) = forward.remove(index) {
                    tracing::warn!(target: "statecraft_core::undo", %err, "list remove replay skipped");
                }
            },
            move || {
                if let Err(err) = backward.insert(index, element.clone()) {
                    tracing::warn!(target: "statecraft_core::undo", %err, "list remove revert skipped");
                }
            },
        )
    }

    /// The command's description.
    pub fn description(&self) -> &str {
        match &self.kind {
            CommandKind::Actions { description, .. } => description,
            CommandKind::Custom(command) => command.description(),
        }
    }

    /// Re-apply the change.
    pub fn perform(&self) {
        match &self.kind {
            CommandKind::Actions { perform, .. } => perform(),
            CommandKind::Custom(command) => command.perform(),
        }
    }

    /// Reverse the change.
    pub fn undo(&self) {
        match &self.kind {
            CommandKind::Actions { undo, .. } => undo(),
            CommandKind::Custom(command) => command.undo(),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("description", &self.description())
            .finish()
    }
}

/// An ordered batch of commands undone and redone as one unit.
#[derive(Debug, Default)]
pub struct Operation {
    label: Option<String>,
    commands: Vec<Command>,
}

impl Operation {
    /// Create an operation from already-recorded commands.
    pub fn new(label: Option<String>, commands: Vec<Command>) -> Self {
        Self { label, commands }
    }

    /// The label given when the operation was started.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if no commands were recorded.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Re-apply every command in recording order.
    pub fn perform(&self) {
        for command in &self.commands {
            command.perform();
        }
    }

    /// Reverse every command, last recorded first.
    pub fn undo(&self) {
        for command in self.commands.iter().rev() {
            command.undo();
        }
    }

    fn push(&mut self, command: Command) {
        self.commands.push(command);
    }
}

// -----------------------------------------------------------------------------
// Configuration
// -----------------------------------------------------------------------------

/// What a commit does to the redo history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RedoPolicy {
    /// Leave the redo history untouched; it is still reachable with `redo`.
    #[default]
    Retain,
    /// Discard the redo history, giving a strictly linear history.
    DiscardOnCommit,
}

/// Configuration for an [`UndoStack`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UndoConfig {
    /// What a commit does to the redo history.
    pub redo_policy: RedoPolicy,
    /// Maximum number of operations kept in the undo history. The oldest is
    /// dropped when exceeded. `None` keeps everything.
    pub max_history: Option<usize>,
}

impl UndoConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the redo policy.
    #[must_use]
    pub fn with_redo_policy(mut self, policy: RedoPolicy) -> Self {
        self.redo_policy = policy;
        self
    }

    /// Bound the undo history to `max` operations.
    #[must_use]
    pub fn with_max_history(mut self, max: usize) -> Self {
        self.max_history = Some(max);
        self
    }
}

// -----------------------------------------------------------------------------
// Undo stack
// -----------------------------------------------------------------------------

#[derive(Default)]
struct UndoState {
    undo_history: VecDeque<Operation>,
    redo_history: Vec<Operation>,
    current: Option<Operation>,
    replaying: bool,
}

struct UndoStackInner {
    config: UndoConfig,
    state: Mutex<UndoState>,
    undo_available: Property<bool>,
    redo_available: Property<bool>,
    affinity: ThreadAffinity,
}

/// Clears the replay flag when a replay ends, even by unwinding.
struct ReplayGuard<'a> {
    inner: &'a UndoStackInner,
}

impl<'a> ReplayGuard<'a> {
    fn new(inner: &'a UndoStackInner) -> Self {
        inner.state.lock().replaying = true;
        Self { inner }
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().replaying = false;
    }
}

/// Undo/redo history plus the operation being recorded.
///
/// `UndoStack` is a handle; clones share the same history. An `UndoStack`
/// must be driven from the thread that created it, since the current-stack
/// binding is thread-local. Debug builds assert this.
#[derive(Clone)]
pub struct UndoStack {
    inner: Arc<UndoStackInner>,
}

impl UndoStack {
    /// Create a stack with the default configuration.
    pub fn new() -> Self {
        Self::with_config(UndoConfig::default())
    }

    /// Create a stack with the given configuration.
    pub fn with_config(config: UndoConfig) -> Self {
        Self {
            inner: Arc::new(UndoStackInner {
                config,
                state: Mutex::new(UndoState::default()),
                undo_available: Property::new(false),
                redo_available: Property::new(false),
                affinity: ThreadAffinity::current(),
            }),
        }
    }

    /// The stack recording on this thread, if any.
    ///
    /// When several stacks record at once, the most recently started wins.
    pub fn current() -> Option<Self> {
        ACTIVE_STACKS.with(|stacks| {
            stacks
                .borrow()
                .iter()
                .rev()
                .find_map(Weak::upgrade)
                .map(|inner| Self { inner })
        })
    }

    /// Record `command` into the current stack.
    ///
    /// Returns `false` if no stack is recording on this thread.
    pub fn record(command: Command) -> bool {
        match Self::current() {
            Some(stack) => stack.add_command(command).is_ok(),
            None => false,
        }
    }

    /// The configuration this stack was created with.
    pub fn config(&self) -> &UndoConfig {
        &self.inner.config
    }

    /// Start recording an operation.
    pub fn start_operation(&self) -> Result<(), UndoError> {
        self.start(None)
    }

    /// Start recording an operation with a label shown by
    /// [`undo_label`](Self::undo_label) and [`redo_label`](Self::redo_label).
    pub fn start_labeled_operation(&self, label: impl Into<String>) -> Result<(), UndoError> {
        self.start(Some(label.into()))
    }

    fn start(&self, label: Option<String>) -> Result<(), UndoError> {
        self.check_thread();
        {
            let mut state = self.inner.state.lock();
            if state.replaying {
                return Err(violation(UndoError::ReplayInProgress, "start_operation"));
            }
            if state.current.is_some() {
                return Err(violation(UndoError::OperationInProgress, "start_operation"));
            }
            state.current = Some(Operation::new(label.clone(), Vec::new()));
        }
        bind_current(&self.inner);
        tracing::debug!(target: "statecraft_core::undo", label = ?label, "operation started");
        Ok(())
    }

    /// Append a command to the operation being recorded.
    pub fn add_command(&self, command: Command) -> Result<(), UndoError> {
        self.check_thread();
        let mut state = self.inner.state.lock();
        match state.current.as_mut() {
            Some(operation) => {
                tracing::trace!(
                    target: "statecraft_core::undo",
                    command = command.description(),
                    "command recorded"
                );
                operation.push(command);
                Ok(())
            }
            None => Err(violation(UndoError::NoActiveOperation, "add_command")),
        }
    }

    /// Record `command` only if this stack is recording.
    fn record_if_recording(&self, command: Command) -> bool {
        let mut state = self.inner.state.lock();
        match state.current.as_mut() {
            Some(operation) => {
                operation.push(command);
                true
            }
            None => false,
        }
    }

    /// Finish the operation being recorded and push it onto the undo
    /// history.
    pub fn commit_operation(&self) -> Result<(), UndoError> {
        self.check_thread();
        let (commands, dropped) = {
            let mut state = self.inner.state.lock();
            let Some(operation) = state.current.take() else {
                return Err(violation(UndoError::NoActiveOperation, "commit_operation"));
            };
            if self.inner.config.redo_policy == RedoPolicy::DiscardOnCommit {
                state.redo_history.clear();
            }
            let commands = operation.len();
            state.undo_history.push_back(operation);

            let mut dropped = 0;
            if let Some(max) = self.inner.config.max_history {
                while state.undo_history.len() > max {
                    state.undo_history.pop_front();
                    dropped += 1;
                }
            }
            (commands, dropped)
        };
        unbind_current(&self.inner);
        tracing::debug!(target: "statecraft_core::undo", commands, dropped, "operation committed");
        self.sync_availability();
        Ok(())
    }

    /// Abandon the operation being recorded, reverting its commands in
    /// reverse order.
    ///
    /// The stack is idle before the commands are reverted, so the reverts
    /// are not recorded.
    pub fn cancel_operation(&self) -> Result<(), UndoError> {
        self.check_thread();
        let operation = self.inner.state.lock().current.take();
        let Some(operation) = operation else {
            return Err(violation(UndoError::NoActiveOperation, "cancel_operation"));
        };
        unbind_current(&self.inner);
        tracing::debug!(
            target: "statecraft_core::undo",
            commands = operation.len(),
            "operation canceled"
        );

        let _replay = ReplayGuard::new(&self.inner);
        operation.undo();
        Ok(())
    }

    /// Undo the most recent operation.
    ///
    /// Returns `Ok(false)` if there was nothing to undo.
    pub fn undo(&self) -> Result<bool, UndoError> {
        self.check_thread();
        let operation = {
            let mut state = self.inner.state.lock();
            self.check_replay_allowed(&state, "undo")?;
            match state.undo_history.pop_back() {
                Some(operation) => operation,
                None => return Ok(false),
            }
        };

        tracing::debug!(target: "statecraft_core::undo", label = ?operation.label(), "undo");
        {
            let _replay = ReplayGuard::new(&self.inner);
            let _span = PerfSpan::new("undo");
            operation.undo();
        }

        self.inner.state.lock().redo_history.push(operation);
        self.sync_availability();
        Ok(true)
    }

    /// Redo the most recently undone operation.
    ///
    /// Returns `Ok(false)` if there was nothing to redo.
    pub fn redo(&self) -> Result<bool, UndoError> {
        self.check_thread();
        let operation = {
            let mut state = self.inner.state.lock();
            self.check_replay_allowed(&state, "redo")?;
            match state.redo_history.pop() {
                Some(operation) => operation,
                None => return Ok(false),
            }
        };

        tracing::debug!(target: "statecraft_core::undo", label = ?operation.label(), "redo");
        {
            let _replay = ReplayGuard::new(&self.inner);
            let _span = PerfSpan::new("redo");
            operation.perform();
        }

        self.inner.state.lock().undo_history.push_back(operation);
        self.sync_availability();
        Ok(true)
    }

    fn check_thread(&self) {
        self.inner
            .affinity
            .debug_assert_same_thread_with_msg("UndoStack used off the thread that created it");
    }

    fn check_replay_allowed(&self, state: &UndoState, action: &'static str) -> Result<(), UndoError> {
        if state.replaying {
            return Err(violation(UndoError::ReplayInProgress, action));
        }
        if state.current.is_some() || any_recording() {
            return Err(violation(UndoError::OperationActive, action));
        }
        Ok(())
    }

    /// Run `f` inside an operation: commit if it returns `Ok`, cancel if it
    /// returns `Err`.
    pub fn run_operation<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce() -> Result<R, E>,
        E: From<UndoError>,
    {
        self.start_operation()?;
        match f() {
            Ok(value) => {
                self.commit_operation()?;
                Ok(value)
            }
            Err(err) => {
                self.cancel_operation()?;
                Err(err)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Check if an operation is being recorded.
    pub fn is_recording(&self) -> bool {
        self.inner.state.lock().current.is_some()
    }

    /// Check if there is an operation to undo.
    pub fn can_undo(&self) -> bool {
        !self.inner.state.lock().undo_history.is_empty()
    }

    /// Check if there is an operation to redo.
    pub fn can_redo(&self) -> bool {
        !self.inner.state.lock().redo_history.is_empty()
    }

    /// Number of operations in the undo history.
    pub fn undo_len(&self) -> usize {
        self.inner.state.lock().undo_history.len()
    }

    /// Number of operations in the redo history.
    pub fn redo_len(&self) -> usize {
        self.inner.state.lock().redo_history.len()
    }

    /// Label of the operation `undo` would revert.
    pub fn undo_label(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state.undo_history.back()?.label().map(str::to_owned)
    }

    /// Label of the operation `redo` would re-apply.
    pub fn redo_label(&self) -> Option<String> {
        let state = self.inner.state.lock();
        state.redo_history.last()?.label().map(str::to_owned)
    }

    /// Drop the undo and redo histories. The operation being recorded, if
    /// any, is kept.
    pub fn clear_history(&self) {
        {
            let mut state = self.inner.state.lock();
            state.undo_history.clear();
            state.redo_history.clear();
        }
        tracing::debug!(target: "statecraft_core::undo", "history cleared");
        self.sync_availability();
    }

    /// Observable that is `true` while there is something to undo.
    pub fn undo_available(&self) -> ReadOnlyProperty<bool> {
        self.inner.undo_available.read_only()
    }

    /// Observable that is `true` while there is something to redo.
    pub fn redo_available(&self) -> ReadOnlyProperty<bool> {
        self.inner.redo_available.read_only()
    }

    fn sync_availability(&self) {
        let (can_undo, can_redo) = {
            let state = self.inner.state.lock();
            (!state.undo_history.is_empty(), !state.redo_history.is_empty())
        };
        self.inner.undo_available.set(can_undo);
        self.inner.redo_available.set(can_redo);
    }

    /// Create a weak handle that does not keep the stack alive.
    pub fn downgrade(&self) -> WeakUndoStack {
        WeakUndoStack {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check whether two handles address the same stack.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn violation(error: UndoError, action: &'static str) -> UndoError {
    tracing::warn!(target: "statecraft_core::undo", action, %error, "undo protocol violation");
    error
}

impl Default for UndoStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UndoStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("UndoStack")
            .field("undo_len", &state.undo_history.len())
            .field("redo_len", &state.redo_history.len())
            .field("recording", &state.current.is_some())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// A non-owning handle to an [`UndoStack`].
#[derive(Clone)]
pub struct WeakUndoStack {
    inner: Weak<UndoStackInner>,
}

impl WeakUndoStack {
    /// Get a strong handle if the stack is still alive.
    pub fn upgrade(&self) -> Option<UndoStack> {
        self.inner.upgrade().map(|inner| UndoStack { inner })
    }
}

impl fmt::Debug for WeakUndoStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakUndoStack")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tracking
// -----------------------------------------------------------------------------

impl<T: Clone + Send + Sync + 'static> Property<T> {
    /// Record every change of this property into `stack` while it is
    /// recording.
    ///
    /// The listener holds the stack weakly. Remove it with
    /// [`remove_listener`](Self::remove_listener) to stop tracking.
    pub fn track_undo(&self, stack: &UndoStack) -> ListenerId {
        let stack = stack.downgrade();
        let property = self.downgrade();
        self.add_listener(move |_, old: &T, new: &T| {
            let (Some(stack), Some(property)) = (stack.upgrade(), property.upgrade()) else {
                return;
            };
            stack.record_if_recording(Command::set_value(&property, old.clone(), new.clone()));
        })
    }
}

impl<E: Clone + Send + Sync + 'static> ListProperty<E> {
    /// Record every element event of this list into `stack` while it is
    /// recording.
    ///
    /// The listener holds the stack weakly. Remove it with
    /// [`remove_listener`](Self::remove_listener) to stop tracking.
    pub fn track_undo(&self, stack: &UndoStack) -> ListenerId {
        let stack = stack.downgrade();
        let list = self.downgrade();
        self.add_listener(move |_, change: &ListChange<E>| {
            let (Some(stack), Some(list)) = (stack.upgrade(), list.upgrade()) else {
                return;
            };
            let command = match change {
                ListChange::Added { index, element } => {
                    Command::list_added(&list, *index, element.clone())
                }
                ListChange::Removed { index, element } => {
                    Command::list_removed(&list, *index, element.clone())
                }
            };
            stack.record_if_recording(command);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logged(log: &Log, name: &'static str) -> Command {
        let perform_log = log.clone();
        let undo_log = log.clone();
        Command::new(
            name,
            move || perform_log.lock().push(format!("perform {name}")),
            move || undo_log.lock().push(format!("undo {name}")),
        )
    }

    #[test]
    fn test_set_undo_redo() {
        let stack = UndoStack::new();
        let prop = Property::new(0);
        prop.track_undo(&stack);

        stack.start_operation().unwrap();
        prop.set(5);
        stack.commit_operation().unwrap();
        assert_eq!(prop.get(), 5);

        assert_eq!(stack.undo(), Ok(true));
        assert_eq!(prop.get(), 0);
        assert_eq!(stack.redo(), Ok(true));
        assert_eq!(prop.get(), 5);
    }

    #[test]
    fn test_commands_reverse_on_undo_forward_on_redo() {
        let stack = UndoStack::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        stack.start_operation().unwrap();
        for name in ["c1", "c2", "c3"] {
            stack.add_command(logged(&log, name)).unwrap();
        }
        stack.commit_operation().unwrap();

        stack.undo().unwrap();
        stack.redo().unwrap();
        assert_eq!(
            *log.lock(),
            vec![
                "undo c3", "undo c2", "undo c1", "perform c1", "perform c2", "perform c3"
            ]
        );
    }

    #[test]
    fn test_nested_start_rejected() {
        let stack = UndoStack::new();
        stack.start_operation().unwrap();
        assert_eq!(stack.start_operation(), Err(UndoError::OperationInProgress));
        assert!(stack.is_recording());
    }

    #[test]
    fn test_undo_while_recording_rejected() {
        let stack = UndoStack::new();
        stack.start_operation().unwrap();
        assert_eq!(stack.undo(), Err(UndoError::OperationActive));
        assert_eq!(stack.redo(), Err(UndoError::OperationActive));
    }

    #[test]
    fn test_undo_refused_while_other_stack_records() {
        let stack = UndoStack::new();
        let other = UndoStack::new();

        stack.start_operation().unwrap();
        stack.add_command(Command::new("noop", || {}, || {})).unwrap();
        stack.commit_operation().unwrap();

        other.start_operation().unwrap();
        assert_eq!(stack.undo(), Err(UndoError::OperationActive));

        other.commit_operation().unwrap();
        assert_eq!(stack.undo(), Ok(true));
    }

    #[test]
    fn test_calls_without_operation() {
        let stack = UndoStack::new();
        assert_eq!(
            stack.add_command(Command::new("noop", || {}, || {})),
            Err(UndoError::NoActiveOperation)
        );
        assert_eq!(stack.commit_operation(), Err(UndoError::NoActiveOperation));
        assert_eq!(stack.cancel_operation(), Err(UndoError::NoActiveOperation));
    }

    #[test]
    fn test_empty_history_is_noop() {
        let stack = UndoStack::new();
        assert_eq!(stack.undo(), Ok(false));
        assert_eq!(stack.redo(), Ok(false));
    }

    #[test]
    fn test_cancel_reverts_in_reverse() {
        let stack = UndoStack::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));

        stack.start_operation().unwrap();
        stack.add_command(logged(&log, "a")).unwrap();
        stack.add_command(logged(&log, "b")).unwrap();
        stack.cancel_operation().unwrap();

        assert_eq!(*log.lock(), vec!["undo b", "undo a"]);
        assert!(!stack.is_recording());
        assert!(!stack.can_undo());
        assert!(UndoStack::current().is_none());
    }

    #[test]
    fn test_cancel_does_not_rerecord() {
        let stack = UndoStack::new();
        let prop = Property::new(1);
        prop.track_undo(&stack);

        stack.start_operation().unwrap();
        prop.set(2);
        prop.set(3);
        stack.cancel_operation().unwrap();

        assert_eq!(prop.get(), 1);
        assert_eq!(stack.undo_len(), 0);
        assert_eq!(stack.redo_len(), 0);
    }

    #[test]
    fn test_current_binding() {
        assert!(UndoStack::current().is_none());

        let stack = UndoStack::new();
        stack.start_operation().unwrap();
        let current = UndoStack::current().unwrap();
        assert!(current.ptr_eq(&stack));

        stack.commit_operation().unwrap();
        assert!(UndoStack::current().is_none());
    }

    #[test]
    fn test_record_into_current_stack() {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        assert!(!UndoStack::record(logged(&log, "orphan")));

        let stack = UndoStack::new();
        stack.start_operation().unwrap();
        assert!(UndoStack::record(logged(&log, "nested")));
        stack.commit_operation().unwrap();

        stack.undo().unwrap();
        assert_eq!(*log.lock(), vec!["undo nested"]);
    }

    #[test]
    fn test_reentrant_undo_rejected() {
        let stack = UndoStack::new();
        let outcome = Arc::new(Mutex::new(None));

        let weak = stack.downgrade();
        let outcome_clone = outcome.clone();
        stack.start_operation().unwrap();
        stack
            .add_command(Command::new("reenter", || {}, move || {
                if let Some(stack) = weak.upgrade() {
                    *outcome_clone.lock() = Some(stack.undo());
                }
            }))
            .unwrap();
        stack.commit_operation().unwrap();

        assert_eq!(stack.undo(), Ok(true));
        assert_eq!(*outcome.lock(), Some(Err(UndoError::ReplayInProgress)));
        assert_eq!(stack.redo_len(), 1);
    }

    #[test]
    fn test_retain_policy_keeps_redo() {
        let stack = UndoStack::new();
        for _ in 0..2 {
            stack.start_operation().unwrap();
            stack.commit_operation().unwrap();
        }
        stack.undo().unwrap();
        stack.start_operation().unwrap();
        stack.commit_operation().unwrap();

        assert_eq!(stack.undo_len(), 2);
        assert_eq!(stack.redo_len(), 1);
    }

    #[test]
    fn test_discard_policy_clears_redo() {
        let stack =
            UndoStack::with_config(UndoConfig::new().with_redo_policy(RedoPolicy::DiscardOnCommit));
        for _ in 0..2 {
            stack.start_operation().unwrap();
            stack.commit_operation().unwrap();
        }
        stack.undo().unwrap();
        stack.start_operation().unwrap();
        stack.commit_operation().unwrap();

        assert_eq!(stack.undo_len(), 2);
        assert_eq!(stack.redo_len(), 0);
    }

    #[test]
    fn test_max_history_drops_oldest() {
        let stack = UndoStack::with_config(UndoConfig::new().with_max_history(2));
        for label in ["first", "second", "third"] {
            stack.start_labeled_operation(label).unwrap();
            stack.commit_operation().unwrap();
        }

        assert_eq!(stack.undo_len(), 2);
        stack.undo().unwrap();
        assert_eq!(stack.undo_label().as_deref(), Some("second"));
        stack.undo().unwrap();
        assert_eq!(stack.undo(), Ok(false));
    }

    #[test]
    fn test_labels() {
        let stack = UndoStack::new();
        stack.start_labeled_operation("Resize").unwrap();
        stack.commit_operation().unwrap();

        assert_eq!(stack.undo_label().as_deref(), Some("Resize"));
        assert_eq!(stack.redo_label(), None);
        stack.undo().unwrap();
        assert_eq!(stack.redo_label().as_deref(), Some("Resize"));
    }

    #[test]
    fn test_run_operation() {
        let stack = UndoStack::new();
        let prop = Property::new(0);
        prop.track_undo(&stack);

        let ok: Result<i32, UndoError> = stack.run_operation(|| {
            prop.set(1);
            Ok(1)
        });
        assert_eq!(ok, Ok(1));
        assert_eq!(stack.undo_len(), 1);

        let failed: Result<(), crate::Error> = stack.run_operation(|| {
            prop.set(2);
            Err(crate::PropertyError::index_out_of_bounds(0, 0).into())
        });
        assert!(failed.is_err());
        assert_eq!(prop.get(), 1);
        assert_eq!(stack.undo_len(), 1);
    }

    #[test]
    fn test_availability_observables() {
        let stack = UndoStack::new();
        let undo_available = stack.undo_available();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let changes_clone = changes.clone();
        undo_available.add_listener(move |_, _, new: &bool| changes_clone.lock().push(*new));

        assert!(!undo_available.get());
        stack.start_operation().unwrap();
        stack.commit_operation().unwrap();
        assert!(undo_available.get());
        assert!(!stack.redo_available().get());

        stack.undo().unwrap();
        assert!(!undo_available.get());
        assert!(stack.redo_available().get());

        stack.clear_history();
        assert!(!stack.redo_available().get());
        assert_eq!(*changes.lock(), vec![true, false]);
    }

    #[test]
    fn test_list_tracking_clear_undo() {
        let stack = UndoStack::new();
        let list = ListProperty::from_vec(vec![1, 2, 3]);
        list.track_undo(&stack);

        stack.start_operation().unwrap();
        list.clear();
        list.push(9);
        stack.commit_operation().unwrap();

        stack.undo().unwrap();
        assert_eq!(list.to_vec(), vec![1, 2, 3]);
        stack.redo().unwrap();
        assert_eq!(list.to_vec(), vec![9]);
    }

    #[test]
    fn test_list_set_undo() {
        let stack = UndoStack::new();
        let list = ListProperty::from_vec(vec!["a", "b"]);
        list.track_undo(&stack);

        stack.start_operation().unwrap();
        list.set(1, "z").unwrap();
        stack.commit_operation().unwrap();

        stack.undo().unwrap();
        assert_eq!(list.to_vec(), vec!["a", "b"]);
        stack.redo().unwrap();
        assert_eq!(list.to_vec(), vec!["a", "z"]);
    }

    #[test]
    fn test_changes_outside_operation_not_recorded() {
        let stack = UndoStack::new();
        let prop = Property::new(0);
        prop.track_undo(&stack);

        prop.set(3);
        assert_eq!(stack.undo_len(), 0);
        assert!(!stack.can_undo());
    }

    #[test]
    fn test_custom_command() {
        struct Toggle(Property<bool>);
        impl UndoableCommand for Toggle {
            fn perform(&self) {
                self.0.set(true);
            }
            fn undo(&self) {
                self.0.set(false);
            }
            fn description(&self) -> &str {
                "toggle"
            }
        }

        let flag = Property::new(true);
        let command = Command::custom(Toggle(flag.clone()));
        assert_eq!(command.description(), "toggle");

        let operation = Operation::new(Some("flip".into()), vec![command]);
        operation.undo();
        assert!(!flag.get());
        operation.perform();
        assert!(flag.get());
        assert_eq!(operation.label(), Some("flip"));
        assert_eq!(operation.len(), 1);
    }

    #[test]
    fn test_stack_dropped_while_recording_is_unbound() {
        let abandoned = UndoStack::new();
        abandoned.start_operation().unwrap();
        drop(abandoned);
        assert!(UndoStack::current().is_none());
        assert!(!any_recording());

        let stack = UndoStack::new();
        stack.start_operation().unwrap();
        ACTIVE_STACKS.with(|stacks| assert_eq!(stacks.borrow().len(), 1));
        stack.commit_operation().unwrap();
        ACTIVE_STACKS.with(|stacks| assert!(stacks.borrow().is_empty()));
    }

    #[test]
    fn test_tracking_holds_stack_weakly() {
        let prop = Property::new(0);
        let stack = UndoStack::new();
        prop.track_undo(&stack);

        let weak = stack.downgrade();
        drop(stack);
        assert!(weak.upgrade().is_none());
        prop.set(1);
    }
}
