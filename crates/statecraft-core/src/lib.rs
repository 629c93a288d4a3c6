//! Reactive state for interactive applications.
//!
//! This crate provides the state layer that presentation code observes:
//!
//! - **Properties**: Observable value cells with veto/coercion and equality
//!   suppression
//! - **Computed Properties**: Derived values whose dependencies are captured
//!   automatically while they evaluate
//! - **List Properties**: Observable ordered collections with per-element
//!   events
//! - **Undo Stack**: Transactional undo/redo built from recorded commands
//!
//! # Property Example
//!
//! ```
//! use statecraft_core::{ComputedProperty, Property};
//!
//! let width = Property::new(4);
//! let height = Property::new(3);
//!
//! let area = ComputedProperty::new({
//!     let (width, height) = (width.clone(), height.clone());
//!     move || width.get() * height.get()
//! });
//!
//! area.add_listener(|_, old, new| println!("area {old} -> {new}"));
//!
//! width.set(5);
//! assert_eq!(area.get(), 15);
//! ```
//!
//! # Undo Example
//!
//! ```
//! use statecraft_core::{ListProperty, UndoStack};
//!
//! let stack = UndoStack::new();
//! let names = ListProperty::from_vec(vec!["ada", "grace"]);
//! names.track_undo(&stack);
//!
//! stack.start_labeled_operation("Clear names")?;
//! names.clear();
//! stack.commit_operation()?;
//!
//! assert_eq!(stack.undo_label().as_deref(), Some("Clear names"));
//! stack.undo()?;
//! assert_eq!(names.to_vec(), vec!["ada", "grace"]);
//! # Ok::<(), statecraft_core::UndoError>(())
//! ```

mod computed;
mod error;
pub mod list;
pub mod listener;
pub mod logging;
pub mod property;
pub mod thread_check;
pub mod undo;

pub use computed::ComputedProperty;
pub use error::{Error, PropertyError, Result, UndoError};
pub use list::{CloneMode, DeepClone, ListChange, ListProperty, WeakListProperty};
pub use listener::{ChangeListener, ListListener, ListenerId, Retention};
pub use logging::PerfSpan;
pub use property::{IntoProperty, Property, PropertyId, ReadOnlyProperty, Veto, WeakProperty};
pub use undo::{
    Command, Operation, RedoPolicy, UndoConfig, UndoStack, UndoableCommand, WeakUndoStack,
};

static_assertions::assert_impl_all!(Property<i32>: Send, Sync, Clone);
static_assertions::assert_impl_all!(ReadOnlyProperty<i32>: Send, Sync, Clone);
static_assertions::assert_impl_all!(ComputedProperty<i32>: Send, Sync, Clone);
static_assertions::assert_impl_all!(ListProperty<i32>: Send, Sync, Clone);
static_assertions::assert_impl_all!(UndoStack: Send, Sync, Clone);
static_assertions::assert_impl_all!(Command: Send, Sync);
