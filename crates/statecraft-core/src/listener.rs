//! Change-listener protocol shared by every observable type.
//!
//! Observables ([`Property`](crate::Property),
//! [`ComputedProperty`](crate::ComputedProperty) and
//! [`ListProperty`](crate::ListProperty)) notify listeners synchronously,
//! in the caller's stack, as soon as a change has been stored.
//!
//! # Retention
//!
//! - **Strong** listeners are owned by the observable until removed with
//!   `remove_listener`.
//! - **Weak** listeners are held through a [`Weak`] reference. The
//!   registration lapses on its own once the caller drops its last `Arc`
//!   to the listener; dead entries are pruned on the next delivery.
//!
//! # Delivery Order
//!
//! All strong listeners in subscription order, then all weak listeners in
//! subscription order. The listener set is snapshotted before delivery and
//! no lock is held while a listener runs, so listeners may freely set
//! properties, add listeners or remove listeners. A listener removed during
//! a delivery still receives the event being delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use crate::list::ListChange;
use crate::property::PropertyId;

new_key_type! {
    /// A unique identifier for a listener registration.
    ///
    /// Returned by every `add_*_listener` call and accepted by
    /// `remove_listener`. The ID stays valid until the listener is removed,
    /// or, for weak listeners, until the listener is dropped.
    pub struct ListenerId;
}

/// Receives value changes from a [`Property`](crate::Property) or
/// [`ComputedProperty`](crate::ComputedProperty).
///
/// Closures of the form `Fn(PropertyId, &T, &T)` implement this trait, so
/// most callers never implement it by hand. Implement it on a type when the
/// listener should be registered weakly with
/// [`Property::add_weak_listener`](crate::Property::add_weak_listener).
pub trait ChangeListener<T>: Send + Sync {
    /// Called after `source` changed from `old` to `new`.
    fn property_changed(&self, source: PropertyId, old: &T, new: &T);
}

impl<T, F> ChangeListener<T> for F
where
    F: Fn(PropertyId, &T, &T) + Send + Sync,
{
    fn property_changed(&self, source: PropertyId, old: &T, new: &T) {
        self(source, old, new)
    }
}

/// Receives element events from a [`ListProperty`](crate::ListProperty).
pub trait ListListener<E>: Send + Sync {
    /// Called once per added or removed element.
    fn list_changed(&self, source: PropertyId, change: &ListChange<E>);
}

impl<E, F> ListListener<E> for F
where
    F: Fn(PropertyId, &ListChange<E>) + Send + Sync,
{
    fn list_changed(&self, source: PropertyId, change: &ListChange<E>) {
        self(source, change)
    }
}

/// How a listener is held by the observable it is registered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retention {
    /// The observable keeps the listener alive.
    Strong,
    /// The observable does not extend the listener's lifetime.
    Weak,
}

enum Slot<L: ?Sized> {
    Strong(Arc<L>),
    Weak(Weak<L>),
}

impl<L: ?Sized> Slot<L> {
    fn retention(&self) -> Retention {
        match self {
            Self::Strong(_) => Retention::Strong,
            Self::Weak(_) => Retention::Weak,
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Self::Strong(_) => true,
            Self::Weak(weak) => weak.strong_count() > 0,
        }
    }
}

struct Registry<L: ?Sized> {
    slots: SlotMap<ListenerId, Slot<L>>,
    /// Registration order; slotmap iteration order is not insertion order.
    order: Vec<ListenerId>,
}

/// The listener storage behind every observable.
pub(crate) struct ListenerSet<L: ?Sized> {
    registry: Mutex<Registry<L>>,
    blocked: AtomicBool,
}

impl<L: ?Sized> ListenerSet<L> {
    pub(crate) fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                slots: SlotMap::with_key(),
                order: Vec::new(),
            }),
            blocked: AtomicBool::new(false),
        }
    }

    fn insert(&self, slot: Slot<L>) -> ListenerId {
        let mut registry = self.registry.lock();
        let id = registry.slots.insert(slot);
        registry.order.push(id);
        id
    }

    pub(crate) fn add_strong(&self, listener: Arc<L>) -> ListenerId {
        self.insert(Slot::Strong(listener))
    }

    pub(crate) fn add_weak(&self, listener: Weak<L>) -> ListenerId {
        self.insert(Slot::Weak(listener))
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        if registry.slots.remove(id).is_some() {
            registry.order.retain(|&other| other != id);
            true
        } else {
            false
        }
    }

    /// Number of registrations whose listener is still alive.
    pub(crate) fn len(&self) -> usize {
        self.registry
            .lock()
            .slots
            .values()
            .filter(|slot| slot.is_live())
            .count()
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub(crate) fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    /// Collect the listeners to notify, strong first, pruning dead weak ones.
    ///
    /// Returns an empty list while blocked.
    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        if self.is_blocked() {
            return Vec::new();
        }

        let mut registry = self.registry.lock();
        let mut listeners = Vec::with_capacity(registry.order.len());
        let mut dead = Vec::new();

        for retention in [Retention::Strong, Retention::Weak] {
            for &id in &registry.order {
                let Some(slot) = registry.slots.get(id) else {
                    continue;
                };
                if slot.retention() != retention {
                    continue;
                }
                match slot {
                    Slot::Strong(listener) => listeners.push(Arc::clone(listener)),
                    Slot::Weak(weak) => match weak.upgrade() {
                        Some(listener) => listeners.push(listener),
                        None => dead.push(id),
                    },
                }
            }
        }

        if !dead.is_empty() {
            for &id in &dead {
                registry.slots.remove(id);
            }
            registry.order.retain(|id| !dead.contains(id));
        }

        listeners
    }
}
