//! Property system for Statecraft.
//!
//! This module provides observable value cells with veto/coercion hooks,
//! equality-based change suppression and listener fan-out. Properties are the
//! leaves of the reactive graph: [`ComputedProperty`](crate::ComputedProperty)
//! derives values from them and [`UndoStack`](crate::UndoStack) records their
//! changes.
//!
//! # Property Types
//!
//! - **Property<T>**: A shared, observable value cell
//! - **ReadOnlyProperty<T>**: A view that can be read and observed but not set
//! - **WeakProperty<T>**: A non-owning handle to a property
//!
//! # Example
//!
//! ```
//! use statecraft_core::{Property, Veto};
//!
//! let volume = Property::new(5);
//!
//! // Clamp instead of rejecting out-of-range values
//! volume.set_veto(|_old, new: &i32| {
//!     if *new > 10 { Veto::Coerce(10) } else { Veto::Accept }
//! });
//!
//! volume.add_listener(|_, old, new| println!("volume {old} -> {new}"));
//!
//! assert_eq!(volume.set(42), 10);
//! assert_eq!(volume.get(), 10);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::computed::{deliver, record_read, Dependency};
use crate::listener::{ChangeListener, ListenerId, ListenerSet};

static NEXT_PROPERTY_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an observable cell.
///
/// Every [`Property`], [`ComputedProperty`](crate::ComputedProperty) and
/// [`ListProperty`](crate::ListProperty) gets a distinct ID at creation.
/// Handles cloned from the same cell share its ID. Listeners receive the ID
/// of the cell that changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(u64);

impl PropertyId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PROPERTY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Convert the ID to a raw u64 value.
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// The outcome of a property's veto hook.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Veto<T> {
    /// Store the proposed value.
    Accept,
    /// Keep the current value; `set` returns it unchanged.
    Reject,
    /// Store this value instead of the proposed one.
    ///
    /// The replacement is compared against the current value again, so
    /// coercing to the current value is a silent no-op.
    Coerce(T),
}

type EqualityFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
type VetoFn<T> = Arc<dyn Fn(&T, &T) -> Veto<T> + Send + Sync>;

pub(crate) struct PropertyInner<T> {
    id: PropertyId,
    value: RwLock<T>,
    equal: EqualityFn<T>,
    veto: RwLock<Option<VetoFn<T>>>,
    listeners: ListenerSet<dyn ChangeListener<T>>,
}

impl<T: Send + Sync + 'static> Dependency for PropertyInner<T> {
    fn dependency_id(&self) -> PropertyId {
        self.id
    }

    fn subscribe(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> ListenerId {
        let listener = move |_: PropertyId, _: &T, _: &T| on_change();
        self.listeners.add_strong(Arc::new(listener))
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// A shared, observable value cell.
///
/// `Property<T>` is a handle: cloning it yields another handle to the same
/// cell. Use [`clone_for_owner`](Self::clone_for_owner) for an independent
/// copy.
///
/// # Change Protocol
///
/// [`set`](Self::set) stores a value only if it differs from the current one
/// by the property's equality function and the veto hook does not reject it.
/// The value is stored before listeners run, so listeners always observe the
/// new value through [`get`](Self::get).
///
/// # Thread Safety
///
/// `Property<T>` is `Send + Sync` when `T` is. A property graph is still
/// meant to be driven by one thread at a time: no ordering is guaranteed
/// between concurrent `set` calls.
pub struct Property<T> {
    inner: Arc<PropertyInner<T>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> Property<T> {
    /// Create a new property with an initial value, compared with `PartialEq`.
    pub fn new(value: T) -> Self {
        Self::with_equality(value, |a, b| a == b)
    }
}

impl<T: Clone + Send + Sync + 'static> Property<T> {
    /// Create a new property with a custom equality function.
    ///
    /// `equal` decides whether a `set` is a no-op. It must be symmetric;
    /// an asymmetric function gives unspecified notification behavior.
    pub fn with_equality<F>(value: T, equal: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self::from_parts(value, Arc::new(equal), None)
    }

    fn from_parts(value: T, equal: EqualityFn<T>, veto: Option<VetoFn<T>>) -> Self {
        Self {
            inner: Arc::new(PropertyInner {
                id: PropertyId::next(),
                value: RwLock::new(value),
                equal,
                veto: RwLock::new(veto),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// The identity of this cell.
    pub fn id(&self) -> PropertyId {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// When called while a [`ComputedProperty`](crate::ComputedProperty) is
    /// evaluating on this thread, the property becomes one of its
    /// dependencies.
    pub fn get(&self) -> T {
        self.track_read();
        self.inner.value.read().clone()
    }

    /// Access the value through a closure without cloning.
    ///
    /// Tracked like [`get`](Self::get). The closure must not set this
    /// property.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        self.track_read();
        f(&self.inner.value.read())
    }

    fn track_read(&self) {
        record_read(self.inner.id, || {
            Arc::clone(&self.inner) as Arc<dyn Dependency>
        });
    }

    /// Access the value without registering a dependency.
    pub(crate) fn with_untracked<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        f(&self.inner.value.read())
    }

    /// Set the value and return the value the property holds afterwards.
    ///
    /// - Equal to the current value: no-op, returns the current value.
    /// - Rejected by the veto hook: no-op, returns the current value.
    /// - Coerced by the veto hook: the coerced value is checked for equality
    ///   again and stored if it differs.
    ///
    /// On a change, listeners are notified synchronously with the old and new
    /// values after the new value has been stored.
    pub fn set(&self, value: T) -> T {
        match self.apply(value) {
            Some((_, new)) => new,
            None => self.inner.value.read().clone(),
        }
    }

    /// Set the value, returning the old value if it changed.
    ///
    /// Follows the same protocol as [`set`](Self::set).
    pub fn replace(&self, value: T) -> Option<T> {
        self.apply(value).map(|(old, _)| old)
    }

    /// Store a value without equality check, veto or notification.
    ///
    /// This is useful during initialization or when restoring state that
    /// observers must not react to.
    pub fn set_silent(&self, value: T) {
        *self.inner.value.write() = value;
    }

    fn apply(&self, value: T) -> Option<(T, T)> {
        let old = self.inner.value.read().clone();
        if (self.inner.equal)(&old, &value) {
            return None;
        }

        let veto = self.inner.veto.read().clone();
        let decision = match &veto {
            Some(hook) => hook(&old, &value),
            None => Veto::Accept,
        };
        let value = match decision {
            Veto::Accept => value,
            Veto::Reject => {
                tracing::trace!(target: "statecraft_core::property", property = ?self.inner.id, "change rejected by veto");
                return None;
            }
            Veto::Coerce(coerced) => {
                if (self.inner.equal)(&old, &coerced) {
                    return None;
                }
                coerced
            }
        };

        *self.inner.value.write() = value.clone();
        self.notify(&old, &value);
        Some((old, value))
    }

    fn notify(&self, old: &T, new: &T) {
        let listeners = self.inner.listeners.snapshot();
        tracing::trace!(
            target: "statecraft_core::property",
            property = ?self.inner.id,
            listener_count = listeners.len(),
            "property changed"
        );
        deliver(|| {
            for listener in listeners {
                listener.property_changed(self.inner.id, old, new);
            }
        });
    }

    /// Install the veto hook, replacing any previous one.
    ///
    /// The hook receives `(current, proposed)` and runs only for values that
    /// differ from the current one.
    pub fn set_veto<F>(&self, veto: F)
    where
        F: Fn(&T, &T) -> Veto<T> + Send + Sync + 'static,
    {
        *self.inner.veto.write() = Some(Arc::new(veto));
    }

    /// Remove the veto hook.
    pub fn clear_veto(&self) {
        *self.inner.veto.write() = None;
    }

    /// Register a strong listener closure.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(PropertyId, &T, &T) + Send + Sync + 'static,
    {
        self.inner.listeners.add_strong(Arc::new(listener))
    }

    /// Register a strong listener object.
    ///
    /// The property keeps the listener alive until it is removed.
    pub fn add_hard_listener<L>(&self, listener: Arc<L>) -> ListenerId
    where
        L: ChangeListener<T> + 'static,
    {
        self.inner.listeners.add_strong(listener)
    }

    /// Register a weak listener object.
    ///
    /// The property does not keep the listener alive: once the caller drops
    /// its last `Arc`, the registration lapses.
    pub fn add_weak_listener<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: ChangeListener<T> + 'static,
    {
        let listener: Arc<dyn ChangeListener<T>> = Arc::clone(listener) as _;
        self.inner.listeners.add_weak(Arc::downgrade(&listener))
    }

    /// Remove a listener. Returns `true` if it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Number of registered listeners that are still alive.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Suppress or resume change notification.
    ///
    /// While blocked, values still change but no listener is invoked.
    pub fn set_blocked(&self, blocked: bool) {
        self.inner.listeners.set_blocked(blocked);
    }

    /// Check if change notification is currently blocked.
    pub fn is_blocked(&self) -> bool {
        self.inner.listeners.is_blocked()
    }

    /// Create an independent property for a new owner.
    ///
    /// The copy has the same value, equality function and veto hook, a new
    /// [`PropertyId`] and no listeners.
    pub fn clone_for_owner(&self) -> Self {
        Self::from_parts(
            self.inner.value.read().clone(),
            Arc::clone(&self.inner.equal),
            self.inner.veto.read().clone(),
        )
    }

    /// Get a read-only view of this property.
    pub fn read_only(&self) -> ReadOnlyProperty<T> {
        ReadOnlyProperty {
            inner: self.clone(),
            origin: None,
        }
    }

    /// Create a handle that does not keep the property alive.
    pub fn downgrade(&self) -> WeakProperty<T> {
        WeakProperty {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check whether two handles address the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + PartialEq + Default + Send + Sync + 'static> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.read())
            .finish()
    }
}

/// A non-owning handle to a [`Property`].
pub struct WeakProperty<T> {
    inner: Weak<PropertyInner<T>>,
}

impl<T> WeakProperty<T> {
    /// Get a strong handle if the property is still alive.
    pub fn upgrade(&self) -> Option<Property<T>> {
        self.inner.upgrade().map(|inner| Property { inner })
    }
}

impl<T> Clone for WeakProperty<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WeakProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakProperty")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// A read-only view of a property.
///
/// This provides read and observe access without the ability to modify the
/// underlying value. Useful for exposing properties publicly while keeping
/// the setter private.
pub struct ReadOnlyProperty<T> {
    inner: Property<T>,
    /// The computation producing `inner`, for views of computed properties.
    /// Held strongly so the view keeps updating, and recorded as the
    /// dependency when the view is read inside another computation.
    origin: Option<Arc<dyn Dependency>>,
}

impl<T: Clone + Send + Sync + 'static> ReadOnlyProperty<T> {
    /// Create a read-only view of a property.
    pub fn new(property: &Property<T>) -> Self {
        property.read_only()
    }

    pub(crate) fn derived(property: &Property<T>, origin: Arc<dyn Dependency>) -> Self {
        Self {
            inner: property.clone(),
            origin: Some(origin),
        }
    }

    /// The identity of the underlying cell.
    pub fn id(&self) -> PropertyId {
        self.inner.id()
    }

    /// Get the current value. Tracked like [`Property::get`].
    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Access the value through a closure.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        match &self.origin {
            Some(origin) => {
                record_read(origin.dependency_id(), || Arc::clone(origin));
                self.inner.with_untracked(f)
            }
            None => self.inner.with(f),
        }
    }

    /// Register a strong listener closure.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(PropertyId, &T, &T) + Send + Sync + 'static,
    {
        self.inner.add_listener(listener)
    }

    /// Register a strong listener object.
    pub fn add_hard_listener<L>(&self, listener: Arc<L>) -> ListenerId
    where
        L: ChangeListener<T> + 'static,
    {
        self.inner.add_hard_listener(listener)
    }

    /// Register a weak listener object.
    pub fn add_weak_listener<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: ChangeListener<T> + 'static,
    {
        self.inner.add_weak_listener(listener)
    }

    /// Remove a listener. Returns `true` if it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }

    /// Number of registered listeners that are still alive.
    pub fn listener_count(&self) -> usize {
        self.inner.listener_count()
    }
}

impl<T> Clone for ReadOnlyProperty<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            origin: self.origin.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadOnlyProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadOnlyProperty").field(&self.inner).finish()
    }
}

/// A helper trait for creating properties with common patterns.
pub trait IntoProperty<T> {
    /// Convert this value into a Property.
    fn into_property(self) -> Property<T>;
}

impl<T: Clone + PartialEq + Send + Sync + 'static> IntoProperty<T> for T {
    fn into_property(self) -> Property<T> {
        Property::new(self)
    }
}
