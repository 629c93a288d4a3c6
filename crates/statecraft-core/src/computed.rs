//! Computed properties with automatic dependency capture.
//!
//! A [`ComputedProperty<T>`] derives its value from a closure. Every
//! observable read while the closure runs ([`Property::get`],
//! [`ListProperty::len`](crate::ListProperty::len), another computed
//! property's `get`, ...) is captured as a dependency. When any dependency
//! changes, the closure runs again, the dependency set is replaced by what
//! that run read, and listeners of the computed property are notified if the
//! result changed.
//!
//! # Capture Frames
//!
//! Reads are recorded into a per-thread stack of capture frames. Each
//! evaluation pushes its own frame, so a computed property that reads another
//! computed property only records the outer read; the inner one's reads go
//! to the inner frame.
//!
//! # Propagation Order
//!
//! Every computed property has a height: one more than the highest of its
//! dependencies, with plain properties and lists at height zero. Change
//! notification is batched. Re-evaluations requested while listeners of a
//! changed cell run are queued and executed once the outermost delivery
//! returns, lowest height first. A computed property is therefore evaluated
//! once per change, after everything it reads is already up to date, even
//! when several of its inputs share a common source.
//!
//! # Example
//!
//! ```
//! use statecraft_core::{ComputedProperty, Property};
//!
//! let first = Property::new("Ada".to_string());
//! let last = Property::new("Lovelace".to_string());
//!
//! let full = ComputedProperty::new({
//!     let (first, last) = (first.clone(), last.clone());
//!     move || format!("{} {}", first.get(), last.get())
//! });
//!
//! assert_eq!(full.get(), "Ada Lovelace");
//! first.set("Augusta".to_string());
//! assert_eq!(full.get(), "Augusta Lovelace");
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::listener::{ChangeListener, ListenerId};
use crate::property::{Property, PropertyId, ReadOnlyProperty};

/// An observable cell that a computation can depend on.
pub(crate) trait Dependency: Send + Sync {
    fn dependency_id(&self) -> PropertyId;

    /// Call `on_change` after every change of this cell.
    fn subscribe(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> ListenerId;

    fn unsubscribe(&self, id: ListenerId) -> bool;

    /// Distance from the plain observables this cell is derived from.
    fn height(&self) -> usize {
        0
    }
}

#[derive(Default)]
struct CaptureFrame {
    seen: HashSet<PropertyId>,
    dependencies: Vec<Arc<dyn Dependency>>,
}

thread_local! {
    static CAPTURE_FRAMES: RefCell<Vec<CaptureFrame>> = const { RefCell::new(Vec::new()) };
}

/// Record a read of `id` into the innermost capture frame, if any.
///
/// `dependency` is only called the first time a frame sees `id`.
pub(crate) fn record_read<F>(id: PropertyId, dependency: F)
where
    F: FnOnce() -> Arc<dyn Dependency>,
{
    CAPTURE_FRAMES.with(|frames| {
        if let Some(frame) = frames.borrow_mut().last_mut() {
            if frame.seen.insert(id) {
                frame.dependencies.push(dependency());
            }
        }
    });
}

/// Pops the frame pushed by [`capture`], even if the computation panics.
struct FrameGuard {
    armed: bool,
}

impl FrameGuard {
    fn push() -> Self {
        CAPTURE_FRAMES.with(|frames| frames.borrow_mut().push(CaptureFrame::default()));
        Self { armed: true }
    }

    fn finish(mut self) -> Vec<Arc<dyn Dependency>> {
        self.armed = false;
        CAPTURE_FRAMES
            .with(|frames| frames.borrow_mut().pop())
            .map(|frame| frame.dependencies)
            .unwrap_or_default()
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if self.armed {
            CAPTURE_FRAMES.with(|frames| {
                frames.borrow_mut().pop();
            });
        }
    }
}

/// Run `f` in a fresh capture frame and return its result with every
/// observable it read, in first-read order.
pub(crate) fn capture<R>(f: impl FnOnce() -> R) -> (R, Vec<Arc<dyn Dependency>>) {
    let guard = FrameGuard::push();
    let result = f();
    (result, guard.finish())
}

/// A computation that can be queued for re-evaluation.
trait Stale: Send + Sync {
    fn stale_id(&self) -> PropertyId;

    fn stale_height(&self) -> usize;

    fn reevaluate(self: Arc<Self>);
}

#[derive(Default)]
struct Propagation {
    pending: BTreeMap<(usize, PropertyId), Arc<dyn Stale>>,
    queued: HashSet<PropertyId>,
}

thread_local! {
    static PROPAGATION: RefCell<Propagation> = RefCell::new(Propagation::default());
    static DELIVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
    static FLUSHING: Cell<bool> = const { Cell::new(false) };
}

/// Leaves a delivery batch, even if a listener panics.
struct DeliveryGuard;

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        DELIVERY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Run listener delivery `f` as one batch.
///
/// Re-evaluations queued while `f` runs wait until the outermost batch ends.
pub(crate) fn deliver<R>(f: impl FnOnce() -> R) -> R {
    DELIVERY_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let guard = DeliveryGuard;
    let result = f();
    drop(guard);
    flush();
    result
}

fn schedule(node: Arc<dyn Stale>) {
    PROPAGATION.with(|propagation| {
        let mut propagation = propagation.borrow_mut();
        let id = node.stale_id();
        if propagation.queued.insert(id) {
            propagation.pending.insert((node.stale_height(), id), node);
        }
    });
    flush();
}

/// Clears the flushing flag and drops queued work if a computation panics.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        FLUSHING.with(|flushing| flushing.set(false));
        if std::thread::panicking() {
            PROPAGATION.with(|propagation| {
                if let Ok(mut propagation) = propagation.try_borrow_mut() {
                    propagation.pending.clear();
                    propagation.queued.clear();
                }
            });
        }
    }
}

/// Re-evaluate queued computations, lowest height first.
///
/// No-op inside a delivery batch or while another flush is running on this
/// thread; that flush picks up whatever is queued now.
fn flush() {
    if DELIVERY_DEPTH.with(Cell::get) > 0 || FLUSHING.with(Cell::get) {
        return;
    }
    FLUSHING.with(|flushing| flushing.set(true));
    let _guard = FlushGuard;

    loop {
        let next = PROPAGATION.with(|propagation| {
            let mut propagation = propagation.borrow_mut();
            let (_, node) = propagation.pending.pop_first()?;
            propagation.queued.remove(&node.stale_id());
            Some(node)
        });
        match next {
            Some(node) => node.reevaluate(),
            None => break,
        }
    }
}

struct DependencyLink {
    dependency: Arc<dyn Dependency>,
    listener: ListenerId,
}

struct ComputedInner<T> {
    compute: Box<dyn Fn() -> T + Send + Sync>,
    value: Property<T>,
    links: Mutex<Vec<DependencyLink>>,
    height: AtomicUsize,
}

fn height_above(dependencies: &[Arc<dyn Dependency>]) -> usize {
    dependencies
        .iter()
        .map(|dependency| dependency.height() + 1)
        .max()
        .unwrap_or(1)
}

impl<T: Clone + Send + Sync + 'static> ComputedInner<T> {
    fn recompute(this: &Arc<Self>) {
        let (value, dependencies) = capture(|| (this.compute)());
        this.height.store(height_above(&dependencies), Ordering::Relaxed);
        Self::relink(this, dependencies);
        this.value.set(value);
    }

    /// Replace the current subscriptions with `dependencies`.
    ///
    /// Stale dependencies are unsubscribed, new ones subscribed, and the ones
    /// present in both keep their existing subscription.
    fn relink(this: &Arc<Self>, dependencies: Vec<Arc<dyn Dependency>>) {
        let current: HashSet<PropertyId> = dependencies
            .iter()
            .map(|dependency| dependency.dependency_id())
            .collect();

        let mut links = this.links.lock();
        let (kept, stale): (Vec<_>, Vec<_>) = links
            .drain(..)
            .partition(|link| current.contains(&link.dependency.dependency_id()));

        for link in &stale {
            link.dependency.unsubscribe(link.listener);
        }

        let linked: HashSet<PropertyId> = kept
            .iter()
            .map(|link| link.dependency.dependency_id())
            .collect();
        let mut added = 0;
        *links = kept;

        for dependency in dependencies {
            if linked.contains(&dependency.dependency_id()) {
                continue;
            }
            let weak: Weak<Self> = Arc::downgrade(this);
            let listener = dependency.subscribe(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    schedule(inner);
                }
            }));
            links.push(DependencyLink {
                dependency,
                listener,
            });
            added += 1;
        }

        tracing::trace!(
            target: "statecraft_core::computed",
            property = ?this.value.id(),
            dependencies = links.len(),
            added,
            removed = stale.len(),
            "dependencies captured"
        );
    }
}

impl<T: Clone + Send + Sync + 'static> Stale for ComputedInner<T> {
    fn stale_id(&self) -> PropertyId {
        self.value.id()
    }

    fn stale_height(&self) -> usize {
        self.height.load(Ordering::Relaxed)
    }

    fn reevaluate(self: Arc<Self>) {
        Self::recompute(&self);
    }
}

impl<T: Clone + Send + Sync + 'static> Dependency for ComputedInner<T> {
    fn dependency_id(&self) -> PropertyId {
        self.value.id()
    }

    fn subscribe(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> ListenerId {
        self.value.add_listener(move |_, _, _| on_change())
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.value.remove_listener(id)
    }

    fn height(&self) -> usize {
        self.height.load(Ordering::Relaxed)
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        for link in self.links.get_mut().drain(..) {
            link.dependency.unsubscribe(link.listener);
        }
    }
}

/// A read-only property whose value is derived from other properties.
///
/// The value is evaluated once at construction and again, eagerly, whenever
/// a dependency changes. Listeners fire only when the re-evaluated value
/// differs from the previous one.
///
/// Cloning a `ComputedProperty` creates a new handle to the **same**
/// computation. The computation stays alive while any handle, read-only
/// view or dependent computed property refers to it. Its own dependencies
/// hold only weak references to it: once the last of those is dropped, the
/// computation stops and unsubscribes.
///
/// A computation must not read the computed property it defines.
pub struct ComputedProperty<T> {
    inner: Arc<ComputedInner<T>>,
}

impl<T: Clone + PartialEq + Send + Sync + 'static> ComputedProperty<T> {
    /// Create a computed property, comparing results with `PartialEq`.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_equality(compute, |a, b| a == b)
    }
}

impl<T: Clone + Send + Sync + 'static> ComputedProperty<T> {
    /// Create a computed property with a custom equality function.
    ///
    /// `equal` decides whether a re-evaluation notifies listeners.
    pub fn with_equality<F, E>(compute: F, equal: E) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let (initial, dependencies) = capture(&compute);
        let inner = Arc::new(ComputedInner {
            compute: Box::new(compute),
            value: Property::with_equality(initial, equal),
            links: Mutex::new(Vec::new()),
            height: AtomicUsize::new(height_above(&dependencies)),
        });
        ComputedInner::relink(&inner, dependencies);
        Self { inner }
    }

    /// The identity of this computed cell.
    pub fn id(&self) -> PropertyId {
        self.inner.value.id()
    }

    /// Get the current value.
    ///
    /// Inside another computation, this computed property becomes one of
    /// its dependencies.
    pub fn get(&self) -> T {
        self.with(T::clone)
    }

    /// Access the value through a closure without cloning.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&T) -> R,
    {
        record_read(self.id(), || Arc::clone(&self.inner) as Arc<dyn Dependency>);
        self.inner.value.with_untracked(f)
    }

    /// Re-evaluate now, even though no dependency reported a change.
    ///
    /// Use this when the computation also reads state that is not an
    /// observable.
    pub fn invalidate(&self) {
        schedule(Arc::clone(&self.inner) as Arc<dyn Stale>);
    }

    /// Re-evaluate and return the new value.
    pub fn refresh(&self) -> T {
        self.invalidate();
        self.get()
    }

    /// Number of observables read by the last evaluation.
    pub fn dependency_count(&self) -> usize {
        self.inner.links.lock().len()
    }

    /// Check whether the last evaluation read the observable `id`.
    pub fn depends_on(&self, id: PropertyId) -> bool {
        self.inner
            .links
            .lock()
            .iter()
            .any(|link| link.dependency.dependency_id() == id)
    }

    /// Register a strong listener closure.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(PropertyId, &T, &T) + Send + Sync + 'static,
    {
        self.inner.value.add_listener(listener)
    }

    /// Register a strong listener object.
    pub fn add_hard_listener<L>(&self, listener: Arc<L>) -> ListenerId
    where
        L: ChangeListener<T> + 'static,
    {
        self.inner.value.add_hard_listener(listener)
    }

    /// Register a weak listener object.
    pub fn add_weak_listener<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: ChangeListener<T> + 'static,
    {
        self.inner.value.add_weak_listener(listener)
    }

    /// Remove a listener. Returns `true` if it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.value.remove_listener(id)
    }

    /// Number of registered listeners that are still alive.
    pub fn listener_count(&self) -> usize {
        self.inner.value.listener_count()
    }

    /// Get a read-only property view of the computed value.
    ///
    /// The view keeps the computation running after every
    /// `ComputedProperty` handle is dropped.
    pub fn read_only(&self) -> ReadOnlyProperty<T> {
        ReadOnlyProperty::derived(&self.inner.value, Arc::clone(&self.inner) as Arc<dyn Dependency>)
    }
}

impl<T> Clone for ComputedProperty<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ComputedProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedProperty")
            .field("value", &self.inner.value)
            .field("dependencies", &self.inner.links.lock().len())
            .finish()
    }
}
