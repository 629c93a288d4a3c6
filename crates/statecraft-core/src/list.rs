//! Observable ordered collections.
//!
//! A [`ListProperty<E>`] is a shared, ordered sequence that reports every
//! structural change as a granular [`ListChange`] event:
//!
//! | Mutation          | Events                                         |
//! |-------------------|------------------------------------------------|
//! | `push`/`insert`   | one `Added`                                    |
//! | `remove`          | one `Removed`                                  |
//! | `set`             | `Removed(i, old)` then `Added(i, new)`         |
//! | `clear`           | one `Removed` per element, highest index first |
//! | `insert_all`      | one `Added` per element, increasing index      |
//!
//! Events are delivered after the mutation is complete and without any lock
//! held, so listeners always see a consistent list.
//!
//! # Example
//!
//! ```
//! use statecraft_core::{ListChange, ListProperty};
//!
//! let layers: ListProperty<&str> = ListProperty::new();
//! layers.add_listener(|_, change| match change {
//!     ListChange::Added { index, element } => println!("+{index} {element}"),
//!     ListChange::Removed { index, element } => println!("-{index} {element}"),
//! });
//!
//! layers.push("background");
//! layers.push("sprites");
//! layers.insert(1, "tiles").unwrap();
//! assert_eq!(layers.to_vec(), vec!["background", "tiles", "sprites"]);
//! ```

use std::fmt;
use std::iter::Rev;
use std::sync::{Arc, Weak};
use std::vec::IntoIter;

use parking_lot::RwLock;

use crate::computed::{deliver, record_read, Dependency};
use crate::error::PropertyError;
use crate::listener::{ListListener, ListenerId, ListenerSet};
use crate::property::PropertyId;

/// A single element event emitted by a [`ListProperty`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListChange<E> {
    /// `element` now sits at `index`.
    Added {
        /// Position of the new element.
        index: usize,
        /// The element that was added.
        element: E,
    },
    /// `element` was removed from `index`.
    Removed {
        /// Position the element occupied.
        index: usize,
        /// The element that was removed.
        element: E,
    },
}

impl<E> ListChange<E> {
    /// The index the event refers to.
    pub fn index(&self) -> usize {
        match self {
            Self::Added { index, .. } | Self::Removed { index, .. } => *index,
        }
    }

    /// The element the event refers to.
    pub fn element(&self) -> &E {
        match self {
            Self::Added { element, .. } | Self::Removed { element, .. } => element,
        }
    }

    /// Check if this is an `Added` event.
    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added { .. })
    }
}

/// Elements that can produce an independent copy of themselves.
///
/// Required by [`ListProperty::clone_deep`]. For `Arc<T>` this allocates a
/// new `Arc` around a clone of the pointee, where plain `Clone` would share
/// the pointee.
pub trait DeepClone {
    /// Create an independent copy of `self`.
    fn deep_clone(&self) -> Self;
}

impl<T: Clone> DeepClone for Arc<T> {
    fn deep_clone(&self) -> Self {
        Arc::new(T::clone(self))
    }
}

impl<T: Clone> DeepClone for Box<T> {
    fn deep_clone(&self) -> Self {
        Box::new(T::clone(self))
    }
}

/// How [`ListProperty::clone_for_owner`] copies elements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloneMode {
    /// Clone the container; elements are copied with `Clone`, which shares
    /// reference-counted elements.
    #[default]
    Shallow,
    /// Clone the container and every element with [`DeepClone`].
    Deep,
}

pub(crate) struct ListInner<E> {
    id: PropertyId,
    items: RwLock<Vec<E>>,
    listeners: ListenerSet<dyn ListListener<E>>,
}

impl<E: Send + Sync + 'static> Dependency for ListInner<E> {
    fn dependency_id(&self) -> PropertyId {
        self.id
    }

    fn subscribe(&self, on_change: Arc<dyn Fn() + Send + Sync>) -> ListenerId {
        let listener = move |_: PropertyId, _: &ListChange<E>| on_change();
        self.listeners.add_strong(Arc::new(listener))
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

/// An observable ordered collection.
///
/// `ListProperty<E>` is a handle: cloning it yields another handle to the
/// same list. Use [`clone_shallow`](Self::clone_shallow),
/// [`clone_deep`](Self::clone_deep) or
/// [`clone_for_owner`](Self::clone_for_owner) for an independent list.
///
/// Reads register the list as a dependency of a running
/// [`ComputedProperty`](crate::ComputedProperty) evaluation; any element
/// event re-evaluates it.
pub struct ListProperty<E> {
    inner: Arc<ListInner<E>>,
}

impl<E: Clone + Send + Sync + 'static> ListProperty<E> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Create a list holding `items`.
    pub fn from_vec(items: Vec<E>) -> Self {
        Self {
            inner: Arc::new(ListInner {
                id: PropertyId::next(),
                items: RwLock::new(items),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// The identity of this list.
    pub fn id(&self) -> PropertyId {
        self.inner.id
    }

    fn track_read(&self) {
        record_read(self.inner.id, || {
            Arc::clone(&self.inner) as Arc<dyn Dependency>
        });
    }

    fn fire(&self, change: ListChange<E>) {
        let listeners = self.inner.listeners.snapshot();
        tracing::trace!(
            target: "statecraft_core::list",
            list = ?self.inner.id,
            index = change.index(),
            added = change.is_added(),
            listener_count = listeners.len(),
            "list changed"
        );
        deliver(|| {
            for listener in listeners {
                listener.list_changed(self.inner.id, &change);
            }
        });
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.track_read();
        self.inner.items.read().len()
    }

    /// Check if the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the element at `index`.
    pub fn get(&self, index: usize) -> Option<E> {
        self.track_read();
        self.inner.items.read().get(index).cloned()
    }

    /// Iterate over a snapshot of the elements in insertion order.
    pub fn iter(&self) -> IntoIter<E> {
        self.to_vec().into_iter()
    }

    /// Iterate over a snapshot of the elements from last to first.
    pub fn reverse_iter(&self) -> Rev<IntoIter<E>> {
        self.iter().rev()
    }

    /// Copy the elements into a `Vec`.
    pub fn to_vec(&self) -> Vec<E> {
        self.track_read();
        self.inner.items.read().clone()
    }

    /// Access the elements through a closure without cloning.
    ///
    /// The closure must not mutate this list.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[E]) -> R,
    {
        self.track_read();
        f(&self.inner.items.read())
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Append an element.
    pub fn push(&self, element: E) {
        let index = {
            let mut items = self.inner.items.write();
            items.push(element.clone());
            items.len() - 1
        };
        self.fire(ListChange::Added { index, element });
    }

    /// Insert an element at `index`, shifting later elements up.
    pub fn insert(&self, index: usize, element: E) -> Result<(), PropertyError> {
        {
            let mut items = self.inner.items.write();
            if index > items.len() {
                return Err(PropertyError::index_out_of_bounds(index, items.len()));
            }
            items.insert(index, element.clone());
        }
        self.fire(ListChange::Added { index, element });
        Ok(())
    }

    /// Replace the element at `index`, returning the previous one.
    ///
    /// Fires `Removed(index, old)` followed by `Added(index, element)`.
    pub fn set(&self, index: usize, element: E) -> Result<E, PropertyError> {
        let old = {
            let mut items = self.inner.items.write();
            let len = items.len();
            let slot = items
                .get_mut(index)
                .ok_or_else(|| PropertyError::index_out_of_bounds(index, len))?;
            std::mem::replace(slot, element.clone())
        };
        self.fire(ListChange::Removed {
            index,
            element: old.clone(),
        });
        self.fire(ListChange::Added { index, element });
        Ok(old)
    }

    /// Remove and return the element at `index`.
    pub fn remove(&self, index: usize) -> Result<E, PropertyError> {
        let element = {
            let mut items = self.inner.items.write();
            if index >= items.len() {
                return Err(PropertyError::index_out_of_bounds(index, items.len()));
            }
            items.remove(index)
        };
        self.fire(ListChange::Removed {
            index,
            element: element.clone(),
        });
        Ok(element)
    }

    /// Remove all elements, one `Removed` event per element, last first.
    pub fn clear(&self) {
        loop {
            let removed = {
                let mut items = self.inner.items.write();
                items.pop().map(|element| (items.len(), element))
            };
            match removed {
                Some((index, element)) => self.fire(ListChange::Removed { index, element }),
                None => break,
            }
        }
    }

    /// Append every element of `elements` in order.
    pub fn extend<I>(&self, elements: I)
    where
        I: IntoIterator<Item = E>,
    {
        for element in elements {
            self.push(element);
        }
    }

    /// Insert every element of `elements` starting at `index`, keeping
    /// their order.
    pub fn insert_all<I>(&self, index: usize, elements: I) -> Result<(), PropertyError>
    where
        I: IntoIterator<Item = E>,
    {
        let len = self.inner.items.read().len();
        if index > len {
            return Err(PropertyError::index_out_of_bounds(index, len));
        }
        for (offset, element) in elements.into_iter().enumerate() {
            self.insert(index + offset, element)?;
        }
        Ok(())
    }

    /// Replace the backing sequence without firing events.
    ///
    /// Observers are not told about the change; use with care.
    pub fn set_silent(&self, items: Vec<E>) {
        *self.inner.items.write() = items;
    }

    /// Empty the list without firing events.
    pub fn reset(&self) {
        self.set_silent(Vec::new());
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Register a strong listener closure.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(PropertyId, &ListChange<E>) + Send + Sync + 'static,
    {
        self.inner.listeners.add_strong(Arc::new(listener))
    }

    /// Register a strong listener object.
    pub fn add_hard_listener<L>(&self, listener: Arc<L>) -> ListenerId
    where
        L: ListListener<E> + 'static,
    {
        self.inner.listeners.add_strong(listener)
    }

    /// Register a weak listener object.
    ///
    /// The list does not keep the listener alive.
    pub fn add_weak_listener<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: ListListener<E> + 'static,
    {
        let listener: Arc<dyn ListListener<E>> = Arc::clone(listener) as _;
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

    /// Suppress or resume element events.
    pub fn set_blocked(&self, blocked: bool) {
        self.inner.listeners.set_blocked(blocked);
    }

    /// Check if element events are currently blocked.
    pub fn is_blocked(&self) -> bool {
        self.inner.listeners.is_blocked()
    }

    // -------------------------------------------------------------------------
    // Cloning
    // -------------------------------------------------------------------------

    /// Create an independent list whose elements are `Clone` copies.
    ///
    /// For reference-counted elements the new list shares them with this
    /// one. No events fire and no listeners are copied.
    pub fn clone_shallow(&self) -> Self {
        Self::from_vec(self.inner.items.read().clone())
    }

    /// Create a weak handle that does not keep the list alive.
    pub fn downgrade(&self) -> WeakListProperty<E> {
        WeakListProperty {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Check whether two handles address the same list.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<E: Clone + PartialEq + Send + Sync + 'static> ListProperty<E> {
    /// Position of the first element equal to `element`.
    pub fn index_of(&self, element: &E) -> Option<usize> {
        self.track_read();
        self.inner.items.read().iter().position(|item| item == element)
    }

    /// Check if the list holds an element equal to `element`.
    pub fn contains(&self, element: &E) -> bool {
        self.index_of(element).is_some()
    }

    /// Remove the first element equal to `element`.
    ///
    /// Returns `false` if there was none.
    pub fn remove_item(&self, element: &E) -> bool {
        let position = self
            .inner
            .items
            .read()
            .iter()
            .position(|item| item == element);
        match position {
            Some(index) => self.remove(index).is_ok(),
            None => false,
        }
    }
}

impl<E: Clone + DeepClone + Send + Sync + 'static> ListProperty<E> {
    /// Create an independent list holding [`DeepClone`] copies of every
    /// element.
    ///
    /// No events fire and no listeners are copied.
    pub fn clone_deep(&self) -> Self {
        let items = self
            .inner
            .items
            .read()
            .iter()
            .map(DeepClone::deep_clone)
            .collect();
        Self::from_vec(items)
    }

    /// Duplicate this list for a new owner using `mode`.
    pub fn clone_for_owner(&self, mode: CloneMode) -> Self {
        match mode {
            CloneMode::Shallow => self.clone_shallow(),
            CloneMode::Deep => self.clone_deep(),
        }
    }
}

impl<E> Clone for ListProperty<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + Sync + 'static> Default for ListProperty<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + Sync + 'static> From<Vec<E>> for ListProperty<E> {
    fn from(items: Vec<E>) -> Self {
        Self::from_vec(items)
    }
}

impl<E: Clone + Send + Sync + 'static> FromIterator<E> for ListProperty<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<E: fmt::Debug> fmt::Debug for ListProperty<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListProperty")
            .field("id", &self.inner.id)
            .field("items", &*self.inner.items.read())
            .finish()
    }
}

/// A non-owning handle to a [`ListProperty`].
pub struct WeakListProperty<E> {
    inner: Weak<ListInner<E>>,
}

impl<E> WeakListProperty<E> {
    /// Get a strong handle if the list is still alive.
    pub fn upgrade(&self) -> Option<ListProperty<E>> {
        self.inner.upgrade().map(|inner| ListProperty { inner })
    }
}

impl<E> Clone for WeakListProperty<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::ComputedProperty;
    use parking_lot::Mutex;

    fn record<E: Clone + Send + Sync + 'static>(
        list: &ListProperty<E>,
    ) -> Arc<Mutex<Vec<ListChange<E>>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        list.add_listener(move |_, change: &ListChange<E>| log_clone.lock().push(change.clone()));
        log
    }

    fn added<E>(index: usize, element: E) -> ListChange<E> {
        ListChange::Added { index, element }
    }

    fn removed<E>(index: usize, element: E) -> ListChange<E> {
        ListChange::Removed { index, element }
    }

    #[test]
    fn test_push_and_insert_events() {
        let list = ListProperty::new();
        let log = record(&list);

        list.push('a');
        list.push('c');
        list.insert(1, 'b').unwrap();

        assert_eq!(list.to_vec(), vec!['a', 'b', 'c']);
        assert_eq!(*log.lock(), vec![added(0, 'a'), added(1, 'c'), added(1, 'b')]);
    }

    #[test]
    fn test_set_fires_removed_then_added() {
        let list = ListProperty::from_vec(vec![1, 2, 3]);
        let log = record(&list);

        assert_eq!(list.set(1, 20), Ok(2));
        assert_eq!(list.to_vec(), vec![1, 20, 3]);
        assert_eq!(*log.lock(), vec![removed(1, 2), added(1, 20)]);
    }

    #[test]
    fn test_clear_removes_highest_index_first() {
        let list = ListProperty::from_vec(vec!["x", "y", "z"]);
        let log = record(&list);

        list.clear();

        assert!(list.is_empty());
        assert_eq!(
            *log.lock(),
            vec![removed(2, "z"), removed(1, "y"), removed(0, "x")]
        );
    }

    #[test]
    fn test_insert_all_keeps_input_order() {
        let list = ListProperty::from_vec(vec![0, 9]);
        let log = record(&list);

        list.insert_all(1, [1, 2, 3]).unwrap();

        assert_eq!(list.to_vec(), vec![0, 1, 2, 3, 9]);
        assert_eq!(*log.lock(), vec![added(1, 1), added(2, 2), added(3, 3)]);
    }

    #[test]
    fn test_extend_appends() {
        let list = ListProperty::from_vec(vec![1]);
        let log = record(&list);

        list.extend(vec![2, 3]);
        assert_eq!(*log.lock(), vec![added(1, 2), added(2, 3)]);
    }

    #[test]
    fn test_remove_item_first_match() {
        let list = ListProperty::from_vec(vec![5, 7, 5]);
        let log = record(&list);

        assert!(list.remove_item(&5));
        assert!(!list.remove_item(&42));

        assert_eq!(list.to_vec(), vec![7, 5]);
        assert_eq!(*log.lock(), vec![removed(0, 5)]);
    }

    #[test]
    fn test_out_of_bounds() {
        let list = ListProperty::from_vec(vec![1]);
        let log = record(&list);

        assert_eq!(list.insert(3, 0), Err(PropertyError::index_out_of_bounds(3, 1)));
        assert_eq!(list.set(1, 0), Err(PropertyError::index_out_of_bounds(1, 1)));
        assert_eq!(list.remove(1), Err(PropertyError::index_out_of_bounds(1, 1)));
        assert!(list.insert_all(2, [7]).is_err());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_reads() {
        let list = ListProperty::from_vec(vec!["a", "b", "a"]);

        assert_eq!(list.len(), 3);
        assert_eq!(list.get(1), Some("b"));
        assert_eq!(list.get(3), None);
        assert_eq!(list.index_of(&"a"), Some(0));
        assert!(list.contains(&"b"));
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["a", "b", "a"]);
        assert_eq!(list.reverse_iter().collect::<Vec<_>>(), vec!["a", "b", "a"]);
        assert_eq!(list.with(|items| items.len()), 3);
    }

    #[test]
    fn test_reverse_iter_order() {
        let list: ListProperty<i32> = (1..=4).collect();
        assert_eq!(list.reverse_iter().collect::<Vec<_>>(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_listener_sees_consistent_list() {
        let list = ListProperty::from_vec(vec![1, 2]);
        let snapshots = Arc::new(Mutex::new(Vec::new()));

        let list_clone = list.clone();
        let snapshots_clone = snapshots.clone();
        list.add_listener(move |_, _| snapshots_clone.lock().push(list_clone.to_vec()));

        list.set(0, 10).unwrap();
        assert_eq!(*snapshots.lock(), vec![vec![10, 2], vec![10, 2]]);
    }

    #[test]
    fn test_silent_replacement() {
        let list = ListProperty::from_vec(vec![1, 2]);
        let log = record(&list);

        list.set_silent(vec![3]);
        assert_eq!(list.to_vec(), vec![3]);
        list.reset();
        assert!(list.is_empty());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_clone_shallow_shares_elements() {
        let shared = Arc::new(Mutex::new(1));
        let list = ListProperty::from_vec(vec![shared.clone()]);
        let log = record(&list);

        let copy = list.clone_shallow();
        assert!(!copy.ptr_eq(&list));
        assert_ne!(copy.id(), list.id());

        *shared.lock() = 2;
        assert_eq!(*copy.get(0).unwrap().lock(), 2);
        assert!(Arc::ptr_eq(&copy.get(0).unwrap(), &shared));
        assert!(log.lock().is_empty());
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Layer {
        name: String,
    }

    #[test]
    fn test_clone_deep_copies_elements() {
        let original = Arc::new(Layer {
            name: "base".to_string(),
        });
        let list = ListProperty::from_vec(vec![original.clone()]);
        let log = record(&list);

        let copy = list.clone_for_owner(CloneMode::Deep);
        let copied = copy.get(0).unwrap();
        assert!(!Arc::ptr_eq(&copied, &original));
        assert_eq!(copied.name, "base");
        assert_eq!(copy.listener_count(), 0);

        let shallow = list.clone_for_owner(CloneMode::Shallow);
        assert!(Arc::ptr_eq(&shallow.get(0).unwrap(), &original));
        assert!(!list.clone_deep().ptr_eq(&list));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_weak_list_listener() {
        struct Counter(Mutex<usize>);
        impl ListListener<i32> for Counter {
            fn list_changed(&self, _: PropertyId, _: &ListChange<i32>) {
                *self.0.lock() += 1;
            }
        }

        let list = ListProperty::new();
        let counter = Arc::new(Counter(Mutex::new(0)));
        list.add_weak_listener(&counter);

        list.push(1);
        assert_eq!(*counter.0.lock(), 1);

        drop(counter);
        list.push(2);
        assert_eq!(list.listener_count(), 0);
    }

    #[test]
    fn test_blocked_list() {
        let list = ListProperty::new();
        let log = record(&list);

        list.set_blocked(true);
        list.push(1);
        list.set_blocked(false);
        list.push(2);

        assert_eq!(*log.lock(), vec![added(1, 2)]);
    }

    #[test]
    fn test_computed_tracks_list() {
        let list = ListProperty::from_vec(vec![1, 2, 3]);
        let total = ComputedProperty::new({
            let list = list.clone();
            move || list.with(|items| items.iter().sum::<i32>())
        });

        assert_eq!(total.get(), 6);
        list.push(4);
        assert_eq!(total.get(), 10);
        list.remove(0).unwrap();
        assert_eq!(total.get(), 9);
    }

    #[test]
    fn test_weak_list_handle() {
        let list = ListProperty::from_vec(vec![1]);
        let weak = list.downgrade();
        assert!(weak.upgrade().is_some());
        drop(list);
        assert!(weak.upgrade().is_none());
    }
}
