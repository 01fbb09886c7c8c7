// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{cell::RefCell, collections::HashMap, hash::Hash, rc::Rc};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Observer
///
/// Event dispatch used by the higher level objects of the runtime. Each
/// observable object declares an enumeration of event payloads together with
/// a copyable kind tag, and listeners are registered per kind. Dispatch runs
/// listeners in bind order against a snapshot of the listener list, so a
/// listener that binds or unbinds during a trigger only takes effect on the
/// next trigger.

/// Opaque identifier returned by [Observer::bind], used to unbind.
pub type BindId = u64;

/// Event payloads dispatched through an [Observer].
pub trait Event {
    /// Kind tag used to key listener lists.
    type Kind: Copy + Eq + Hash;

    /// Returns the kind tag of the target event.
    fn kind(&self) -> Self::Kind;
}

type Listener<E> = Rc<RefCell<Box<dyn FnMut(&E)>>>;

/// Observer Data
struct Inner<E: Event> {
    listeners: HashMap<E::Kind, Vec<(BindId, Listener<E>)>>,
    next_id: BindId,
}

/// Observer
pub struct Observer<E: Event> {
    inner: Rc<RefCell<Inner<E>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Observer].
impl<E: Event> Observer<E> {
    /// Creates an observer with no listeners.
    pub fn new() -> Self {
        let inner = Inner {
            listeners: HashMap::new(),
            next_id: 1,
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Binds a listener to the target event kind.
    pub fn bind(&self, kind: E::Kind, listener: impl FnMut(&E) + 'static) -> BindId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .listeners
            .entry(kind)
            .or_insert_with(Vec::new)
            .push((id, Rc::new(RefCell::new(Box::new(listener)))));
        id
    }

    /// Unbinds the listener registered under the given identifier. Returns
    /// whether a listener was actually removed.
    pub fn unbind(&self, kind: E::Kind, id: BindId) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.listeners.get_mut(&kind) {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|(bind_id, _)| *bind_id != id);
                listeners.len() != before
            }
            None => false,
        }
    }

    /// Dispatches an event to the listeners bound to its kind.
    pub fn trigger(&self, event: &E) {
        // Snapshot the listener list so that listeners may bind, unbind or
        // trigger again without re-entering the registry borrow.
        let snapshot: Vec<Listener<E>> = {
            let inner = self.inner.borrow();
            match inner.listeners.get(&event.kind()) {
                Some(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };
        for listener in snapshot {
            let mut callback = listener.borrow_mut();
            (&mut *callback)(event);
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Clone trait implementation for [Observer].
impl<E: Event> Clone for Observer<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Default trait implementation for [Observer].
impl<E: Event> Default for Observer<E> {
    fn default() -> Self {
        Self::new()
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::{Event, Observer};
    use std::{cell::RefCell, rc::Rc};

    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Pong,
    }

    enum Probe {
        Ping(u32),
        Pong,
    }

    impl Event for Probe {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            match self {
                Probe::Ping(..) => Kind::Ping,
                Probe::Pong => Kind::Pong,
            }
        }
    }

    /// Tests if listeners observe events of their kind, in bind order.
    #[test]
    fn observer_dispatch_order() {
        let observer: Observer<Probe> = Observer::new();
        let seen: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        let seen_ = seen.clone();
        observer.bind(Kind::Ping, move |event| {
            if let Probe::Ping(value) = event {
                seen_.borrow_mut().push(*value);
            }
        });
        let seen_ = seen.clone();
        observer.bind(Kind::Ping, move |event| {
            if let Probe::Ping(value) = event {
                seen_.borrow_mut().push(value + 100);
            }
        });

        observer.trigger(&Probe::Ping(1));
        observer.trigger(&Probe::Pong);
        observer.trigger(&Probe::Ping(2));

        assert_eq!(*seen.borrow(), vec![1, 101, 2, 102]);
    }

    /// Tests if an unbound listener stops observing events.
    #[test]
    fn observer_unbind() {
        let observer: Observer<Probe> = Observer::new();
        let count: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));

        let count_ = count.clone();
        let id = observer.bind(Kind::Pong, move |_| *count_.borrow_mut() += 1);

        observer.trigger(&Probe::Pong);
        assert!(observer.unbind(Kind::Pong, id));
        assert!(!observer.unbind(Kind::Pong, id));
        observer.trigger(&Probe::Pong);

        assert_eq!(*count.borrow(), 1);
    }

    /// Tests if a listener bound during a trigger only runs on the next one.
    #[test]
    fn observer_bind_during_trigger() {
        let observer: Observer<Probe> = Observer::new();
        let count: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));

        let observer_ = observer.clone();
        let count_ = count.clone();
        observer.bind(Kind::Ping, move |_| {
            let count__ = count_.clone();
            observer_.bind(Kind::Ping, move |_| *count__.borrow_mut() += 1);
        });

        observer.trigger(&Probe::Ping(0));
        assert_eq!(*count.borrow(), 0);
        observer.trigger(&Probe::Ping(0));
        assert_eq!(*count.borrow(), 1);
    }
}
