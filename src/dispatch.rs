//! A small callback registry for protocol events
//!
//! The transport manager and the VT working sets both deliver events (assembled messages, session
//! terminations) to whoever registered interest. Registration returns a [CallbackHandle] token;
//! holders remove their callback with it, or save it for bulk cleanup on teardown.

use std::collections::BTreeMap;

/// Token identifying one registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackHandle(u64);

/// Dispatches events of type `T` to registered listeners in registration order
pub struct EventDispatcher<T> {
    next_handle: u64,
    listeners: BTreeMap<u64, Box<dyn FnMut(&T) + Send>>,
}

impl<T> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self {
            next_handle: 0,
            listeners: BTreeMap::new(),
        }
    }
}

impl<T> EventDispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, returning the handle that removes it again
    pub fn add_listener<F: FnMut(&T) + Send + 'static>(&mut self, listener: F) -> CallbackHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.listeners.insert(handle, Box::new(listener));
        CallbackHandle(handle)
    }

    /// Remove a listener; removing twice is a no-op
    pub fn remove_listener(&mut self, handle: CallbackHandle) {
        self.listeners.remove(&handle.0);
    }

    /// Invoke every registered listener with `event`
    pub fn invoke(&mut self, event: &T) {
        for listener in self.listeners.values_mut() {
            listener(event);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}
