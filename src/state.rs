//! Device state holder.
//!
//! [`DeviceState`] owns the key/value state of one device together with its
//! thing identity. Every successful [`set_state`](StateStore::set_state)
//! notifies the registered change observers, which is how the shadow
//! synchronizer turns local changes into "reported" updates.

use log::debug;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Device state: string keys mapped to arbitrary JSON values.
pub type State = Map<String, Value>;

type ChangeObserver = Arc<dyn Fn(&State) + Send + Sync>;

/// Read/write access to a device's state.
pub trait StateStore {
    /// Returns a snapshot of the current state.
    fn get_state(&self) -> State;

    /// Replaces the state wholesale and notifies change observers.
    fn set_state(&self, new_state: State);

    /// Stable identifier used to name the device's topics.
    fn identity(&self) -> &str;

    /// Registers an observer run after every `set_state`, in registration order.
    fn watch(&self, observer: Box<dyn Fn(&State) + Send + Sync>);
}

/// The default [`StateStore`].
///
/// Concurrent `set_state` calls are serialized: the last writer wins, and
/// observers see the values in the same order they were stored.
pub struct DeviceState {
    thing_name: String,
    state: RwLock<State>,
    observers: RwLock<Vec<ChangeObserver>>,
    writer: Mutex<()>,
}

impl DeviceState {
    /// Creates an empty state for `thing_name`.
    pub fn new(thing_name: impl Into<String>) -> Self {
        Self::with_state(thing_name, State::new())
    }

    pub fn with_state(thing_name: impl Into<String>, initial: State) -> Self {
        Self {
            thing_name: thing_name.into(),
            state: RwLock::new(initial),
            observers: RwLock::new(Vec::new()),
            writer: Mutex::new(()),
        }
    }

    /// Reads a single key without cloning the whole state.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }
}

impl StateStore for DeviceState {
    fn get_state(&self) -> State {
        self.state.read().clone()
    }

    fn set_state(&self, new_state: State) {
        let _writer = self.writer.lock();
        *self.state.write() = new_state.clone();
        debug!("state of {} replaced ({} keys)", self.thing_name, new_state.len());

        let observers = self.observers.read().clone();
        for observer in observers {
            observer(&new_state);
        }
    }

    fn identity(&self) -> &str {
        &self.thing_name
    }

    fn watch(&self, observer: Box<dyn Fn(&State) + Send + Sync>) {
        self.observers.write().push(Arc::from(observer));
    }
}

impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn get_state(&self) -> State {
        (**self).get_state()
    }

    fn set_state(&self, new_state: State) {
        (**self).set_state(new_state)
    }

    fn identity(&self) -> &str {
        (**self).identity()
    }

    fn watch(&self, observer: Box<dyn Fn(&State) + Send + Sync>) {
        (**self).watch(observer)
    }
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("thing_name", &self.thing_name)
            .field("state", &*self.state.read())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}
