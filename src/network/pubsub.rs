//! Publish/subscribe seam between a transport and the layers above it.
//!
//! A transport exposes two narrow capabilities, [`Publisher`] and
//! [`Subscriber`], and a set of [`Hooks`]. Each hook is an ordered list of
//! observers; registering an observer never replaces an earlier one, and
//! observers run in the order they were registered. All observers of one
//! transport are invoked from the transport's I/O thread, one at a time.

use crate::network::error::Error;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Disconnect code reported when the application asked for the disconnect.
pub const DISCONNECT_REQUESTED: u8 = 0;

/// Disconnect code reported when the connection failed underneath us.
pub const DISCONNECT_LOST: u8 = 0xFF;

/// Subscribe-acknowledgment code a broker uses to refuse a subscription.
/// Any other code is the granted QoS.
pub const SUBSCRIBE_REFUSED: u8 = 0x80;

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a message from anything that converts into its parts.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Sends application messages.
///
/// Delivery is at-least-once. `Ok` only means the message was handed to the
/// connection; a failure after that shows up as a disconnect event.
pub trait Publisher {
    /// Publishes `payload` on `topic`. `None` publishes an empty message.
    fn publish(&self, topic: &str, payload: Option<&[u8]>) -> Result<(), Error>;
}

/// Issues subscriptions.
pub trait Subscriber {
    /// Requests a subscription to `topic` and returns the identifier that the
    /// matching subscribe-acknowledgment event will carry.
    fn subscribe(&self, topic: &str) -> Result<u16, Error>;
}

/// Anything that delivers transport events through [`Hooks`].
pub trait EventSource {
    /// The observer lists this source emits into.
    fn hooks(&self) -> &Hooks;
}

impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    fn publish(&self, topic: &str, payload: Option<&[u8]>) -> Result<(), Error> {
        (**self).publish(topic, payload)
    }
}

impl<T: Subscriber + ?Sized> Subscriber for Arc<T> {
    fn subscribe(&self, topic: &str) -> Result<u16, Error> {
        (**self).subscribe(topic)
    }
}

impl<T: EventSource + ?Sized> EventSource for Arc<T> {
    fn hooks(&self) -> &Hooks {
        (**self).hooks()
    }
}

type CodeObserver = Arc<dyn Fn(u8) + Send + Sync>;
type MessageObserver = Arc<dyn Fn(&Message) + Send + Sync>;
type AckObserver = Arc<dyn Fn(u16, u8) + Send + Sync>;
type TickObserver = Arc<dyn Fn(Instant) + Send + Sync>;

/// Ordered observer lists, one per transport event.
///
/// Emitting takes a snapshot of the list first, so an observer may register
/// further observers without deadlocking; those only see later events.
#[derive(Default)]
pub struct Hooks {
    connect: RwLock<Vec<CodeObserver>>,
    message: RwLock<Vec<MessageObserver>>,
    subscribe: RwLock<Vec<AckObserver>>,
    disconnect: RwLock<Vec<CodeObserver>>,
    tick: RwLock<Vec<TickObserver>>,
}

impl Hooks {
    /// Empty observer lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observes CONNACK results; `0` means the session is open.
    pub fn on_connect(&self, observer: impl Fn(u8) + Send + Sync + 'static) {
        self.connect.write().push(Arc::new(observer));
    }

    /// Observes messages arriving on subscribed topics.
    pub fn on_message(&self, observer: impl Fn(&Message) + Send + Sync + 'static) {
        self.message.write().push(Arc::new(observer));
    }

    /// Observes subscribe acknowledgments: the identifier returned by
    /// [`Subscriber::subscribe`] and the broker's code, either the granted QoS
    /// or [`SUBSCRIBE_REFUSED`].
    pub fn on_subscribe(&self, observer: impl Fn(u16, u8) + Send + Sync + 'static) {
        self.subscribe.write().push(Arc::new(observer));
    }

    /// Observes the end of a session; see [`DISCONNECT_REQUESTED`] and
    /// [`DISCONNECT_LOST`].
    pub fn on_disconnect(&self, observer: impl Fn(u8) + Send + Sync + 'static) {
        self.disconnect.write().push(Arc::new(observer));
    }

    /// Observes idle turns of the I/O loop.
    pub fn on_tick(&self, observer: impl Fn(Instant) + Send + Sync + 'static) {
        self.tick.write().push(Arc::new(observer));
    }

    // Transports call these; tests use them to stand in for a broker.

    /// Runs the connect observers.
    pub fn emit_connect(&self, code: u8) {
        for observer in snapshot(&self.connect) {
            observer(code);
        }
    }

    /// Runs the message observers.
    pub fn emit_message(&self, message: &Message) {
        for observer in snapshot(&self.message) {
            observer(message);
        }
    }

    /// Runs the subscribe-acknowledgment observers.
    pub fn emit_subscribe(&self, packet_id: u16, return_code: u8) {
        for observer in snapshot(&self.subscribe) {
            observer(packet_id, return_code);
        }
    }

    /// Runs the disconnect observers.
    pub fn emit_disconnect(&self, code: u8) {
        for observer in snapshot(&self.disconnect) {
            observer(code);
        }
    }

    /// Runs the tick observers.
    pub fn emit_tick(&self, now: Instant) {
        for observer in snapshot(&self.tick) {
            observer(now);
        }
    }
}

fn snapshot<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    list.read().clone()
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("connect", &self.connect.read().len())
            .field("message", &self.message.read().len())
            .field("subscribe", &self.subscribe.read().len())
            .field("disconnect", &self.disconnect.read().len())
            .field("tick", &self.tick.read().len())
            .finish()
    }
}
