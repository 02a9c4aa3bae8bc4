//! # Device shadow synchronization
//!
//! Keeps the remote "desired" state and the local "reported" state of one
//! device eventually consistent over a publish/subscribe transport.
//!
//! ## Protocol
//!
//! [`Synchronizer::attach`] registers observers on the transport's hooks and
//! on the state store, in this order of effect:
//!
//! 1. Every local `set_state` publishes `{"state":{"reported": ...}}` to
//!    `<thing>/shadow/update`.
//! 2. A successful connect subscribes to the shadow response topics and
//!    records each subscription in a ledger.
//! 3. When the last subscription is acknowledged, `<thing>/shadow/get` is
//!    published once. Requesting earlier would race the `get/accepted`
//!    subscription and lose the answer. A subscription the broker refuses
//!    ends the sequence without a request.
//! 4. Messages on `get/accepted` or `update/accepted` carrying a "desired"
//!    section replace the local state, which in turn republishes it as
//!    "reported" through step 1.
//! 5. An unanswered `shadow/get` is repeated a bounded number of times.
//!
//! Only full-state updates are applied; `update/delta` is subscribed but its
//! messages are not merged.
//!
//! ## States
//!
//! ```text
//! Disconnected --connack(0)--> Subscribing --last suback--> AwaitingDesired
//! AwaitingDesired --accepted document--> Synced
//! any --disconnect--> Disconnected
//! ```
//!
//! Errors inside observers never escape: they are logged and kept as
//! [`Synchronizer::last_error`] so one bad message cannot stall the I/O
//! thread.

mod document;
mod ledger;
mod topics;

pub use document::{
    DocumentError, RejectedDocument, decode_desired, decode_rejected, encode_reported,
};
pub use ledger::SubscriptionLedger;
pub use topics::{Route, ShadowTopics};

use crate::network::error::Error;
use crate::network::pubsub::{EventSource, Message, Publisher, SUBSCRIBE_REFUSED, Subscriber};
use crate::state::{State, StateStore};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How long to wait for an answer to `shadow/get` before asking again.
pub const DEFAULT_DESIRED_TIMEOUT: Duration = Duration::from_secs(10);

/// How many times `shadow/get` is repeated before giving up on a connection.
pub const DEFAULT_MAX_GET_RETRIES: u32 = 3;

/// Synchronizer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Prefix in front of the thing name, e.g. `$aws/things`.
    pub topic_root: Option<String>,
    /// Also subscribe to the informational `update/documents` topic.
    pub subscribe_documents: bool,
    /// How long a `shadow/get` may stay unanswered; `desired_timeout_secs` in
    /// configuration files.
    #[serde(rename = "desired_timeout_secs", deserialize_with = "duration_from_secs")]
    pub desired_timeout: Duration,
    /// Repeats of `shadow/get` after the first request.
    pub max_get_retries: u32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            topic_root: None,
            subscribe_documents: false,
            desired_timeout: DEFAULT_DESIRED_TIMEOUT,
            max_get_retries: DEFAULT_MAX_GET_RETRIES,
        }
    }
}

fn duration_from_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Where the synchronizer is within one connection lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No session, or the subscribe sequence was abandoned.
    Disconnected,
    /// Connected; waiting for subscribe acknowledgments.
    Subscribing,
    /// `shadow/get` sent; waiting for the desired state.
    AwaitingDesired,
    /// A desired-state document arrived on this connection.
    Synced,
}

/// Problems seen while running the shadow protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// A message on a shadow topic could not be decoded.
    #[error("unusable shadow document on {topic}: {reason}")]
    Protocol { topic: String, reason: String },
    /// A subscription could not be sent or was refused by the broker.
    #[error("subscribing to {topic} failed: {source}")]
    Subscribe { topic: String, source: Error },
    #[error("publishing to {topic} failed: {source}")]
    Publish { topic: String, source: Error },
    /// The shadow service answered on `get/rejected`.
    #[error("shadow request rejected with code {code}: {message}")]
    Rejected { code: u16, message: String },
    #[error("no answer to shadow/get after {attempts} requests")]
    DesiredTimeout { attempts: u32 },
}

#[derive(Debug)]
struct Progress {
    phase: Phase,
    ledger: SubscriptionLedger,
    requested_at: Option<Instant>,
    get_attempts: u32,
    last_error: Option<SyncError>,
}

struct Inner<T, S> {
    transport: T,
    state: S,
    topics: ShadowTopics,
    config: ShadowConfig,
    progress: Mutex<Progress>,
}

/// Shadow synchronizer for one device.
///
/// Dropping the synchronizer detaches it: the observers it registered stay in
/// place but do nothing once it is gone.
pub struct Synchronizer<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Synchronizer<T, S>
where
    T: Publisher + Subscriber + EventSource + Send + Sync + 'static,
    S: StateStore + Send + Sync + 'static,
{
    /// Wires the protocol into `transport` and `state`.
    ///
    /// Call this once per device, before the transport connects, so the
    /// first CONNACK is seen.
    pub fn attach(transport: T, state: S, config: ShadowConfig) -> Self {
        let topics = ShadowTopics::with_root(config.topic_root.as_deref(), state.identity());
        let inner = Arc::new(Inner {
            transport,
            state,
            topics,
            config,
            progress: Mutex::new(Progress {
                phase: Phase::Disconnected,
                ledger: SubscriptionLedger::new(),
                requested_at: None,
                get_attempts: 0,
                last_error: None,
            }),
        });

        let weak = Arc::downgrade(&inner);
        inner.state.watch(Box::new(move |new_state| {
            if let Some(inner) = weak.upgrade() {
                inner.publish_reported(new_state);
            }
        }));

        let hooks = inner.transport.hooks();
        hooks.on_connect(observer(Arc::downgrade(&inner), |inner, code| {
            inner.on_connect(code)
        }));
        let weak = Arc::downgrade(&inner);
        hooks.on_subscribe(move |packet_id, return_code| {
            if let Some(inner) = weak.upgrade() {
                inner.on_subscribe_ack(packet_id, return_code);
            }
        });
        let weak = Arc::downgrade(&inner);
        hooks.on_message(move |message: &Message| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(message);
            }
        });
        hooks.on_tick(observer(Arc::downgrade(&inner), |inner, now| {
            inner.on_tick(now)
        }));
        hooks.on_disconnect(observer(Arc::downgrade(&inner), |inner, code| {
            inner.on_disconnect(code)
        }));

        Self { inner }
    }

    /// Snapshot of the local state.
    pub fn get_state(&self) -> State {
        self.inner.state.get_state()
    }

    /// Replaces the local state; the new state is published as "reported".
    pub fn set_state(&self, new_state: State) {
        self.inner.state.set_state(new_state)
    }

    /// Current protocol phase.
    pub fn phase(&self) -> Phase {
        self.inner.progress.lock().phase
    }

    /// Subscriptions issued on this connection and not yet acknowledged.
    pub fn pending_subscriptions(&self) -> usize {
        self.inner.progress.lock().ledger.len()
    }

    /// Most recent problem seen by the observers, if any.
    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.progress.lock().last_error.clone()
    }

    /// Topic names used for this device.
    pub fn topics(&self) -> &ShadowTopics {
        &self.inner.topics
    }
}

/// Adapts a method on `Inner` into a hook observer holding only a weak reference.
fn observer<T, S, A>(
    weak: Weak<Inner<T, S>>,
    f: impl Fn(&Inner<T, S>, A) + Send + Sync + 'static,
) -> impl Fn(A) + Send + Sync + 'static
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
{
    move |arg| {
        if let Some(inner) = weak.upgrade() {
            f(&inner, arg)
        }
    }
}

impl<T, S> Inner<T, S>
where
    T: Publisher + Subscriber,
    S: StateStore,
{
    fn publish_reported(&self, new_state: &State) {
        let payload = match encode_reported(new_state) {
            Ok(payload) => payload,
            Err(e) => {
                error!("could not encode reported state: {e}");
                return;
            }
        };
        if let Err(source) = self.transport.publish(&self.topics.update, Some(&payload)) {
            warn!("reported state not published: {source}");
            self.record(SyncError::Publish {
                topic: self.topics.update.clone(),
                source,
            });
        }
    }

    fn on_connect(&self, code: u8) {
        if code != 0 {
            debug!("connect failed with code {code}; not subscribing");
            return;
        }
        {
            let mut progress = self.progress.lock();
            progress.phase = Phase::Subscribing;
            progress.ledger.clear();
            progress.requested_at = None;
            progress.get_attempts = 0;
        }

        for topic in self.topics.subscriptions(self.config.subscribe_documents) {
            match self.transport.subscribe(topic) {
                Ok(packet_id) => self.progress.lock().ledger.insert(packet_id, topic),
                Err(source) => {
                    error!("shadow subscription to {topic} failed: {source}");
                    let mut progress = self.progress.lock();
                    progress.phase = Phase::Disconnected;
                    progress.last_error = Some(SyncError::Subscribe {
                        topic: topic.to_owned(),
                        source,
                    });
                    return;
                }
            }
        }
    }

    fn on_subscribe_ack(&self, packet_id: u16, return_code: u8) {
        let request = {
            let mut progress = self.progress.lock();
            let Some(topic) = progress.ledger.acknowledge(packet_id) else {
                // Other subscribers on the same transport get their acks here too.
                debug!("acknowledgment {packet_id} is not for a shadow subscription");
                return;
            };
            if return_code == SUBSCRIBE_REFUSED {
                error!("broker refused shadow subscription to {topic}");
                progress.phase = Phase::Disconnected;
                progress.ledger.clear();
                progress.requested_at = None;
                progress.last_error = Some(SyncError::Subscribe {
                    topic,
                    source: Error::SubscriptionRefused,
                });
                return;
            }
            if progress.ledger.is_empty() && progress.phase == Phase::Subscribing {
                progress.phase = Phase::AwaitingDesired;
                progress.requested_at = Some(Instant::now());
                progress.get_attempts = 1;
                true
            } else {
                false
            }
        };
        if request {
            info!("shadow subscriptions complete, requesting desired state");
            self.request_desired();
        }
    }

    fn request_desired(&self) {
        if let Err(source) = self.transport.publish(&self.topics.get, None) {
            warn!("desired state request not published: {source}");
            self.record(SyncError::Publish {
                topic: self.topics.get.clone(),
                source,
            });
        }
    }

    fn on_message(&self, message: &Message) {
        match self.topics.route(&message.topic) {
            Route::DesiredState => self.on_desired_state_change(message),
            Route::Rejected => self.on_rejected(message),
            Route::Ignored => {}
        }
    }

    fn on_desired_state_change(&self, message: &Message) {
        let desired = match decode_desired(&message.payload) {
            Ok(desired) => desired,
            Err(e) => {
                warn!("dropping shadow message on {}: {e}", message.topic);
                self.record(SyncError::Protocol {
                    topic: message.topic.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        };

        {
            let mut progress = self.progress.lock();
            if progress.phase == Phase::AwaitingDesired {
                progress.phase = Phase::Synced;
                progress.requested_at = None;
            }
        }

        match desired {
            Some(desired) => {
                info!("applying desired state from {}", message.topic);
                self.state.set_state(desired);
            }
            None => debug!("no desired section on {}", message.topic),
        }
    }

    fn on_rejected(&self, message: &Message) {
        let error = match decode_rejected(&message.payload) {
            Ok(rejected) => {
                warn!("shadow request rejected ({}): {}", rejected.code, rejected.message);
                SyncError::Rejected {
                    code: rejected.code,
                    message: rejected.message.to_owned(),
                }
            }
            Err(e) => {
                warn!("unreadable rejection on {}: {e}", message.topic);
                SyncError::Protocol {
                    topic: message.topic.clone(),
                    reason: e.to_string(),
                }
            }
        };

        let mut progress = self.progress.lock();
        // Answered, even if negatively; asking again will not help.
        progress.requested_at = None;
        progress.last_error = Some(error);
    }

    fn on_tick(&self, now: Instant) {
        let retry = {
            let mut progress = self.progress.lock();
            let Some(requested_at) = progress.requested_at else {
                return;
            };
            if progress.phase != Phase::AwaitingDesired
                || now.saturating_duration_since(requested_at) < self.config.desired_timeout
            {
                return;
            }
            if progress.get_attempts > self.config.max_get_retries {
                error!("no desired state after {} requests", progress.get_attempts);
                progress.requested_at = None;
                progress.last_error = Some(SyncError::DesiredTimeout {
                    attempts: progress.get_attempts,
                });
                false
            } else {
                progress.get_attempts += 1;
                progress.requested_at = Some(now);
                true
            }
        };
        if retry {
            warn!("desired state request timed out, asking again");
            self.request_desired();
        }
    }

    fn on_disconnect(&self, code: u8) {
        debug!("transport disconnected with code {code}");
        let mut progress = self.progress.lock();
        progress.phase = Phase::Disconnected;
        progress.ledger.clear();
        progress.requested_at = None;
    }

    fn record(&self, error: SyncError) {
        self.progress.lock().last_error = Some(error);
    }
}

impl<T, S: StateStore> fmt::Debug for Synchronizer<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let progress = self.inner.progress.lock();
        f.debug_struct("Synchronizer")
            .field("thing", &self.inner.state.identity())
            .field("phase", &progress.phase)
            .field("pending_subscriptions", &progress.ledger.len())
            .finish()
    }
}
