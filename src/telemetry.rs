//! Telemetry publishing.
//!
//! Telemetry goes to `<telemetry_topic>/<org_id>/<client_id>` and is only sent
//! while the session is up and the device state has `sendTelemetryData` set
//! to `true`. The operator flips that key through the shadow's desired state.
//!
//! The ingest service answers bad messages on
//! `<stage>/telemetryData/<client_id>/rejected`; [`RejectedTelemetry`]
//! subscribes to it after every connect and logs what arrives.

use crate::network::error::Error;
use crate::network::pubsub::{EventSource, Message, Publisher, Subscriber};
use crate::state::StateStore;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// State key that switches telemetry on and off.
pub const SEND_TELEMETRY_KEY: &str = "sendTelemetryData";

/// Why a telemetry message was not sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TelemetryError {
    #[error("not connected")]
    NotConnected,
    #[error("telemetry is switched off by \"sendTelemetryData\"")]
    Disabled,
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("telemetry publish failed: {0}")]
    Publish(#[from] Error),
}

/// A message failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid telemetry message: {reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Checks outbound telemetry before it is published.
pub trait EventValidator {
    fn validate(&self, message: &[u8]) -> Result<(), ValidationError>;
}

impl<F> EventValidator for F
where
    F: Fn(&[u8]) -> Result<(), ValidationError>,
{
    fn validate(&self, message: &[u8]) -> Result<(), ValidationError> {
        self(message)
    }
}

/// Requires a JSON object carrying every listed top-level field.
///
/// Covers the event header (`headerversion`, `eventtype`, ...) without a
/// schema engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredFields {
    fields: Vec<String>,
}

impl RequiredFields {
    pub fn new<I, F>(fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl EventValidator for RequiredFields {
    fn validate(&self, message: &[u8]) -> Result<(), ValidationError> {
        let value: Value = serde_json::from_slice(message)
            .map_err(|e| ValidationError::new(format!("not JSON: {e}")))?;
        let Value::Object(object) = value else {
            return Err(ValidationError::new("not a JSON object"));
        };
        match self.fields.iter().find(|field| !object.contains_key(field.as_str())) {
            Some(missing) => Err(ValidationError::new(format!("missing \"{missing}\""))),
            None => Ok(()),
        }
    }
}

/// `<telemetry_topic>/<org_id>/<client_id>`.
pub fn telemetry_topic(base: &str, org_id: &str, client_id: &str) -> String {
    format!("{}/{org_id}/{client_id}", base.trim_end_matches('/'))
}

/// `<stage>/telemetryData/<client_id>/rejected`.
pub fn rejected_topic(stage: &str, client_id: &str) -> String {
    format!("{stage}/telemetryData/{client_id}/rejected")
}

type BoxedValidator = Box<dyn EventValidator + Send + Sync>;

/// Publishes telemetry for one device.
pub struct TelemetryPublisher<P, S> {
    publisher: P,
    state: S,
    topic: String,
    connected: Arc<AtomicBool>,
    validator: Option<BoxedValidator>,
}

impl<P, S> TelemetryPublisher<P, S>
where
    P: Publisher + EventSource,
    S: StateStore,
{
    /// Tracks the session through `publisher`'s hooks; create it before
    /// connecting.
    pub fn new(publisher: P, state: S, topic: impl Into<String>) -> Self {
        let connected = Arc::new(AtomicBool::new(false));
        let hooks = publisher.hooks();
        let on_connect = Arc::downgrade(&connected);
        hooks.on_connect(move |code| {
            if let Some(flag) = on_connect.upgrade() {
                flag.store(code == 0, Ordering::Release);
            }
        });
        let on_disconnect = Arc::downgrade(&connected);
        hooks.on_disconnect(move |_| {
            if let Some(flag) = on_disconnect.upgrade() {
                flag.store(false, Ordering::Release);
            }
        });

        Self {
            publisher,
            state,
            topic: topic.into(),
            connected,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: impl EventValidator + Send + Sync + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// `true` when the state currently allows telemetry.
    pub fn is_enabled(&self) -> bool {
        matches!(
            self.state.get_state().get(SEND_TELEMETRY_KEY),
            Some(Value::Bool(true))
        )
    }

    /// Validates and publishes `message`.
    ///
    /// # Errors
    ///
    /// * [`TelemetryError::NotConnected`] - No session is open
    /// * [`TelemetryError::Disabled`] - `sendTelemetryData` is not `true`
    /// * [`TelemetryError::Invalid`] - The validator refused the message
    /// * [`TelemetryError::Publish`] - The transport failed to send it
    pub fn publish(&self, message: &[u8]) -> Result<(), TelemetryError> {
        if !self.is_connected() {
            debug!("telemetry dropped: not connected");
            return Err(TelemetryError::NotConnected);
        }
        if !self.is_enabled() {
            debug!("telemetry dropped: {SEND_TELEMETRY_KEY} is not set");
            return Err(TelemetryError::Disabled);
        }
        if let Some(validator) = &self.validator {
            validator.validate(message).inspect_err(|e| warn!("{e}"))?;
        }
        self.publisher.publish(&self.topic, Some(message))?;
        Ok(())
    }
}

impl<P, S> fmt::Debug for TelemetryPublisher<P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryPublisher")
            .field("topic", &self.topic)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

struct RejectedInner<T> {
    transport: T,
    topic: String,
    count: AtomicUsize,
    last: Mutex<Option<Message>>,
}

/// Listens for telemetry the ingest service refused.
pub struct RejectedTelemetry<T> {
    inner: Arc<RejectedInner<T>>,
}

impl<T> RejectedTelemetry<T>
where
    T: Subscriber + EventSource + Send + Sync + 'static,
{
    pub fn attach(transport: T, stage: &str, client_id: &str) -> Self {
        let inner = Arc::new(RejectedInner {
            transport,
            topic: rejected_topic(stage, client_id),
            count: AtomicUsize::new(0),
            last: Mutex::new(None),
        });

        let hooks = inner.transport.hooks();
        let weak: Weak<RejectedInner<T>> = Arc::downgrade(&inner);
        hooks.on_connect(move |code| {
            let Some(inner) = weak.upgrade() else { return };
            if code != 0 {
                return;
            }
            match inner.transport.subscribe(&inner.topic) {
                Ok(_) => info!("listening for rejected telemetry on {}", inner.topic),
                Err(e) => warn!("subscription to {} failed: {e}", inner.topic),
            }
        });
        let weak: Weak<RejectedInner<T>> = Arc::downgrade(&inner);
        hooks.on_message(move |message: &Message| {
            let Some(inner) = weak.upgrade() else { return };
            if message.topic != inner.topic {
                return;
            }
            warn!(
                "telemetry rejected: {}",
                String::from_utf8_lossy(&message.payload)
            );
            inner.count.fetch_add(1, Ordering::AcqRel);
            *inner.last.lock() = Some(message.clone());
        });

        Self { inner }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Number of rejections received so far.
    pub fn rejections(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub fn last_rejection(&self) -> Option<Message> {
        self.inner.last.lock().clone()
    }
}

impl<T> fmt::Debug for RejectedTelemetry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectedTelemetry")
            .field("topic", &self.inner.topic)
            .field("rejections", &self.inner.count.load(Ordering::Relaxed))
            .finish()
    }
}
