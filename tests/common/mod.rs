//! Mocks shared by the integration tests.

#![allow(dead_code)]

use libiot_gateway::network::error::Error;
use libiot_gateway::network::pubsub::{EventSource, Hooks, Publisher, Subscriber};
use libiot_gateway::network::{Close, Connection, Read, Write};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::{Duration, Instant};

/// In-memory connection whose both ends stay reachable from the test.
///
/// Bytes handed to [`MockConnection::feed`] are readable right away, in any
/// split; a read that finds nothing returns `Ok(0)` like a timed-out socket.
#[derive(Clone, Default)]
pub struct MockConnection {
    inbound: Arc<Mutex<VecDeque<u8>>>,
    outbound: Arc<Mutex<Vec<u8>>>,
    fail_reads: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, packet: &[u8]) {
        self.inbound.lock().extend(packet.iter().copied());
    }

    pub fn written(&self) -> Vec<u8> {
        self.outbound.lock().clone()
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.outbound.lock())
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Read for MockConnection {
    type Error = Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.fail_reads.load(Ordering::Acquire) {
            return Err(Error::ReadError);
        }
        let mut inbound = self.inbound.lock();
        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockConnection {
    type Error = Error;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::WriteError);
        }
        self.outbound.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Close for MockConnection {
    type Error = Error;

    fn close(self) -> Result<(), Self::Error> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

impl Connection for MockConnection {}

/// Transport double recording what the layers above it send.
///
/// Subscribe identifiers count up from 1. Events are injected with
/// [`EventSource::hooks`], e.g. `transport.hooks().emit_connect(0)`.
pub struct MockTransport {
    hooks: Hooks,
    next_id: AtomicU16,
    published: Mutex<Vec<(String, Option<Vec<u8>>)>>,
    subscribed: Mutex<Vec<(String, u16)>>,
    fail_subscribe: Mutex<Option<String>>,
    fail_publish: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            hooks: Hooks::new(),
            next_id: AtomicU16::new(1),
            published: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            fail_subscribe: Mutex::new(None),
            fail_publish: AtomicBool::new(false),
        }
    }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<(String, Option<Vec<u8>>)> {
        self.published.lock().clone()
    }

    /// Payloads published to `topic`, in order.
    pub fn published_to(&self, topic: &str) -> Vec<Option<Vec<u8>>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn clear_published(&self) {
        self.published.lock().clear();
    }

    pub fn subscriptions(&self) -> Vec<(String, u16)> {
        self.subscribed.lock().clone()
    }

    pub fn clear_subscriptions(&self) {
        self.subscribed.lock().clear();
    }

    /// Makes the next subscribe to `topic` fail.
    pub fn fail_subscribe_to(&self, topic: &str) {
        *self.fail_subscribe.lock() = Some(topic.to_owned());
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::Release);
    }

    /// Acknowledges every subscription recorded so far with QoS 1.
    pub fn ack_all(&self) {
        let ids: Vec<u16> = self.subscribed.lock().iter().map(|(_, id)| *id).collect();
        for id in ids {
            self.hooks.emit_subscribe(id, 1);
        }
    }

    /// Connects and acknowledges every subscription the connect produced.
    pub fn connect_and_ack(&self) {
        self.clear_subscriptions();
        self.hooks.emit_connect(0);
        self.ack_all();
    }
}

impl Publisher for MockTransport {
    fn publish(&self, topic: &str, payload: Option<&[u8]>) -> Result<(), Error> {
        if self.fail_publish.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }
        self.published
            .lock()
            .push((topic.to_owned(), payload.map(<[u8]>::to_vec)));
        Ok(())
    }
}

impl Subscriber for MockTransport {
    fn subscribe(&self, topic: &str) -> Result<u16, Error> {
        let mut fail = self.fail_subscribe.lock();
        if fail.as_deref() == Some(topic) {
            *fail = None;
            return Err(Error::WriteError);
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.subscribed.lock().push((topic.to_owned(), id));
        Ok(id)
    }
}

impl EventSource for MockTransport {
    fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

/// Converts a JSON object literal into a state map.
pub fn state(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

pub fn json(payload: &Option<Vec<u8>>) -> Value {
    let bytes = payload.as_deref().expect("payload expected");
    serde_json::from_slice(bytes).expect("payload is JSON")
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Broker-side packet builders.
pub mod packets {
    fn with_header(header: u8, body: &[u8]) -> Vec<u8> {
        let mut packet = vec![header];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if len == 0 {
                break;
            }
        }
        packet.extend_from_slice(body);
        packet
    }

    pub fn connack(return_code: u8) -> Vec<u8> {
        vec![0x20, 0x02, 0x00, return_code]
    }

    pub fn suback(packet_id: u16, return_code: u8) -> Vec<u8> {
        let id = packet_id.to_be_bytes();
        vec![0x90, 0x03, id[0], id[1], return_code]
    }

    pub fn puback(packet_id: u16) -> Vec<u8> {
        let id = packet_id.to_be_bytes();
        vec![0x40, 0x02, id[0], id[1]]
    }

    pub fn pingresp() -> Vec<u8> {
        vec![0xD0, 0x00]
    }

    /// QoS 1 PUBLISH from the broker.
    pub fn publish(topic: &str, payload: &[u8], packet_id: u16) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(&packet_id.to_be_bytes());
        body.extend_from_slice(payload);
        with_header(0x32, &body)
    }

    /// QoS 0 PUBLISH from the broker.
    pub fn publish_qos0(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload);
        with_header(0x30, &body)
    }
}
