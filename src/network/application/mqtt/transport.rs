//! Threaded MQTT session with event hooks.
//!
//! [`Transport`] owns one [`Client`] and a background thread that polls it.
//! Every packet the broker sends is turned into a [`Hooks`] event on that
//! thread, so all observers of a transport run strictly one after another.
//! That includes the disconnect event: [`Transport::disconnect`] asks the I/O
//! thread to end the session and waits for it. Publishing and subscribing
//! happen on the caller's thread; they only take the client lock long enough
//! to write a packet.
//!
//! Everything is sent with QoS 1. Inbound QoS 1 messages are acknowledged
//! before the message observers run.

use super::client::{Client, Options, Packet, QoS};
use crate::network::error::Error;
use crate::network::pubsub::{
    DISCONNECT_LOST, DISCONNECT_REQUESTED, EventSource, Hooks, Message, Publisher,
    SUBSCRIBE_REFUSED, Subscriber,
};
use crate::network::{Connect, Connection};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Keep-alive the reference gateway negotiates with the broker.
pub const DEFAULT_KEEP_ALIVE_SECONDS: u16 = 120;

/// Sleep between polls when the connection has nothing to read.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(50);

/// Session settings owned by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Client identifier, normally the thing name.
    pub client_id: String,
    /// Keep-alive negotiated in CONNECT; 0 disables pings.
    pub keep_alive_seconds: u16,
    /// Ask the broker to discard any stored session.
    pub clean_session: bool,
    /// How long the I/O thread sleeps after a poll that returned nothing.
    pub idle_interval: Duration,
}

impl TransportOptions {
    /// Defaults for `client_id`: 120 s keep-alive, clean session.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            keep_alive_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
            clean_session: true,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }
}

struct Shared<C: Connection> {
    options: TransportOptions,
    client: Mutex<Option<Client<C>>>,
    hooks: Hooks,
    connected: AtomicBool,
    running: AtomicBool,
    stop_requested: AtomicBool,
    last_outbound: Mutex<Instant>,
}

/// One MQTT session driven by a background thread.
pub struct Transport<C: Connection> {
    handle: TransportHandle<C>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap, cloneable publish/subscribe capability of a [`Transport`].
///
/// Handles do not keep the I/O thread alive and do not own the session; once
/// the transport disconnects, every operation fails with [`Error::NotOpen`].
pub struct TransportHandle<C: Connection> {
    shared: Arc<Shared<C>>,
}

impl<C: Connection> Clone for TransportHandle<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connection + Send + 'static> Transport<C> {
    /// Creates an idle transport; nothing happens until [`connect`](Self::connect).
    pub fn new(options: TransportOptions) -> Self {
        let shared = Shared {
            options,
            client: Mutex::new(None),
            hooks: Hooks::new(),
            connected: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            last_outbound: Mutex::new(Instant::now()),
        };
        Self {
            handle: TransportHandle {
                shared: Arc::new(shared),
            },
            worker: Mutex::new(None),
        }
    }

    /// A publish/subscribe handle sharing this transport's session and hooks.
    pub fn handle(&self) -> TransportHandle<C> {
        self.handle.clone()
    }

    /// Settings the transport was created with.
    pub fn options(&self) -> &TransportOptions {
        &self.handle.shared.options
    }

    /// `true` between a successful CONNACK and the next disconnect.
    pub fn is_connected(&self) -> bool {
        self.handle.shared.connected.load(Ordering::Acquire)
    }

    /// Sends CONNECT over `connection` and starts the I/O thread.
    ///
    /// Returns as soon as the CONNECT packet is written. The broker's answer
    /// reaches the connect observers from the I/O thread.
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyConnected`] - A session is already running
    /// * [`Error::WriteError`] - The CONNECT packet could not be written
    /// * [`Error::NotOpen`] - The I/O thread could not be started
    pub fn connect(&self, connection: C) -> Result<(), Error> {
        let shared = &self.handle.shared;
        if shared.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyConnected);
        }
        shared.stop_requested.store(false, Ordering::Release);

        let mut client = Client::new(connection);
        let options = Options {
            client_id: &shared.options.client_id,
            keep_alive_seconds: shared.options.keep_alive_seconds,
            clean_session: shared.options.clean_session,
        };
        if let Err(e) = client.send_connect(&options) {
            shared.running.store(false, Ordering::Release);
            return Err(e);
        }
        *shared.client.lock() = Some(client);
        *shared.last_outbound.lock() = Instant::now();

        let io_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("mqtt-{}", shared.options.client_id))
            .spawn(move || run_io(io_shared));
        match spawned {
            Ok(worker) => {
                info!("connecting as {}", shared.options.client_id);
                *self.worker.lock() = Some(worker);
                Ok(())
            }
            Err(e) => {
                error!("failed to start MQTT I/O thread: {e}");
                shared.client.lock().take();
                shared.running.store(false, Ordering::Release);
                Err(Error::NotOpen)
            }
        }
    }

    /// Opens a connection to `remote` with `network`, then [`connect`](Self::connect)s.
    pub fn connect_to<N>(&self, network: &mut N, remote: &str) -> Result<(), Error>
    where
        N: Connect<Connection = C>,
    {
        let connection = network.connect(remote).map_err(|e| {
            warn!("could not reach {remote}: {e:?}");
            Error::ConnectionClosed
        })?;
        self.connect(connection)
    }
}

impl<C: Connection> Transport<C> {
    /// Ends the session. Best effort: errors are logged, not returned.
    ///
    /// Disconnect observers see [`DISCONNECT_REQUESTED`]. They run on the I/O
    /// thread after any observer still in progress, and this call returns
    /// once they are done. Calling this from a hook is allowed; the session
    /// is then closed right away and the I/O thread winds down on its own.
    pub fn disconnect(&self) {
        let shared = &self.handle.shared;
        let worker = self.worker.lock().take();
        match worker {
            Some(worker) if worker.thread().id() != thread::current().id() => {
                shared.stop_requested.store(true, Ordering::Release);
                if worker.join().is_err() {
                    error!("MQTT I/O thread panicked");
                }
            }
            _ => {}
        }
        // No-op unless the session outlived its I/O thread.
        shared.close_session(DISCONNECT_REQUESTED);
    }
}

impl<C: Connection> Drop for Transport<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<C: Connection> Shared<C> {
    fn with_client<T>(&self, f: impl FnOnce(&mut Client<C>) -> Result<T, Error>) -> Result<T, Error> {
        let mut guard = self.client.lock();
        let client = guard.as_mut().ok_or(Error::NotOpen)?;
        let result = f(client);
        if result.is_ok() {
            *self.last_outbound.lock() = Instant::now();
        }
        result
    }

    /// Tears the session down once; only the first caller notifies observers.
    fn close_session(&self, code: u8) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        let client = self.client.lock().take();
        self.connected.store(false, Ordering::Release);

        if let Some(client) = client {
            if code == DISCONNECT_REQUESTED {
                if let Err(e) = client.disconnect() {
                    debug!("DISCONNECT not delivered: {e}");
                }
            }
        }
        if was_running {
            info!("session for {} closed (code {code})", self.options.client_id);
            self.hooks.emit_disconnect(code);
        }
    }

    fn dispatch(&self, packet: Packet) {
        match packet {
            Packet::ConnAck { return_code, .. } => {
                if return_code == 0 {
                    info!("connected as {}", self.options.client_id);
                    self.connected.store(true, Ordering::Release);
                } else {
                    warn!("broker refused connection with code {return_code}");
                }
                self.hooks.emit_connect(return_code);
                if return_code != 0 {
                    self.close_session(return_code);
                }
            }
            Packet::Publish(publish) => {
                if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
                    if let Err(e) = self.with_client(|client| client.puback(packet_id)) {
                        warn!("PUBACK {packet_id} not sent: {e}");
                    }
                }
                let message = Message::new(publish.topic.as_str(), publish.payload.as_slice());
                debug!("message on {}", message.topic);
                self.hooks.emit_message(&message);
            }
            Packet::SubAck {
                packet_id,
                return_code,
            } => {
                if return_code == SUBSCRIBE_REFUSED {
                    warn!("broker rejected subscription {packet_id}");
                }
                self.hooks.emit_subscribe(packet_id, return_code);
            }
            Packet::PubAck { packet_id } => trace!("publish {packet_id} acknowledged"),
            Packet::PingResp => trace!("ping answered"),
        }
    }

    fn keep_alive(&self) {
        let keep_alive = self.options.keep_alive_seconds;
        if keep_alive == 0 || !self.connected.load(Ordering::Acquire) {
            return;
        }
        let due = Duration::from_secs(u64::from(keep_alive)) / 2;
        if self.last_outbound.lock().elapsed() >= due {
            if let Err(e) = self.with_client(|client| client.ping()) {
                warn!("PINGREQ not sent: {e}");
            }
        }
    }
}

fn run_io<C: Connection>(shared: Arc<Shared<C>>) {
    debug!("I/O loop for {} started", shared.options.client_id);
    while shared.running.load(Ordering::Acquire) {
        if shared.stop_requested.load(Ordering::Acquire) {
            shared.close_session(DISCONNECT_REQUESTED);
            break;
        }
        let polled = match shared.client.lock().as_mut() {
            Some(client) => client.poll(),
            None => break,
        };
        match polled {
            Ok(Some(packet)) => shared.dispatch(packet),
            Ok(None) => {
                shared.keep_alive();
                shared.hooks.emit_tick(Instant::now());
                thread::sleep(shared.options.idle_interval);
            }
            Err(e) => {
                if shared.running.load(Ordering::Acquire) {
                    error!("connection for {} failed: {e}", shared.options.client_id);
                    shared.close_session(DISCONNECT_LOST);
                }
                break;
            }
        }
    }
    debug!("I/O loop for {} stopped", shared.options.client_id);
}

impl<C: Connection> Publisher for TransportHandle<C> {
    fn publish(&self, topic: &str, payload: Option<&[u8]>) -> Result<(), Error> {
        let payload = payload.unwrap_or_default();
        debug!("publishing {} bytes to {topic}", payload.len());
        self.shared
            .with_client(|client| client.publish(topic, payload, QoS::AtLeastOnce))
            .map(|_| ())
    }
}

impl<C: Connection> Subscriber for TransportHandle<C> {
    fn subscribe(&self, topic: &str) -> Result<u16, Error> {
        let packet_id = self
            .shared
            .with_client(|client| client.subscribe(topic, QoS::AtLeastOnce))?;
        info!("subscribing to {topic} (packet {packet_id})");
        Ok(packet_id)
    }
}

impl<C: Connection> EventSource for TransportHandle<C> {
    fn hooks(&self) -> &Hooks {
        &self.shared.hooks
    }
}

impl<C: Connection> TransportHandle<C> {
    /// `true` between a successful CONNACK and the next disconnect.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl<C: Connection + Send + 'static> Publisher for Transport<C> {
    fn publish(&self, topic: &str, payload: Option<&[u8]>) -> Result<(), Error> {
        self.handle.publish(topic, payload)
    }
}

impl<C: Connection + Send + 'static> Subscriber for Transport<C> {
    fn subscribe(&self, topic: &str) -> Result<u16, Error> {
        self.handle.subscribe(topic)
    }
}

impl<C: Connection> EventSource for Transport<C> {
    fn hooks(&self) -> &Hooks {
        &self.handle.shared.hooks
    }
}

impl<C: Connection> fmt::Debug for Transport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("options", &self.handle.shared.options)
            .field("connected", &self.handle.shared.connected.load(Ordering::Relaxed))
            .field("hooks", &self.handle.shared.hooks)
            .finish()
    }
}

impl<C: Connection> fmt::Debug for TransportHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("client_id", &self.shared.options.client_id)
            .finish()
    }
}
