//! One device, fully wired.
//!
//! [`Gateway`] owns the MQTT transport and the device state, and attaches the
//! shadow synchronizer, the telemetry publisher and the telemetry-rejected
//! listener to them in that order. Connecting then runs the whole shadow
//! protocol without further calls.
//!
//! ```no_run
//! use libiot_gateway::config::GatewayConfig;
//! use libiot_gateway::gateway::Gateway;
//! # use libiot_gateway::network::{Close, Connect, Connection, Read, Write};
//! # struct Tcp;
//! # impl Connection for Tcp {}
//! # impl Read for Tcp { type Error = (); fn read(&mut self, _: &mut [u8]) -> Result<usize, ()> { Ok(0) } }
//! # impl Write for Tcp {
//! #     type Error = ();
//! #     fn write(&mut self, b: &[u8]) -> Result<usize, ()> { Ok(b.len()) }
//! #     fn flush(&mut self) -> Result<(), ()> { Ok(()) }
//! # }
//! # impl Close for Tcp { type Error = (); fn close(self) -> Result<(), ()> { Ok(()) } }
//! # struct Net;
//! # impl Connect for Net {
//! #     type Connection = Tcp;
//! #     type Error = ();
//! #     fn connect(&mut self, _: &str) -> Result<Tcp, ()> { Ok(Tcp) }
//! # }
//! # let json = br#"{"mqtt_endpoint":"b","mqtt_port":1883,"client_id":"c","org_id":"o","telemetry_topic":"t","stage":"s"}"#;
//! let config = GatewayConfig::from_json(json)?;
//! let gateway = Gateway::new(&config);
//! gateway.connect_to(&mut Net)?;
//! gateway.publish_telemetry(br#"{"temperature":21.5}"#)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::config::GatewayConfig;
use crate::network::application::mqtt::{Transport, TransportHandle};
use crate::network::error::Error;
use crate::network::{Connect, Connection};
use crate::shadow::{Phase, Synchronizer, SyncError};
use crate::state::{DeviceState, State, StateStore};
use crate::telemetry::{EventValidator, RejectedTelemetry, TelemetryError, TelemetryPublisher};
use log::info;
use std::fmt;
use std::sync::Arc;

type Handle<C> = TransportHandle<C>;

/// A device connected through one MQTT session.
pub struct Gateway<C: Connection> {
    transport: Transport<C>,
    state: Arc<DeviceState>,
    shadow: Synchronizer<Handle<C>, Arc<DeviceState>>,
    telemetry: TelemetryPublisher<Handle<C>, Arc<DeviceState>>,
    rejected: RejectedTelemetry<Handle<C>>,
    remote: String,
}

impl<C: Connection + Send + 'static> Gateway<C> {
    /// A gateway whose device starts with an empty state.
    pub fn new(config: &GatewayConfig) -> Self {
        Self::with_state(config, State::new())
    }

    pub fn with_state(config: &GatewayConfig, initial: State) -> Self {
        let transport = Transport::new(config.transport_options());
        let state = Arc::new(DeviceState::with_state(config.client_id.as_str(), initial));

        let shadow = Synchronizer::attach(transport.handle(), state.clone(), config.shadow.clone());
        let telemetry = TelemetryPublisher::new(transport.handle(), state.clone(), config.telemetry_topic());
        let rejected = RejectedTelemetry::attach(transport.handle(), &config.stage, &config.client_id);

        Self {
            transport,
            state,
            shadow,
            telemetry,
            rejected,
            remote: config.remote_address(),
        }
    }

    /// Validates every telemetry message with `validator` before publishing.
    pub fn with_validator(mut self, validator: impl EventValidator + Send + Sync + 'static) -> Self {
        self.telemetry = self.telemetry.with_validator(validator);
        self
    }

    /// Starts the session over an already open connection.
    pub fn connect(&self, connection: C) -> Result<(), Error> {
        info!("connecting {} to {}", self.state.identity(), self.remote);
        self.transport.connect(connection)
    }

    /// Opens a connection to the configured endpoint and starts the session.
    pub fn connect_to<N>(&self, network: &mut N) -> Result<(), Error>
    where
        N: Connect<Connection = C>,
    {
        info!("connecting {} to {}", self.state.identity(), self.remote);
        self.transport.connect_to(network, &self.remote)
    }

    pub fn disconnect(&self) {
        self.transport.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Publishes one telemetry message; see [`TelemetryPublisher::publish`].
    pub fn publish_telemetry(&self, message: &[u8]) -> Result<(), TelemetryError> {
        self.telemetry.publish(message)
    }

    pub fn get_state(&self) -> State {
        self.shadow.get_state()
    }

    /// Replaces the device state and reports it to the shadow.
    pub fn set_state(&self, new_state: State) {
        self.shadow.set_state(new_state)
    }

    pub fn phase(&self) -> Phase {
        self.shadow.phase()
    }

    pub fn last_sync_error(&self) -> Option<SyncError> {
        self.shadow.last_error()
    }

    pub fn state(&self) -> &Arc<DeviceState> {
        &self.state
    }

    pub fn shadow(&self) -> &Synchronizer<Handle<C>, Arc<DeviceState>> {
        &self.shadow
    }

    pub fn rejected_telemetry(&self) -> &RejectedTelemetry<Handle<C>> {
        &self.rejected
    }
}

impl<C: Connection> fmt::Debug for Gateway<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("remote", &self.remote)
            .field("transport", &self.transport)
            .field("shadow", &self.shadow)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}
