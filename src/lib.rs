//! # libiot-gateway - device shadow sync over MQTT
//!
//! Keeps a device's local state and its cloud "shadow" consistent over a
//! publish/subscribe connection, and publishes the device's telemetry.
//!
//! ## Features
//!
//! ### Network
//! - **MQTT Client**: `no_std` MQTT 3.1.1 packet client over any connection
//! - **Transport**: one threaded MQTT session exposing ordered event hooks
//!
//! ### Device sync
//! - **State**: the device's key/value state with change observers
//! - **Shadow**: subscribe, request, apply "desired", republish "reported"
//! - **Telemetry**: gated, validated telemetry and rejected-message listener
//! - **Onboarding**: bounded OAuth device-authorization polling
//! - **Gateway**: all of the above wired for one device
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! libiot-gateway = "0.1.0"
//! ```
//!
//! ### Shadow sync over any transport
//!
//! ```rust
//! use libiot_gateway::network::pubsub::{EventSource, Hooks, Publisher, Subscriber};
//! use libiot_gateway::network::error::Error;
//! use libiot_gateway::shadow::{Phase, ShadowConfig, Synchronizer};
//! use libiot_gateway::state::DeviceState;
//! use std::sync::Arc;
//!
//! #[derive(Default)]
//! struct Loopback {
//!     hooks: Hooks,
//! }
//!
//! impl Publisher for Loopback {
//!     fn publish(&self, _topic: &str, _payload: Option<&[u8]>) -> Result<(), Error> {
//!         Ok(())
//!     }
//! }
//!
//! impl Subscriber for Loopback {
//!     fn subscribe(&self, _topic: &str) -> Result<u16, Error> {
//!         Ok(1)
//!     }
//! }
//!
//! impl EventSource for Loopback {
//!     fn hooks(&self) -> &Hooks {
//!         &self.hooks
//!     }
//! }
//!
//! let transport = Arc::new(Loopback::default());
//! let device = Arc::new(DeviceState::new("press-7"));
//! let shadow = Synchronizer::attach(transport.clone(), device, ShadowConfig::default());
//!
//! transport.hooks().emit_connect(0);
//! assert_eq!(shadow.phase(), Phase::Subscribing);
//! transport.hooks().emit_subscribe(1, 1);
//! assert_eq!(shadow.phase(), Phase::AwaitingDesired);
//! ```
//!
//! ## Optional Features
//!
//! - `std` (default): transport thread, state, shadow, telemetry, onboarding
//!   and gateway. Without it the crate is `no_std` and provides the network
//!   traits and the MQTT packet client.
//! - `log`: route the packet client's logging to the `log` facade (implied
//!   by `std`)
//! - `defmt`: route the packet client's logging to `defmt`

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_debug_implementations)]

mod fmt;

/// Network abstraction layer: connection traits, the MQTT client and, with
/// `std`, the publish/subscribe seam used by the sync layer.
pub mod network;

/// Device state holder and the [`StateStore`](state::StateStore) trait.
#[cfg(feature = "std")]
pub mod state;

/// Device shadow synchronization.
#[cfg(feature = "std")]
pub mod shadow;

/// Telemetry publishing and rejected-telemetry handling.
#[cfg(feature = "std")]
pub mod telemetry;

/// Device-authorization token polling used during onboarding.
#[cfg(feature = "std")]
pub mod onboarding;

/// Gateway configuration loaded from the onboarding connection properties.
#[cfg(feature = "std")]
pub mod config;

/// A single device with transport, state, shadow and telemetry wired up.
#[cfg(feature = "std")]
pub mod gateway;
