//! MQTT 3.1.1 protocol implementation for embedded systems.
//!
//! This module provides an MQTT 3.1.1 client designed for embedded systems and
//! `no_std` environments, and with `std` a threaded transport built on top of
//! it.
//!
//! # Layers
//!
//! - [`client::Client`]: packet encoding and decoding over any
//!   [`Connection`](crate::network::Connection). Never blocks waiting for an
//!   acknowledgement; everything inbound comes out of `poll`.
//! - [`transport::Transport`] (`std`): owns a client, runs the I/O loop on a
//!   background thread and turns packets into hook events (connect,
//!   subscribe-ack, message, disconnect, idle tick).
//!
//! # Usage
//!
//! ```rust
//! use libiot_gateway::network::application::mqtt::{Client, Options, QoS};
//! # use libiot_gateway::network::Connection;
//! # struct MockConnection;
//! # impl Connection for MockConnection {}
//! # impl libiot_gateway::network::Read for MockConnection {
//! #     type Error = ();
//! #     fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> { Ok(0) }
//! # }
//! # impl libiot_gateway::network::Write for MockConnection {
//! #     type Error = ();
//! #     fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> { Ok(buf.len()) }
//! #     fn flush(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # impl libiot_gateway::network::Close for MockConnection {
//! #     type Error = ();
//! #     fn close(self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//!
//! let mut client = Client::new(MockConnection);
//! let options = Options {
//!     client_id: "iot_device_123",
//!     keep_alive_seconds: 60,
//!     clean_session: true,
//! };
//!
//! client.send_connect(&options).unwrap();
//! client.publish("status", b"online", QoS::AtMostOnce).unwrap();
//! ```

/// MQTT client implementation and supporting types.
///
/// Contains the [`Client`](client::Client) struct and the packet, option and
/// Quality of Service types it works with.
pub mod client;

/// Background I/O loop and hook dispatch for a single broker session.
#[cfg(feature = "std")]
pub mod transport;

pub use client::{Client, Options, Packet, PublishPacket, QoS};

#[cfg(feature = "std")]
pub use transport::{Transport, TransportHandle, TransportOptions};
