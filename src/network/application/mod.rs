//! # Application Layer Network Protocols
//!
//! This module contains the application layer (OSI Layer 7) protocols the
//! gateway speaks. Each protocol works with the core network traits and keeps
//! the packet handling itself usable on `no_std` targets.
//!
//! ## Available Protocols
//!
//! - **[`mqtt`]**: MQTT 3.1.1 client for lightweight publish-subscribe messaging,
//!   plus a threaded transport that turns broker traffic into events (`std`)
//!
//! ## Design Principles
//!
//! - **Connection Agnostic**: Work with any type implementing [`Connection`](crate::network::Connection)
//! - **No-std Compatible**: Packet encoding and decoding use fixed-size buffers
//! - **Error Handling**: Every failure maps to [`Error`](crate::network::error::Error)

/// MQTT client implementation.
///
/// Provides an MQTT 3.1.1 client for lightweight publish-subscribe messaging,
/// commonly used in IoT applications.
pub mod mqtt;
