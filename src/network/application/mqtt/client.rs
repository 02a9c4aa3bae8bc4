//! MQTT 3.1.1 packet client for embedded systems.
//!
//! This module provides a lightweight MQTT client designed for `no_std`
//! environments. It encodes the packets a device sends (CONNECT, PUBLISH,
//! PUBACK, SUBSCRIBE, PINGREQ, DISCONNECT) and decodes the packets a broker
//! sends back (CONNACK, PUBLISH, PUBACK, SUBACK, PINGRESP).
//!
//! Unlike a request/response client, [`Client`] never waits for an
//! acknowledgement inside `subscribe` or `publish`. Every inbound packet,
//! acknowledgements included, comes out of [`Client::poll`], which lets a
//! single I/O loop drive the session and hand the packets to whoever is
//! interested (see the `transport` module when `std` is enabled).
//!
//! # Features
//!
//! - MQTT 3.1.1 protocol compliance for QoS 0 and QoS 1
//! - Packet identifiers allocated per client, never zero
//! - Fixed-size buffers for predictable memory usage
//! - Connection agnostic (works with any transport)
//!
//! # Examples
//!
//! ```rust
//! use libiot_gateway::network::application::mqtt::{Client, Options, Packet, QoS};
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
//!     client_id: "sensor_device_01",
//!     keep_alive_seconds: 60,
//!     clean_session: true,
//! };
//!
//! client.send_connect(&options).unwrap();
//! let packet_id = client.subscribe("sensors/+", QoS::AtLeastOnce).unwrap();
//! assert_eq!(packet_id, 1);
//!
//! // Nothing has arrived on the mock connection yet.
//! assert_eq!(client.poll().unwrap(), None::<Packet>);
//! ```

use crate::fmt::{debug, warn};
use crate::network::error::Error;
use crate::network::{Close, Connection, Read, Write};
use heapless::{String, Vec};

// MQTT Control Packet types - these are the fixed header packet type values
/// MQTT CONNECT packet type identifier.
const CONNECT: u8 = 0x10;
/// MQTT CONNACK packet type identifier.
const CONNACK: u8 = 0x20;
/// MQTT PUBLISH packet type identifier.
const PUBLISH: u8 = 0x30;
/// MQTT PUBACK packet type identifier.
const PUBACK: u8 = 0x40;
/// MQTT SUBSCRIBE packet type identifier (with the mandatory 0b0010 flags).
const SUBSCRIBE: u8 = 0x82;
/// MQTT SUBACK packet type identifier.
const SUBACK: u8 = 0x90;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

// Protocol constants defined by MQTT 3.1.1 specification
/// MQTT protocol name as defined in the specification.
const PROTOCOL_NAME: &[u8] = b"MQTT";
/// MQTT protocol level for version 3.1.1.
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

/// Longest topic name accepted in either direction.
pub const MAX_TOPIC_LEN: usize = 256;

/// Largest payload accepted in either direction.
///
/// Shadow documents for a handful of keys fit comfortably; larger state
/// should be split across several devices or topics.
pub const MAX_PAYLOAD_LEN: usize = 2048;

/// Largest remaining-length the client will buffer for an inbound packet.
const MAX_PACKET_LEN: usize = 2 + MAX_TOPIC_LEN + 2 + MAX_PAYLOAD_LEN;

/// Receive buffer size: one fixed header plus the largest accepted body.
const RX_BUFFER_LEN: usize = 5 + MAX_PACKET_LEN;

/// Return code a broker places in a SUBACK to reject a subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Quality of Service levels for MQTT messages.
///
/// # Examples
///
/// ```rust
/// use libiot_gateway::network::application::mqtt::QoS;
///
/// assert_eq!(QoS::AtMostOnce as u8, 0);
/// assert_eq!(QoS::AtLeastOnce as u8, 1);
/// assert_eq!(QoS::ExactlyOnce as u8, 2);
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum QoS {
    /// **QoS 0**: At most once delivery.
    AtMostOnce = 0,

    /// **QoS 1**: At least once delivery.
    ///
    /// Messages are assured to arrive but duplicates can occur. Everything the
    /// shadow protocol sends uses this level.
    AtLeastOnce = 1,

    /// **QoS 2**: Exactly once delivery.
    ///
    /// Accepted in subscriptions, but inbound QoS 2 flows are not completed by
    /// this client.
    ExactlyOnce = 2,
}

impl QoS {
    fn from_bits(bits: u8) -> Result<Self, Error> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(Error::ProtocolError),
        }
    }
}

/// An incoming MQTT publish message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PublishPacket {
    /// The topic on which the message was published.
    pub topic: String<MAX_TOPIC_LEN>,

    /// The message payload data.
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,

    /// Delivery level the broker used for this message.
    pub qos: QoS,

    /// Packet identifier, present for QoS 1 and 2.
    pub packet_id: Option<u16>,
}

/// A packet received from the broker.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// Answer to CONNECT. A `return_code` of 0 means the session is open.
    ConnAck {
        /// Whether the broker resumed a stored session.
        session_present: bool,
        /// CONNACK return code, 0 on success and 1..=5 on refusal.
        return_code: u8,
    },
    /// An application message on a subscribed topic.
    Publish(PublishPacket),
    /// Acknowledgement of one of our QoS 1 publishes.
    PubAck {
        /// Identifier of the acknowledged publish.
        packet_id: u16,
    },
    /// Acknowledgement of a SUBSCRIBE.
    SubAck {
        /// Identifier returned by [`Client::subscribe`].
        packet_id: u16,
        /// Granted QoS, or [`SUBACK_FAILURE`].
        return_code: u8,
    },
    /// Answer to PINGREQ.
    PingResp,
}

/// Configuration options for MQTT client connection.
///
/// # Examples
///
/// ```rust
/// use libiot_gateway::network::application::mqtt::Options;
///
/// let options = Options {
///     client_id: "my_iot_device",
///     keep_alive_seconds: 120,
///     clean_session: true,
/// };
/// assert_eq!(options.keep_alive_seconds, 120);
/// ```
#[derive(Debug, Clone)]
pub struct Options<'a> {
    /// The client identifier, must be unique within the broker.
    ///
    /// For cloud IoT brokers this is the thing name the device was
    /// provisioned with.
    pub client_id: &'a str,

    /// The keep-alive time interval in seconds.
    ///
    /// A value of 0 disables keep-alive.
    pub keep_alive_seconds: u16,

    /// Whether to start a clean session.
    pub clean_session: bool,
}

/// An MQTT 3.1.1 client for publish-subscribe messaging.
///
/// The client owns the connection and a packet identifier counter. It is
/// purely packet-level: it does not track whether the broker accepted the
/// session, that is up to whoever reads the [`Packet::ConnAck`].
///
/// Inbound bytes are collected in a receive buffer, so a packet may arrive
/// over any number of reads, with idle reads in between.
///
/// # Type Parameters
///
/// * `C` - The connection type implementing [`Connection`]
#[derive(Debug)]
pub struct Client<C: Connection> {
    connection: C,
    next_packet_id: u16,
    rx: Vec<u8, RX_BUFFER_LEN>,
    /// Bytes of an oversized packet still to be thrown away.
    discard: usize,
}

impl<C: Connection> Client<C> {
    /// Wraps an established network connection.
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            next_packet_id: 1,
            rx: Vec::new(),
            discard: 0,
        }
    }

    /// Sends the CONNECT packet.
    ///
    /// The broker's CONNACK arrives later through [`Client::poll`].
    ///
    /// # Errors
    ///
    /// * [`Error::WriteError`] - Failed to send the CONNECT packet
    /// * [`Error::PacketTooLarge`] - The client identifier does not fit
    pub fn send_connect(&mut self, options: &Options<'_>) -> Result<(), Error> {
        // --- Variable Header ---
        let mut vh: Vec<u8, 10> = Vec::new();
        vh.extend_from_slice(&(PROTOCOL_NAME.len() as u16).to_be_bytes())
            .map_err(|_| Error::ProtocolError)?;
        vh.extend_from_slice(PROTOCOL_NAME)
            .map_err(|_| Error::ProtocolError)?;
        vh.push(PROTOCOL_LEVEL).map_err(|_| Error::ProtocolError)?;

        let mut connect_flags = 0;
        if options.clean_session {
            connect_flags |= 0x02;
        }
        vh.push(connect_flags).map_err(|_| Error::ProtocolError)?;
        vh.extend_from_slice(&options.keep_alive_seconds.to_be_bytes())
            .map_err(|_| Error::ProtocolError)?;

        // --- Payload ---
        let client_id = options.client_id.as_bytes();
        if client_id.len() > MAX_TOPIC_LEN {
            return Err(Error::PacketTooLarge);
        }
        let client_id_len = (client_id.len() as u16).to_be_bytes();

        self.send(CONNECT, &[&vh, &client_id_len, client_id])
    }

    /// Publishes a message to a topic.
    ///
    /// Returns the packet identifier for QoS 1 and 2 so the caller can match
    /// the broker's PUBACK, or `None` for QoS 0.
    ///
    /// # Errors
    ///
    /// * [`Error::WriteError`] - Failed to send the publish packet
    /// * [`Error::PacketTooLarge`] - Topic or payload exceed the buffer limits
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<Option<u16>, Error> {
        let topic_bytes = topic.as_bytes();
        if topic_bytes.len() > MAX_TOPIC_LEN || payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::PacketTooLarge);
        }
        let topic_len = (topic_bytes.len() as u16).to_be_bytes();

        let header = PUBLISH | ((qos as u8) << 1);
        match qos {
            QoS::AtMostOnce => {
                self.send(header, &[&topic_len, topic_bytes, payload])?;
                Ok(None)
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let packet_id = self.allocate_packet_id();
                self.send(
                    header,
                    &[&topic_len, topic_bytes, &packet_id.to_be_bytes(), payload],
                )?;
                Ok(Some(packet_id))
            }
        }
    }

    /// Acknowledges an inbound QoS 1 publish.
    pub fn puback(&mut self, packet_id: u16) -> Result<(), Error> {
        self.send(PUBACK, &[&packet_id.to_be_bytes()])
    }

    /// Sends a SUBSCRIBE for a single topic filter.
    ///
    /// Returns the packet identifier the broker will echo in its SUBACK.
    ///
    /// # Errors
    ///
    /// * [`Error::WriteError`] - Failed to send the subscribe packet
    /// * [`Error::PacketTooLarge`] - The topic filter is too long
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<u16, Error> {
        let topic_bytes = topic.as_bytes();
        if topic_bytes.len() > MAX_TOPIC_LEN {
            return Err(Error::PacketTooLarge);
        }
        let packet_id = self.allocate_packet_id();
        let topic_len = (topic_bytes.len() as u16).to_be_bytes();

        self.send(
            SUBSCRIBE,
            &[&packet_id.to_be_bytes(), &topic_len, topic_bytes, &[qos as u8]],
        )?;
        Ok(packet_id)
    }

    /// Sends a PINGREQ to keep the session alive.
    pub fn ping(&mut self) -> Result<(), Error> {
        self.send(PINGREQ, &[])
    }

    /// Sends DISCONNECT and closes the underlying connection.
    pub fn disconnect(mut self) -> Result<(), Error> {
        let sent = self.send(DISCONNECT, &[]);
        self.connection.close().map_err(|_| Error::NotOpen)?;
        sent
    }

    /// Polls the connection for the next inbound packet.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(packet))` - A complete packet was read
    /// * `Ok(None)` - No complete packet yet; call again later
    /// * `Err(error)` - Network or protocol error; the session should be dropped
    ///
    /// # Non-blocking Behavior
    ///
    /// A zero-byte read means "nothing more right now", also in the middle of
    /// a packet: the bytes received so far stay buffered until the next call.
    /// Packets larger than the receive buffer are skipped, not fatal.
    pub fn poll(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            if let Some(packet) = self.next_buffered()? {
                return Ok(Some(packet));
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Next non-zero packet identifier.
    fn allocate_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = match self.next_packet_id.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        id
    }

    /// Reads whatever the connection has into the receive buffer.
    ///
    /// `false` when the read returned nothing.
    fn fill(&mut self) -> Result<bool, Error> {
        let start = self.rx.len();
        self.rx
            .resize(RX_BUFFER_LEN, 0)
            .map_err(|_| Error::PacketTooLarge)?;
        match self.connection.read(&mut self.rx[start..]) {
            Ok(n) => {
                let n = n.min(RX_BUFFER_LEN - start);
                self.rx.truncate(start + n);
                Ok(n > 0)
            }
            Err(_) => {
                self.rx.truncate(start);
                Err(Error::ReadError)
            }
        }
    }

    /// Decodes complete packets from the receive buffer until one is worth
    /// returning, or the buffer runs dry.
    fn next_buffered(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(self.rx.len());
                self.consume(n);
                self.discard -= n;
                if self.discard > 0 {
                    return Ok(None);
                }
            }

            let Some((header, header_len, remaining_len)) = decode_fixed_header(&self.rx)? else {
                return Ok(None);
            };
            if remaining_len > MAX_PACKET_LEN {
                warn!("skipping inbound packet of {} bytes", remaining_len);
                self.discard = header_len + remaining_len;
                continue;
            }
            let frame_len = header_len + remaining_len;
            if self.rx.len() < frame_len {
                return Ok(None);
            }

            let packet = decode_packet(header, &self.rx[header_len..frame_len]);
            self.consume(frame_len);
            if let Some(packet) = packet? {
                return Ok(Some(packet));
            }
        }
    }

    /// Drops the first `n` buffered bytes.
    fn consume(&mut self, n: usize) {
        let len = self.rx.len();
        self.rx.copy_within(n..len, 0);
        self.rx.truncate(len - n);
    }

    /// Writes one packet: the fixed header followed by `parts` in order.
    fn send(&mut self, packet_type: u8, parts: &[&[u8]]) -> Result<(), Error> {
        let remaining_len = parts.iter().map(|part| part.len()).sum();

        let mut fixed_header: Vec<u8, 5> = Vec::new();
        fixed_header.push(packet_type).map_err(|_| Error::ProtocolError)?;
        encode_remaining_length(&mut fixed_header, remaining_len)?;

        self.write_all(&fixed_header)?;
        for part in parts {
            self.write_all(part)?;
        }
        self.connection.flush().map_err(|_| Error::WriteError)
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        while !buf.is_empty() {
            match self.connection.write(buf) {
                Ok(0) | Err(_) => return Err(Error::WriteError),
                Ok(n) => buf = &buf[n..],
            }
        }
        Ok(())
    }
}

/// Splits off a fixed header: packet type byte, header length and remaining
/// length. `None` until the whole header has been received.
fn decode_fixed_header(buf: &[u8]) -> Result<Option<(u8, usize, usize)>, Error> {
    let Some(&header) = buf.first() else {
        return Ok(None);
    };
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for i in 1..=4 {
        let Some(&byte) = buf.get(i) else {
            return Ok(None);
        };
        value += (byte as usize & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((header, i + 1, value)));
        }
        multiplier *= 128;
    }
    Err(Error::ProtocolError)
}

/// Decodes the body of a packet whose fixed header byte is `header`.
fn decode_packet(header: u8, body: &[u8]) -> Result<Option<Packet>, Error> {
    match header & 0xF0 {
        CONNACK => {
            if body.len() != 2 {
                return Err(Error::ProtocolError);
            }
            Ok(Some(Packet::ConnAck {
                session_present: body[0] & 0x01 == 0x01,
                return_code: body[1],
            }))
        }
        PUBLISH => decode_publish(header, body).map(|packet| Some(Packet::Publish(packet))),
        PUBACK => Ok(Some(Packet::PubAck {
            packet_id: read_u16(body, 0)?,
        })),
        SUBACK => {
            if body.len() < 3 {
                return Err(Error::ProtocolError);
            }
            Ok(Some(Packet::SubAck {
                packet_id: read_u16(body, 0)?,
                return_code: body[2],
            }))
        }
        PINGRESP => Ok(Some(Packet::PingResp)),
        other => {
            debug!("ignoring MQTT packet type {}", other);
            Ok(None)
        }
    }
}

fn decode_publish(header: u8, body: &[u8]) -> Result<PublishPacket, Error> {
    let qos = QoS::from_bits((header >> 1) & 0x03)?;

    let topic_len = read_u16(body, 0)? as usize;
    let topic_end = 2 + topic_len;
    let topic_bytes = body.get(2..topic_end).ok_or(Error::ProtocolError)?;
    let topic = core::str::from_utf8(topic_bytes).map_err(|_| Error::ProtocolError)?;
    let topic = String::try_from(topic).map_err(|_| Error::PacketTooLarge)?;

    let (packet_id, payload_start) = match qos {
        QoS::AtMostOnce => (None, topic_end),
        QoS::AtLeastOnce | QoS::ExactlyOnce => (Some(read_u16(body, topic_end)?), topic_end + 2),
    };
    let payload = Vec::from_slice(&body[payload_start..]).map_err(|_| Error::PacketTooLarge)?;

    Ok(PublishPacket {
        topic,
        payload,
        qos,
        packet_id,
    })
}

fn read_u16(body: &[u8], at: usize) -> Result<u16, Error> {
    match body.get(at..at + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(Error::ProtocolError),
    }
}

/// Encode the remaining length field for an MQTT packet.
///
/// The encoding uses up to 4 bytes where each byte encodes 7 bits of the length
/// value. The most significant bit indicates if another byte follows.
fn encode_remaining_length(buf: &mut Vec<u8, 5>, mut len: usize) -> Result<(), Error> {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte).map_err(|_| Error::PacketTooLarge)?;
        if len == 0 {
            break;
        }
    }
    Ok(())
}
