//! Common error types for network operations

/// A common error type for network operations.
///
/// This enum defines the errors that can occur while talking to the broker,
/// from the raw connection up to the MQTT packet layer. It is `Copy` and
/// allocation-free so it stays usable in `no_std` environments.
#[derive(Debug, PartialEq, Eq, Clone, Copy, thiserror::Error)]
pub enum Error {
    /// An operation was attempted on a connection that is not open.
    #[error("connection is not open")]
    NotOpen,
    /// An error occurred during a write operation.
    #[error("write to connection failed")]
    WriteError,
    /// An error occurred during a read operation.
    #[error("read from connection failed")]
    ReadError,
    /// The broker refused the connection with the given CONNACK return code.
    #[error("broker refused the connection (return code {0})")]
    ConnectionRefused(u8),
    /// A timeout occurred.
    #[error("operation timed out")]
    Timeout,
    /// The connection was closed.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// A protocol-specific error occurred.
    #[error("malformed MQTT packet")]
    ProtocolError,
    /// A topic or payload does not fit into the fixed packet buffers.
    #[error("packet exceeds the maximum supported size")]
    PacketTooLarge,
    /// `connect` was called while a session is already running.
    #[error("a session is already running")]
    AlreadyConnected,
    /// The broker answered a SUBSCRIBE with the failure return code.
    #[error("broker refused the subscription")]
    SubscriptionRefused,
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::NotOpen => defmt::write!(f, "NotOpen"),
            Error::WriteError => defmt::write!(f, "WriteError"),
            Error::ReadError => defmt::write!(f, "ReadError"),
            Error::ConnectionRefused(code) => defmt::write!(f, "ConnectionRefused({})", code),
            Error::Timeout => defmt::write!(f, "Timeout"),
            Error::ConnectionClosed => defmt::write!(f, "ConnectionClosed"),
            Error::ProtocolError => defmt::write!(f, "ProtocolError"),
            Error::PacketTooLarge => defmt::write!(f, "PacketTooLarge"),
            Error::AlreadyConnected => defmt::write!(f, "AlreadyConnected"),
            Error::SubscriptionRefused => defmt::write!(f, "SubscriptionRefused"),
        }
    }
}
