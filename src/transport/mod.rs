//! Transport seam between the engine and the network
//!
//! The engine never touches sockets. It asks a [`Connector`] for a fresh pair
//! of packet halves on every connect attempt, drives the [`PacketSink`] from a
//! writer task and drains the [`PacketSource`] from a reader task. The TCP
//! implementation lives in [`tcp`] (with the wire format in [`codec`]); the
//! in-process test broker in [`crate::testing`] implements the same traits.

pub mod codec;
pub mod tcp;

pub use tcp::TcpConnector;

use crate::error::MqttResult;
use crate::protocol::Packet;

/// Outbound half of a connection
#[async_trait::async_trait]
pub trait PacketSink: Send {
    /// Write one packet. An error means the connection is unusable.
    async fn send(&mut self, packet: Packet) -> MqttResult<()>;

    /// Close the connection after any buffered packets were written
    async fn close(&mut self) -> MqttResult<()>;
}

/// Inbound half of a connection
#[async_trait::async_trait]
pub trait PacketSource: Send {
    /// Next packet, `Ok(None)` once the peer closed the connection cleanly
    async fn recv(&mut self) -> MqttResult<Option<Packet>>;
}

/// Both halves of one established connection
pub type Connection = (Box<dyn PacketSink>, Box<dyn PacketSource>);

/// Opens connections to one broker
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> MqttResult<Connection>;

    /// Broker address reported to `connect_complete`
    fn server_uri(&self) -> String;
}
