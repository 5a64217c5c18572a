//! Plain TCP transport

use crate::error::{MqttError, MqttResult};
use crate::protocol::Packet;
use crate::transport::codec;
use crate::transport::{Connection, Connector, PacketSink, PacketSource};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

pub const DEFAULT_PORT: u16 = 1883;

/// Default bound on the remaining length of an inbound packet
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Connects to a broker over TCP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConnector {
    host: String,
    port: u16,
    max_packet_size: usize,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Reject inbound packets larger than `bytes`
    pub fn with_max_packet_size(mut self, bytes: usize) -> Self {
        self.max_packet_size = bytes.min(codec::MAX_REMAINING_LENGTH);
        self
    }

    /// Parse a `mqtt://host[:port]` or `tcp://host[:port]` URL.
    /// TLS schemes are rejected.
    pub fn from_url(broker_url: &str) -> MqttResult<Self> {
        let url =
            Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

        match url.scheme() {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" | "tls" => {
                return Err(MqttError::InvalidBrokerUrl(format!(
                    "{broker_url}: TLS transports are not supported"
                )))
            }
            _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
        }

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> MqttResult<Connection> {
        debug!(host = %self.host, port = self.port, "Opening TCP connection");
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| MqttError::transport(format!("connect to {}: {e}", self.server_uri())))?;
        stream
            .set_nodelay(true)
            .map_err(|e| MqttError::transport(e.to_string()))?;

        let (read, write) = stream.into_split();
        let sink: Box<dyn PacketSink> = Box::new(TcpSink {
            stream: write,
            buffer: BytesMut::with_capacity(1024),
        });
        let source: Box<dyn PacketSource> = Box::new(TcpSource {
            stream: read,
            buffer: BytesMut::with_capacity(4096),
            max_packet_size: self.max_packet_size,
        });
        Ok((sink, source))
    }

    fn server_uri(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

struct TcpSink {
    stream: OwnedWriteHalf,
    buffer: BytesMut,
}

#[async_trait::async_trait]
impl PacketSink for TcpSink {
    async fn send(&mut self, packet: Packet) -> MqttResult<()> {
        self.buffer.clear();
        codec::encode(&packet, &mut self.buffer)?;
        self.stream
            .write_all(&self.buffer)
            .await
            .map_err(|e| MqttError::transport(format!("write {}: {e}", packet.name())))
    }

    async fn close(&mut self) -> MqttResult<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| MqttError::transport(e.to_string()))
    }
}

struct TcpSource {
    stream: OwnedReadHalf,
    buffer: BytesMut,
    max_packet_size: usize,
}

#[async_trait::async_trait]
impl PacketSource for TcpSource {
    async fn recv(&mut self) -> MqttResult<Option<Packet>> {
        loop {
            if let Some(packet) = codec::decode_limited(&mut self.buffer, self.max_packet_size)? {
                return Ok(Some(packet));
            }

            let read = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| MqttError::transport(e.to_string()))?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(MqttError::transport("connection closed mid-packet"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnAck, ConnectReturnCode};
    use tokio::net::TcpListener;

    #[test]
    fn test_from_url_defaults_port() {
        let connector = TcpConnector::from_url("mqtt://localhost").unwrap();
        assert_eq!(connector.host(), "localhost");
        assert_eq!(connector.port(), 1883);

        let connector = TcpConnector::from_url("tcp://10.0.0.5:2883").unwrap();
        assert_eq!(connector.port(), 2883);
        assert_eq!(connector.server_uri(), "tcp://10.0.0.5:2883");
    }

    #[test]
    fn test_from_url_rejects_invalid_and_tls() {
        for url in ["invalid-url", "http://localhost", "mqtts://localhost:8883", "ssl://broker"] {
            assert!(
                matches!(TcpConnector::from_url(url), Err(MqttError::InvalidBrokerUrl(_))),
                "accepted {url}"
            );
        }
    }

    #[tokio::test]
    async fn test_packets_cross_a_real_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0xC0, 0]);

            let mut out = BytesMut::new();
            codec::encode(
                &Packet::ConnAck(ConnAck {
                    session_present: true,
                    code: ConnectReturnCode::Accepted,
                }),
                &mut out,
            )
            .unwrap();
            socket.write_all(&out).await.unwrap();
        });

        let connector = TcpConnector::new("127.0.0.1", port);
        let (mut sink, mut source) = connector.connect().await.unwrap();
        sink.send(Packet::PingReq).await.unwrap();

        let packet = source.recv().await.unwrap();
        assert_eq!(
            packet,
            Some(Packet::ConnAck(ConnAck {
                session_present: true,
                code: ConnectReturnCode::Accepted,
            }))
        );

        server.await.unwrap();
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_packet_fails_the_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // PUBLISH announcing 16384 bytes
            socket.write_all(&[0x30, 0x80, 0x80, 0x01]).await.unwrap();
            socket
        });

        let connector = TcpConnector::new("127.0.0.1", port).with_max_packet_size(1024);
        let (_sink, mut source) = connector.connect().await.unwrap();

        assert!(matches!(source.recv().await, Err(MqttError::Codec(_))));
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpConnector::new("127.0.0.1", port).connect().await;
        assert!(matches!(result, Err(MqttError::Transport(_))));
    }
}
