//! Server-side transports
//!
//! A transport moves raw frames between the wire and the
//! [`ProtocolEngine`](crate::engine::ProtocolEngine). It knows nothing about
//! function codes; it only hands out received bytes and writes back whatever
//! the engine produced, together with the [`Framing`] that matches its wire
//! format.
//!
//! - [`RtuTransport`]: serial-like byte streams. A frame is everything received
//!   until the line stays quiet for one poll window. Frames shorter than the
//!   RTU minimum wait for the next poll and are discarded if it stays silent.
//! - [`TcpTransport`]: a listening socket serving one connection at a time.
//!   The next client is accepted only after the current one disconnects.
//!
//! Both transports can log every frame as hex at `info` level:
//!
//! ```text
//! [MODBUS-RTU] RX 01 03 00 C8 00 05 04 37
//! [MODBUS-RTU] TX 01 03 0A 00 2A 00 2A 00 2A 00 2A 00 2A F1 C4
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{Framing, RtuFraming, TcpFraming};
use crate::constants::{MAX_RTU_FRAME_SIZE, MAX_TCP_FRAME_SIZE, RTU_MIN_FRAME_LEN};
use crate::error::{ModbusError, ModbusResult};

/// How long an RTU poll waits for bytes before reporting "nothing available"
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Pending connections kept by the TCP listener
pub const TCP_BACKLOG: u32 = 1;

/// Format raw bytes as hex string for packet logging
pub(crate) fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn log_packet(protocol: &str, direction: &str, data: &[u8]) {
    info!("[MODBUS-{}] {} {}", protocol, direction, format_hex_packet(data));
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connections_accepted: u64,
    pub errors: u64,
}

/// Byte source and sink for a Modbus server
///
/// `recv_frame` resolves to `Ok(None)` when a poll yields no complete frame
/// (no data yet on a serial line, or a TCP client that went away).
pub trait ServerTransport: Send {
    /// Envelope used to decode requests and encode responses
    type Framing: Framing + Send + Sync;

    fn framing(&self) -> &Self::Framing;

    /// Receive the next candidate frame
    fn recv_frame(&mut self) -> impl Future<Output = ModbusResult<Option<Bytes>>> + Send;

    /// Send one encoded response frame
    fn send_frame(&mut self, frame: &[u8]) -> impl Future<Output = ModbusResult<()>> + Send;

    fn get_stats(&self) -> TransportStats;
}

// ============================================================================
// RTU
// ============================================================================

/// Serial port parameters for [`RtuTransport::open`]
#[cfg(feature = "rtu")]
#[derive(Debug, Clone)]
pub struct RtuConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
    pub parity: tokio_serial::Parity,
    pub poll_timeout: Duration,
}

#[cfg(feature = "rtu")]
impl Default for RtuConfig {
    /// 9600 8N1 on `/dev/ttyUSB0`
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: tokio_serial::DataBits::Eight,
            stop_bits: tokio_serial::StopBits::One,
            parity: tokio_serial::Parity::None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

#[cfg(feature = "rtu")]
impl RtuConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Self::default()
        }
    }

    pub fn with_data_bits(mut self, data_bits: tokio_serial::DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: tokio_serial::StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_parity(mut self, parity: tokio_serial::Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }
}

/// RTU transport over any async byte stream
///
/// Used with a serial port in production and with in-memory streams in tests.
pub struct RtuTransport<S> {
    stream: S,
    buffer: BytesMut,
    poll_timeout: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

impl<S> RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(MAX_RTU_FRAME_SIZE),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Bytes received but not yet handed out as a frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Append received bytes, keeping at most one byte past the frame limit
    fn buffer_chunk(&mut self, data: &[u8]) {
        self.stats.bytes_received += data.len() as u64;
        let room = (MAX_RTU_FRAME_SIZE + 1).saturating_sub(self.buffer.len());
        self.buffer.extend_from_slice(&data[..data.len().min(room)]);
    }
}

#[cfg(feature = "rtu")]
impl RtuTransport<tokio_serial::SerialStream> {
    /// Open the serial port described by `config`
    pub fn open(config: &RtuConfig) -> ModbusResult<Self> {
        let builder = tokio_serial::new(config.port.as_str(), config.baud_rate)
            .data_bits(config.data_bits)
            .stop_bits(config.stop_bits)
            .parity(config.parity);

        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!(
                "Failed to open serial port {}: {}",
                config.port, e
            ))
        })?;

        info!(
            "Opened serial port {} at {} baud",
            config.port, config.baud_rate
        );
        Ok(Self::new(port).with_poll_timeout(config.poll_timeout))
    }
}

impl<S> ServerTransport for RtuTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Framing = RtuFraming;

    fn framing(&self) -> &RtuFraming {
        &RtuFraming
    }

    async fn recv_frame(&mut self) -> ModbusResult<Option<Bytes>> {
        let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];
        match timeout(self.poll_timeout, self.stream.read(&mut chunk)).await {
            // nothing arrived within the poll window
            Err(_) => {
                if !self.buffer.is_empty() {
                    debug!(
                        "[MODBUS-RTU] discarding {} bytes of incomplete frame",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                return Ok(None);
            }
            Ok(Ok(0)) => {
                self.stats.errors += 1;
                return Err(ModbusError::connection("Serial stream closed"));
            }
            Ok(Ok(n)) => self.buffer_chunk(&chunk[..n]),
            Ok(Err(e)) => {
                self.stats.errors += 1;
                return Err(e.into());
            }
        }

        // a frame ends once the line stays quiet for a whole poll window
        loop {
            match timeout(self.poll_timeout, self.stream.read(&mut chunk)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => self.buffer_chunk(&chunk[..n]),
                Ok(Err(e)) => {
                    self.stats.errors += 1;
                    self.buffer.clear();
                    return Err(e.into());
                }
            }
        }

        if self.buffer.len() < RTU_MIN_FRAME_LEN {
            debug!(
                "[MODBUS-RTU] {} bytes buffered, waiting for more",
                self.buffer.len()
            );
            return Ok(None);
        }

        let frame = self.buffer.split().freeze();
        self.stats.frames_received += 1;
        if self.packet_logging {
            log_packet("RTU", "RX", &frame);
        }
        Ok(Some(frame))
    }

    async fn send_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
        if self.packet_logging {
            log_packet("RTU", "TX", frame);
        }
        self.stream.write_all(frame).await?;
        self.stream.flush().await?;
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

// ============================================================================
// TCP
// ============================================================================

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

/// TCP transport serving one client connection at a time
pub struct TcpTransport {
    listener: TcpListener,
    connection: Option<Connection>,
    stats: TransportStats,
    packet_logging: bool,
}

impl TcpTransport {
    /// Bind a listener on `address` with a backlog of one
    pub async fn bind(address: SocketAddr) -> ModbusResult<Self> {
        let socket = if address.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(address).map_err(|e| {
            ModbusError::connection(format!("Failed to bind {}: {}", address, e))
        })?;
        let listener = socket.listen(TCP_BACKLOG)?;

        info!("[MODBUS-TCP] listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            connection: None,
            stats: TransportStats::default(),
            packet_logging: false,
        })
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Address of the client currently being served
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().map(|c| c.peer)
    }

    fn close_connection(&mut self, reason: &str) {
        if let Some(connection) = self.connection.take() {
            info!("[MODBUS-TCP] client {} disconnected ({})", connection.peer, reason);
        }
    }
}

impl ServerTransport for TcpTransport {
    type Framing = TcpFraming;

    fn framing(&self) -> &TcpFraming {
        &TcpFraming
    }

    async fn recv_frame(&mut self) -> ModbusResult<Option<Bytes>> {
        if self.connection.is_none() {
            let (stream, peer) = self.listener.accept().await?;
            info!("[MODBUS-TCP] client connected: {}", peer);
            self.stats.connections_accepted += 1;
            self.connection = Some(Connection { stream, peer });
        }
        let Some(connection) = self.connection.as_mut() else {
            return Ok(None);
        };

        let mut buf = [0u8; MAX_TCP_FRAME_SIZE];
        match connection.stream.read(&mut buf).await {
            Ok(0) => {
                self.close_connection("closed by peer");
                Ok(None)
            }
            Ok(n) => {
                let frame = Bytes::copy_from_slice(&buf[..n]);
                self.stats.frames_received += 1;
                self.stats.bytes_received += n as u64;
                if self.packet_logging {
                    log_packet("TCP", "RX", &frame);
                }
                Ok(Some(frame))
            }
            Err(e) => {
                warn!("[MODBUS-TCP] receive failed: {}", e);
                self.stats.errors += 1;
                self.close_connection("receive error");
                Ok(None)
            }
        }
    }

    async fn send_frame(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(ModbusError::connection("No client connected"));
        };

        if self.packet_logging {
            log_packet("TCP", "TX", frame);
        }
        // a failed write ends the client session, the listener stays open
        if let Err(e) = connection.stream.write_all(frame).await {
            warn!("[MODBUS-TCP] send failed: {}", e);
            self.stats.errors += 1;
            self.close_connection("send error");
            return Err(e.into());
        }
        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        Ok(())
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc16_bytes;

    fn rtu(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16_bytes(body));
        frame
    }

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x01, 0x03, 0xAB]), "01 03 AB");
        assert_eq!(format_hex_packet(&[]), "");
    }

    #[tokio::test]
    async fn test_rtu_receive_and_send() {
        let request = rtu(&[0x01, 0x03, 0x00, 0xC8, 0x00, 0x01]);
        let response = rtu(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let mock = tokio_test::io::Builder::new()
            .read(&request)
            .write(&response)
            .build();

        let mut transport = RtuTransport::new(mock);
        transport.set_packet_logging(true);

        let frame = transport.recv_frame().await.unwrap();
        assert_eq!(frame.as_deref(), Some(request.as_slice()));
        transport.send_frame(&response).await.unwrap();

        let stats = transport.get_stats();
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_received, request.len() as u64);
        assert_eq!(stats.bytes_sent, response.len() as u64);
    }

    #[tokio::test]
    async fn test_rtu_accumulates_partial_frame() {
        let request = rtu(&[0x01, 0x03, 0x00, 0xC8, 0x00, 0x01]);
        let (mut client, server) = tokio::io::duplex(64);
        let mut transport =
            RtuTransport::new(server).with_poll_timeout(Duration::from_millis(50));

        client.write_all(&request[..4]).await.unwrap();
        assert_eq!(transport.recv_frame().await.unwrap(), None);
        assert_eq!(transport.pending(), 4);

        client.write_all(&request[4..]).await.unwrap();
        let frame = transport.recv_frame().await.unwrap();
        assert_eq!(frame.as_deref(), Some(request.as_slice()));
        assert_eq!(transport.pending(), 0);
    }

    #[tokio::test]
    async fn test_rtu_joins_frame_split_across_reads() {
        // write multiple registers, 13 bytes, delivered as 8 + 5
        let request = rtu(&[0x01, 0x10, 0x00, 0xC8, 0x00, 0x01, 0x02, 0x12, 0x34]);
        let mock = tokio_test::io::Builder::new()
            .read(&request[..8])
            .read(&request[8..])
            .build();

        let mut transport = RtuTransport::new(mock);
        let frame = transport.recv_frame().await.unwrap();
        assert_eq!(frame.as_deref(), Some(request.as_slice()));
        assert_eq!(transport.get_stats().frames_received, 1);
        assert_eq!(transport.pending(), 0);
    }

    #[tokio::test]
    async fn test_rtu_discards_stale_partial_frame() {
        let request = rtu(&[0x01, 0x03, 0x00, 0xC8, 0x00, 0x01]);
        let (mut client, server) = tokio::io::duplex(64);
        let mut transport =
            RtuTransport::new(server).with_poll_timeout(Duration::from_millis(20));

        client.write_all(&request[..5]).await.unwrap();
        assert_eq!(transport.recv_frame().await.unwrap(), None);
        assert_eq!(transport.pending(), 5);

        // a silent poll gives up on the fragment
        assert_eq!(transport.recv_frame().await.unwrap(), None);
        assert_eq!(transport.pending(), 0);

        client.write_all(&request).await.unwrap();
        let frame = transport.recv_frame().await.unwrap();
        assert_eq!(frame.as_deref(), Some(request.as_slice()));
    }

    #[tokio::test]
    async fn test_rtu_caps_oversized_frame() {
        let noise = vec![0x55u8; 400];
        let mock = tokio_test::io::Builder::new().read(&noise).build();

        let mut transport = RtuTransport::new(mock);
        let frame = transport.recv_frame().await.unwrap().unwrap();
        assert_eq!(frame.len(), MAX_RTU_FRAME_SIZE + 1);
        assert_eq!(transport.get_stats().bytes_received, 400);
    }

    #[tokio::test]
    async fn test_rtu_idle_poll() {
        let (_client, server) = tokio::io::duplex(64);
        let mut transport =
            RtuTransport::new(server).with_poll_timeout(Duration::from_millis(5));
        assert_eq!(transport.recv_frame().await.unwrap(), None);
        assert_eq!(transport.get_stats(), TransportStats::default());
    }

    #[tokio::test]
    async fn test_rtu_closed_stream() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut transport = RtuTransport::new(server);
        let err = transport.recv_frame().await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_tcp_single_connection() {
        let mut transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0xC8, 0x00, 0x01];
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&request).await.unwrap();
            let mut reply = [0u8; 3];
            stream.read_exact(&mut reply).await.unwrap();
            reply
        });

        let frame = transport.recv_frame().await.unwrap();
        assert_eq!(frame.as_deref(), Some(&request[..]));
        assert!(transport.peer_addr().is_some());
        transport.send_frame(&[0xAA, 0xBB, 0xCC]).await.unwrap();
        assert_eq!(client.await.unwrap(), [0xAA, 0xBB, 0xCC]);

        // client dropped its socket
        assert_eq!(transport.recv_frame().await.unwrap(), None);
        assert!(transport.peer_addr().is_none());
        assert_eq!(transport.get_stats().connections_accepted, 1);
    }

    #[tokio::test]
    async fn test_tcp_send_without_client() {
        let mut transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(transport.send_frame(&[0x00]).await.is_err());
    }
}
