//! Byte transports feeding the Modbus framing layers.
//!
//! The core of the library (framers, transaction registries, clients) never
//! touches a socket or serial port directly. It consumes the narrow
//! [`ModbusTransport`] contract: an ordered outbound byte sink, an ordered
//! inbound byte stream, and connection lifecycle events. Anything that can
//! move bytes (a TCP socket, a TLS stream wrapped by the caller, a serial
//! line, an in-memory pipe in tests) can implement it.
//!
//! Two bindings are shipped: [`TcpTransport`] over a tokio `TcpStream` and
//! [`SerialTransport`] over a tokio-serial port. Reconnect supervision is
//! deliberately not here; a supervising transport can emit
//! [`TransportEvent::Connected`] again after re-establishing its link and
//! the registry resumes accepting requests.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{ModbusError, ModbusResult};

/// Inbound activity reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The link is (re-)established. Bindings constructed in a connected
    /// state never need to emit this; supervising wrappers do after a
    /// reconnect.
    Connected,
    /// Bytes arrived, in order, in whatever chunks the medium produced.
    Data(Bytes),
    /// The link is gone. A terminal event: after emitting it the transport
    /// pends forever in [`ModbusTransport::recv`] unless it reconnects.
    Disconnected { cause: String },
}

/// Contract between the Modbus core and the byte pipe underneath it.
#[async_trait]
pub trait ModbusTransport: Send + 'static {
    /// Enqueue bytes for transmission. Fails fast with
    /// [`ModbusError::NotConnected`] when the link is down.
    async fn send(&mut self, bytes: &[u8]) -> ModbusResult<()>;

    /// Wait for the next inbound event. Cancel-safe.
    async fn recv(&mut self) -> TransportEvent;

    /// Tear the link down.
    async fn close(&mut self) -> ModbusResult<()>;
}

/// Modbus TCP byte transport over a tokio `TcpStream`.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    read_buf: Vec<u8>,
}

impl TcpTransport {
    /// Connect to `addr`, bounded by `connect_timeout`.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> ModbusResult<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ModbusError::io(format!("connect to {addr} timed out")))?
            .map_err(|e| ModbusError::io(format!("failed to connect to {addr}: {e}")))?;
        // Request/response traffic, latency matters more than throughput.
        let _ = stream.set_nodelay(true);
        debug!("connected to {addr}");
        Ok(Self {
            stream: Some(stream),
            peer: addr,
            read_buf: vec![0u8; 4096],
        })
    }

    /// Wrap an already-connected stream (e.g. accepted elsewhere).
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream: Some(stream), peer, read_buf: vec![0u8; 4096] }
    }

    /// The remote address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn send(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        let stream = self.stream.as_mut().ok_or(ModbusError::NotConnected)?;
        if let Err(e) = stream.write_all(bytes).await {
            self.stream = None;
            return Err(ModbusError::io(format!("write to {} failed: {e}", self.peer)));
        }
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };
        match stream.read(&mut self.read_buf).await {
            Ok(0) => {
                self.stream = None;
                TransportEvent::Disconnected { cause: "connection closed by peer".into() }
            }
            Ok(n) => TransportEvent::Data(Bytes::copy_from_slice(&self.read_buf[..n])),
            Err(e) => {
                self.stream = None;
                TransportEvent::Disconnected { cause: e.to_string() }
            }
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

/// Serial line parameters for an RTU transport.
///
/// The framing layer consumes only `baud_rate` (to derive the t1.5/t3.5
/// silence thresholds); the remaining fields configure the port itself.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: "/dev/ttyUSB0".into(),
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

impl SerialConfig {
    /// Convenience constructor for the common 8N1 case.
    pub fn new<S: Into<String>>(path: S, baud_rate: u32) -> Self {
        Self { path: path.into(), baud_rate, ..Default::default() }
    }
}

/// Modbus RTU byte transport over a tokio-serial port.
pub struct SerialTransport {
    stream: Option<SerialStream>,
    config: SerialConfig,
    read_buf: Vec<u8>,
}

impl SerialTransport {
    /// Open the serial port described by `config`.
    pub fn open(config: SerialConfig) -> ModbusResult<Self> {
        let stream = tokio_serial::new(&config.path, config.baud_rate)
            .data_bits(config.data_bits)
            .stop_bits(config.stop_bits)
            .parity(config.parity)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                ModbusError::configuration(format!("failed to open {}: {e}", config.path))
            })?;
        debug!("opened serial port {} at {} baud", config.path, config.baud_rate);
        Ok(Self {
            stream: Some(stream),
            config,
            // An RTU frame never exceeds 256 bytes.
            read_buf: vec![0u8; crate::MAX_RTU_FRAME_SIZE + 4],
        })
    }

    /// The configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    /// The port configuration.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl ModbusTransport for SerialTransport {
    async fn send(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        let stream = self.stream.as_mut().ok_or(ModbusError::NotConnected)?;
        if let Err(e) = stream.write_all(bytes).await {
            self.stream = None;
            return Err(ModbusError::io(format!(
                "write to {} failed: {e}",
                self.config.path
            )));
        }
        if let Err(e) = stream.flush().await {
            self.stream = None;
            return Err(ModbusError::io(format!(
                "flush of {} failed: {e}",
                self.config.path
            )));
        }
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };
        match stream.read(&mut self.read_buf).await {
            Ok(0) => {
                self.stream = None;
                TransportEvent::Disconnected { cause: "serial port closed".into() }
            }
            Ok(n) => TransportEvent::Data(Bytes::copy_from_slice(&self.read_buf[..n])),
            Err(e) => {
                self.stream = None;
                TransportEvent::Disconnected { cause: e.to_string() }
            }
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.stream = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut transport = TcpTransport::connect(addr, Duration::from_secs(1))
            .await
            .unwrap();
        transport.send(&[0x01, 0x02, 0x03]).await.unwrap();
        match transport.recv().await {
            TransportEvent::Data(data) => assert_eq!(&data[..], &[0x01, 0x02, 0x03]),
            other => panic!("unexpected event: {other:?}"),
        }
        server.await.unwrap();

        // Server side is gone now; the next read reports disconnection.
        match transport.recv().await {
            TransportEvent::Disconnected { .. } => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            transport.send(&[0x00]).await,
            Err(ModbusError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_tcp_transport_connect_refused() {
        // Port 1 on localhost is essentially never listening.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = TcpTransport::connect(addr, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_serial_config_defaults() {
        let config = SerialConfig::new("/dev/ttyS0", 19_200);
        assert_eq!(config.path, "/dev/ttyS0");
        assert_eq!(config.baud_rate, 19_200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
    }
}
