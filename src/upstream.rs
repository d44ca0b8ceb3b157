use crate::config::{Nameserver, Transport};
use crate::error::ExchangeError;
use async_trait::async_trait;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::trace;

/// Used when a nameserver's configured timeout is zero.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_UDP_RESPONSE: usize = 4096;

/// One query exchange against one nameserver.
///
/// The trait is the seam between the resolution engine and the network, so
/// the engine can be exercised against a scripted upstream in tests.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(
        &self,
        message: &Message,
        nameserver: &Nameserver,
    ) -> Result<Message, ExchangeError>;
}

/// Exchanges DNS messages with upstream nameservers over UDP or TCP.
///
/// Each exchange opens a fresh socket, sends one message and awaits one
/// response, bounded by the nameserver's timeout. A response with the TC bit
/// set still decodes and is returned as a success; whether to re-query over
/// TCP is the caller's decision, not this layer's.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpstreamClient;

impl UpstreamClient {
    pub fn new() -> Self {
        Self
    }

    async fn exchange_udp(
        payload: &[u8],
        nameserver: SocketAddr,
    ) -> Result<Message, ExchangeError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| io_error(nameserver, e))?;
        socket
            .connect(nameserver)
            .await
            .map_err(|e| io_error(nameserver, e))?;
        socket
            .send(payload)
            .await
            .map_err(|e| io_error(nameserver, e))?;

        let mut response = vec![0u8; MAX_UDP_RESPONSE];
        let len = socket
            .recv(&mut response)
            .await
            .map_err(|e| io_error(nameserver, e))?;
        trace!("received {} bytes over udp from {}", len, nameserver);

        Message::from_vec(&response[..len]).map_err(|e| ExchangeError::Decode {
            nameserver,
            message: e.to_string(),
        })
    }

    async fn exchange_tcp(
        payload: &[u8],
        nameserver: SocketAddr,
    ) -> Result<Message, ExchangeError> {
        let mut stream = TcpStream::connect(nameserver)
            .await
            .map_err(|e| io_error(nameserver, e))?;

        // RFC 1035 4.2.2: two-byte big-endian length prefix
        let length = payload.len() as u16;
        stream
            .write_all(&length.to_be_bytes())
            .await
            .map_err(|e| io_error(nameserver, e))?;
        stream
            .write_all(payload)
            .await
            .map_err(|e| io_error(nameserver, e))?;
        stream.flush().await.map_err(|e| io_error(nameserver, e))?;

        let mut length_buf = [0u8; 2];
        stream
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| io_error(nameserver, e))?;
        let response_length = u16::from_be_bytes(length_buf) as usize;

        let mut response = vec![0u8; response_length];
        stream
            .read_exact(&mut response)
            .await
            .map_err(|e| io_error(nameserver, e))?;
        trace!(
            "received {} bytes over tcp from {}",
            response_length, nameserver
        );

        Message::from_vec(&response).map_err(|e| ExchangeError::Decode {
            nameserver,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Exchange for UpstreamClient {
    async fn exchange(
        &self,
        message: &Message,
        nameserver: &Nameserver,
    ) -> Result<Message, ExchangeError> {
        let payload = message
            .to_vec()
            .map_err(|e| ExchangeError::Encode(e.to_string()))?;

        let wait = if nameserver.timeout.is_zero() {
            DEFAULT_EXCHANGE_TIMEOUT
        } else {
            nameserver.timeout
        };

        let exchange = async {
            match nameserver.transport {
                Transport::Udp => Self::exchange_udp(&payload, nameserver.address).await,
                Transport::Tcp => Self::exchange_tcp(&payload, nameserver.address).await,
            }
        };

        match timeout(wait, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout {
                nameserver: nameserver.address,
                wait,
            }),
        }
    }
}

fn io_error(nameserver: SocketAddr, error: std::io::Error) -> ExchangeError {
    ExchangeError::Io {
        nameserver,
        message: error.to_string(),
    }
}
