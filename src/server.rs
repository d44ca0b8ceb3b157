use crate::handler::QueryRouter;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const MAX_UDP_PACKET: usize = 4096;

/// Run the UDP DNS listener until shutdown is signalled.
///
/// Every inbound packet is handled on its own task running the full
/// dispatcher or gate path to completion.
pub async fn run_udp_server(
    socket: UdpSocket,
    router: Arc<QueryRouter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let socket = Arc::new(socket);
    info!("UDP DNS server listening on {}", socket.local_addr()?);

    let mut buf = vec![0u8; MAX_UDP_PACKET];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("UDP server shutdown complete");
                break;
            }

            result = socket.recv_from(&mut buf) => {
                let (read_bytes, client) = result?;
                let query_data = buf[..read_bytes].to_vec();
                let router = router.clone();
                let socket = socket.clone();

                tokio::spawn(async move {
                    let request = match Message::from_vec(&query_data) {
                        Ok(request) => request,
                        Err(e) => {
                            debug!("malformed UDP packet from {}: {}", client, e);
                            return;
                        }
                    };

                    let reply = router.handle(&request, client).await;
                    match reply.to_vec() {
                        Ok(payload) => {
                            if let Err(e) = socket.send_to(&payload, client).await {
                                error!("failed to send UDP reply to {}: {}", client, e);
                            }
                        }
                        Err(e) => error!("failed to encode reply for {}: {}", client, e),
                    }
                });
            }
        }
    }

    Ok(())
}

/// Run the TCP DNS listener until shutdown is signalled.
pub async fn run_tcp_server(
    listener: TcpListener,
    router: Arc<QueryRouter>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("TCP DNS server listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("TCP server shutdown complete");
                break;
            }

            result = listener.accept() => {
                let (stream, client) = result?;
                let router = router.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_tcp_connection(stream, client, router).await {
                        warn!("TCP connection error from {}: {}", client, e);
                    }
                });
            }
        }
    }

    Ok(())
}

/// Serve queries on one TCP connection until the peer closes it.
///
/// Messages are framed with the RFC 1035 two-byte length prefix.
async fn handle_tcp_connection(
    mut stream: TcpStream,
    client: SocketAddr,
    router: Arc<QueryRouter>,
) -> std::io::Result<()> {
    loop {
        let mut length_buf = [0u8; 2];
        match stream.read_exact(&mut length_buf).await {
            Ok(_) => {}
            // Clean close between messages
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let length = u16::from_be_bytes(length_buf) as usize;
        let mut query_data = vec![0u8; length];
        stream.read_exact(&mut query_data).await?;

        let request = match Message::from_vec(&query_data) {
            Ok(request) => request,
            Err(e) => {
                debug!("malformed TCP message from {}: {}", client, e);
                return Ok(());
            }
        };

        let reply = router.handle(&request, client).await;
        let payload = match reply.to_vec() {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode reply for {}: {}", client, e);
                return Ok(());
            }
        };

        stream
            .write_all(&(payload.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
    }
}
