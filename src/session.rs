/// Per-connection session handling
///
/// A session owns one accepted socket and its inbound buffer. Bytes are
/// accumulated until the codec can carve a full frame off the front, so
/// requests split across TCP segments and several requests packed into one
/// segment are both handled. Failures stay inside the session: the
/// listener and other clients never see them.

use bytes::BytesMut;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};

use crate::codec::{take_frame, FrameCodec, Handled};
use crate::error::ModbusResult;
use crate::logging::Direction;
use crate::server::ServerStats;

/// Initial inbound buffer capacity, one maximal frame
const INBOUND_CAPACITY: usize = crate::MAX_TCP_FRAME_SIZE;

/// One accepted client connection
#[derive(Debug)]
pub struct ServerSession {
    remote_address: SocketAddr,
    inbound: BytesMut,
}

impl ServerSession {
    pub fn new(remote_address: SocketAddr) -> Self {
        Self {
            remote_address,
            inbound: BytesMut::with_capacity(INBOUND_CAPACITY),
        }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    /// Bytes received but not yet forming a complete frame
    pub fn pending_bytes(&self) -> usize {
        self.inbound.len()
    }

    /// Read and answer frames until the peer closes, an I/O error occurs or
    /// shutdown is signalled
    pub async fn run<S>(
        &mut self,
        stream: &mut S,
        codec: &FrameCodec,
        stats: &Arc<Mutex<ServerStats>>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> ModbusResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Shutdown signal received for client {}", self.remote_address);
                    return Ok(());
                }
                read = stream.read_buf(&mut self.inbound) => {
                    let bytes_read = read?;
                    if bytes_read == 0 {
                        if !self.inbound.is_empty() {
                            debug!(
                                "Client {} closed with {} unframed bytes pending",
                                self.remote_address,
                                self.pending_bytes()
                            );
                        }
                        return Ok(());
                    }
                    stats.lock().await.bytes_received += bytes_read as u64;
                    self.drain(stream, codec, stats).await?;
                }
            }
        }
    }

    /// Answer every complete frame currently buffered, in arrival order
    async fn drain<S>(
        &mut self,
        stream: &mut S,
        codec: &FrameCodec,
        stats: &Arc<Mutex<ServerStats>>,
    ) -> ModbusResult<()>
    where
        S: AsyncWrite + Unpin,
    {
        let peer = self.remote_address;
        let trace = codec.trace();

        while let Some(frame) = take_frame(&mut self.inbound) {
            trace.frame(peer, Direction::Inbound, &frame);
            stats.lock().await.frames_received += 1;

            match codec.handle(peer, &frame) {
                Ok(Handled::Reply { response, padded }) => {
                    stream.write_all(&response).await?;
                    trace.frame(peer, Direction::Outbound, &response);

                    let mut stats = stats.lock().await;
                    stats.responses_sent += 1;
                    stats.bytes_sent += response.len() as u64;
                    if padded {
                        stats.short_payloads += 1;
                    }
                }
                Ok(Handled::Ignored { .. }) | Ok(Handled::Truncated) | Ok(Handled::Oversized { .. }) => {
                    stats.lock().await.ignored_frames += 1;
                }
                Err(e) => {
                    warn!("Error processing request from {}: {}", peer, e);
                    stats.lock().await.failed_frames += 1;
                }
            }
        }
        Ok(())
    }
}

/// Serve one accepted client until it goes away
pub async fn serve<S>(
    mut stream: S,
    peer: SocketAddr,
    codec: FrameCodec,
    stats: Arc<Mutex<ServerStats>>,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!("📡 New client connected: {}", peer);
    {
        let mut stats = stats.lock().await;
        stats.connections_accepted += 1;
        stats.active_connections += 1;
    }

    let mut session = ServerSession::new(peer);
    match session.run(&mut stream, &codec, &stats, &mut shutdown).await {
        Ok(()) => info!("🔌 Client {} disconnected", peer),
        Err(e) => warn!("🔌 Client {} dropped: {}", peer, e),
    }

    let mut stats = stats.lock().await;
    stats.active_connections = stats.active_connections.saturating_sub(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coil_bank::CoilBank;
    use crate::logging::FrameTrace;
    use tokio::io::duplex;

    fn write_coils_frame(tid: u8, address: u16, bit_count: u16, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x00, tid, 0x00, 0x00];
        frame.extend_from_slice(&((7 + data.len()) as u16).to_be_bytes());
        frame.extend_from_slice(&[0x01, 0x0F]);
        frame.extend_from_slice(&address.to_be_bytes());
        frame.extend_from_slice(&bit_count.to_be_bytes());
        frame.push(data.len() as u8);
        frame.extend_from_slice(data);
        frame
    }

    #[tokio::test]
    async fn test_split_and_pipelined_frames() {
        let bank = Arc::new(CoilBank::new(48));
        let codec = FrameCodec::new(bank.clone(), FrameTrace::default());
        let stats = Arc::new(Mutex::new(ServerStats::default()));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (mut client, server) = duplex(1024);
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let task = tokio::spawn(serve(server, peer, codec, stats.clone(), shutdown_rx));

        let first = write_coils_frame(1, 0, 2, &[0b11]);
        let second = write_coils_frame(2, 8, 1, &[0b1]);

        // First frame split in two writes
        client.write_all(&first[..4]).await.unwrap();
        client.write_all(&first[4..]).await.unwrap();
        let mut response = [0u8; 12];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], 1);

        // Unsupported request followed by a write in one segment
        let mut packed = vec![0x00, 0x09, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        packed.extend_from_slice(&second);
        client.write_all(&packed).await.unwrap();
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], 2);
        assert_eq!(&response[8..], &[0x00, 0x08, 0x00, 0x01]);

        drop(client);
        task.await.unwrap();

        assert!(bank.read_raw(0).unwrap());
        assert!(bank.read_raw(1).unwrap());
        assert!(bank.read_level(8).unwrap());

        let stats = stats.lock().await;
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.responses_sent, 2);
        assert_eq!(stats.ignored_frames, 1);
        assert_eq!(stats.active_connections, 0);
    }

    #[tokio::test]
    async fn test_partial_frame_stays_buffered() {
        let bank = Arc::new(CoilBank::new(8));
        let codec = FrameCodec::new(bank.clone(), FrameTrace::default());
        let stats = Arc::new(Mutex::new(ServerStats::default()));
        let (_shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let (mut client, mut server) = duplex(64);
        let peer: SocketAddr = "127.0.0.1:40003".parse().unwrap();
        let mut session = ServerSession::new(peer);
        assert_eq!(session.remote_address(), peer);
        assert_eq!(session.pending_bytes(), 0);

        let frame = write_coils_frame(3, 0, 1, &[0b1]);
        client.write_all(&frame[..5]).await.unwrap();
        drop(client);

        session
            .run(&mut server, &codec, &stats, &mut shutdown_rx)
            .await
            .unwrap();

        assert_eq!(session.pending_bytes(), 5);
        assert!(!bank.read_raw(0).unwrap());
        let stats = stats.lock().await;
        assert_eq!(stats.bytes_received, 5);
        assert_eq!(stats.frames_received, 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_session() {
        let codec = FrameCodec::new(Arc::new(CoilBank::new(8)), FrameTrace::default());
        let stats = Arc::new(Mutex::new(ServerStats::default()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let (_client, server) = duplex(64);
        let peer: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let task = tokio::spawn(serve(server, peer, codec, stats.clone(), shutdown_rx));

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert_eq!(stats.lock().await.connections_accepted, 1);
    }
}
