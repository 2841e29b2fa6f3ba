//! Datagram-binding client: independent per-range workers.
//!
//! After a `CONNECT`/`WELCOME` handshake, each planned range is owned by one
//! worker with its own socket. A worker walks its range one sequence number
//! at a time: `GET|name|seq`, await the packet, validate sequence and CRC32,
//! append and advance. A timeout, checksum mismatch, or unexpected sequence
//! sends `RESEND|name|seq` for the same sequence number — bounded by a retry
//! budget, after which the transfer fails loudly. There is no cumulative
//! acknowledgement; requesting `seq + 1` is the acknowledgement for `seq`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::plan::{plan_aligned, ByteRange};
use crate::proto::datagram::{checksum, DatagramReply, DatagramRequest};
use crate::proto::DATAGRAM_HEADER_MAX;
use crate::reassemble;

/// Datagram-binding client: catalog queries on a shared socket, transfers on
/// per-range worker sockets.
pub struct DatagramClient {
    config: Arc<Config>,
    server: SocketAddr,
    socket: UdpSocket,
}

impl DatagramClient {
    /// Bind the query socket and perform the `CONNECT`/`WELCOME` handshake.
    pub async fn connect(config: Arc<Config>, server_addr: &str) -> Result<Self> {
        let server: SocketAddr = server_addr
            .parse()
            .map_err(|e| TransferError::Protocol(format!("bad server address: {e}")))?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let client = Self {
            config,
            server,
            socket,
        };
        match client.exchange(&DatagramRequest::Connect).await? {
            DatagramReply::Welcome => {
                info!(server = %server, "Connected");
                Ok(client)
            }
            other => Err(TransferError::Protocol(format!(
                "expected WELCOME, got {other:?}"
            ))),
        }
    }

    /// `LIST`: resource names available on the server.
    pub async fn list(&self) -> Result<Vec<String>> {
        match self.exchange(&DatagramRequest::List).await? {
            DatagramReply::List(names) => Ok(names),
            DatagramReply::Error(message) => Err(TransferError::Server(message)),
            other => Err(TransferError::Protocol(format!(
                "expected LIST reply, got {other:?}"
            ))),
        }
    }

    /// `SIZE|name`: size of one resource.
    pub async fn size(&self, name: &str) -> Result<u64> {
        match self
            .exchange(&DatagramRequest::Size { name: name.into() })
            .await?
        {
            DatagramReply::Size(bytes) => Ok(bytes),
            DatagramReply::Error(message) => Err(TransferError::Server(message)),
            other => Err(TransferError::Protocol(format!(
                "expected SIZE reply, got {other:?}"
            ))),
        }
    }

    /// `CHECK|name`: whether the server has the resource.
    pub async fn check(&self, name: &str) -> Result<bool> {
        match self
            .exchange(&DatagramRequest::Check { name: name.into() })
            .await?
        {
            DatagramReply::Exists => Ok(true),
            DatagramReply::NotFound => Ok(false),
            DatagramReply::Error(message) => Err(TransferError::Server(message)),
            other => Err(TransferError::Protocol(format!(
                "expected CHECK reply, got {other:?}"
            ))),
        }
    }

    /// Fetch one resource into `dest_dir`: plan payload-aligned ranges, run
    /// one worker per range, write buffers in worker order.
    pub async fn fetch(
        &self,
        name: &str,
        dest_dir: &Path,
        shutdown: &CancellationToken,
    ) -> Result<PathBuf> {
        let size = self.size(name).await?;
        let dest = dest_dir.join(name);
        tokio::fs::create_dir_all(dest_dir).await?;

        let plan = plan_aligned(
            size,
            self.config.transfer.pipe_count,
            self.config.transfer.payload_size,
        )?;
        if plan.ranges.is_empty() {
            tokio::fs::File::create(&dest).await?;
            info!(file = %name, "Empty resource materialized");
            return Ok(dest);
        }

        info!(
            file = %name,
            size,
            workers = plan.ranges.len(),
            "Starting datagram transfer"
        );

        let mut workers = JoinSet::new();
        for (index, range) in plan.ranges.iter().enumerate() {
            let worker = RangeWorker {
                server: self.server,
                name: name.to_string(),
                range: *range,
                payload_size: u64::from(self.config.transfer.payload_size),
                recv_timeout: Duration::from_secs(self.config.transfer.timeout_secs),
                max_retries: self.config.transfer.max_retries,
            };
            let token = shutdown.clone();
            workers.spawn(async move { (index, worker.run(token).await) });
        }

        let mut buffers: Vec<Option<Vec<u8>>> = vec![None; plan.ranges.len()];
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, Ok(buffer))) => buffers[index] = Some(buffer),
                Ok((index, Err(e))) => {
                    warn!(file = %name, worker = index, "Range worker failed: {e}");
                    first_error.get_or_insert(e);
                    workers.abort_all();
                }
                Err(e) => {
                    first_error
                        .get_or_insert(TransferError::Protocol(format!("worker task died: {e}")));
                    workers.abort_all();
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let buffers: Vec<Vec<u8>> = buffers.into_iter().flatten().collect();
        reassemble::write_buffers(&dest, &buffers, size, name).await?;
        Ok(dest)
    }

    /// One bounded request/reply round trip on the query socket.
    async fn exchange(&self, request: &DatagramRequest) -> Result<DatagramReply> {
        self.socket
            .send_to(&request.encode(), self.server)
            .await?;
        let mut buf =
            vec![0u8; self.config.transfer.payload_size as usize + DATAGRAM_HEADER_MAX + 4096];
        let wait = Duration::from_secs(self.config.transfer.timeout_secs);
        match timeout(wait, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => DatagramReply::parse(&buf[..len]),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransferError::Timeout {
                what: format!("reply to {request:?}"),
            }),
        }
    }
}

/// Owns one byte range of one transfer.
struct RangeWorker {
    server: SocketAddr,
    name: String,
    range: ByteRange,
    payload_size: u64,
    recv_timeout: Duration,
    max_retries: u32,
}

impl RangeWorker {
    async fn run(&self, shutdown: CancellationToken) -> Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let mut buf = vec![0u8; self.payload_size as usize + DATAGRAM_HEADER_MAX];
        let mut buffer = Vec::with_capacity(self.range.len() as usize);

        let mut offset = self.range.start;
        let mut seq = self.range.start / self.payload_size;
        let mut attempts = 0u32;

        while offset <= self.range.end {
            if shutdown.is_cancelled() {
                return Err(TransferError::Canceled);
            }

            // First try is a GET; every retry of the same seq is a RESEND.
            let request = if attempts == 0 {
                DatagramRequest::Get {
                    name: self.name.clone(),
                    seq,
                }
            } else {
                DatagramRequest::Resend {
                    name: self.name.clone(),
                    seq,
                }
            };
            socket.send_to(&request.encode(), self.server).await?;

            let received = tokio::select! {
                () = shutdown.cancelled() => return Err(TransferError::Canceled),
                received = timeout(self.recv_timeout, socket.recv_from(&mut buf)) => received,
            };
            let reply = match received {
                Ok(Ok((len, _))) => DatagramReply::parse(&buf[..len]),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!(file = %self.name, seq, "Receive timed out, requesting resend");
                    attempts += 1;
                    self.check_budget(seq, attempts)?;
                    continue;
                }
            };

            match reply {
                Ok(DatagramReply::Eof) => break,
                Ok(DatagramReply::Packet {
                    seq: got,
                    checksum: claimed,
                    mut payload,
                }) if got == seq && checksum(&payload) == claimed => {
                    // A packet can only overrun the range if the server's
                    // payload size disagrees with ours; clamp to the range.
                    let remaining = (self.range.end - offset + 1) as usize;
                    payload.truncate(remaining);
                    offset += payload.len() as u64;
                    buffer.extend_from_slice(&payload);
                    seq += 1;
                    attempts = 0;
                }
                Ok(DatagramReply::Packet { seq: got, .. }) => {
                    debug!(
                        file = %self.name,
                        expected = seq,
                        got,
                        "Corrupt or out-of-sequence packet, requesting resend"
                    );
                    attempts += 1;
                    self.check_budget(seq, attempts)?;
                }
                Ok(DatagramReply::Error(message)) => return Err(TransferError::Server(message)),
                Ok(other) => {
                    return Err(TransferError::Protocol(format!(
                        "unexpected reply {other:?}"
                    )))
                }
                Err(e) => {
                    debug!(file = %self.name, seq, "Unparseable packet: {e}");
                    attempts += 1;
                    self.check_budget(seq, attempts)?;
                }
            }
        }

        debug!(file = %self.name, range = %self.range, "Range complete");
        Ok(buffer)
    }

    fn check_budget(&self, seq: u64, attempts: u32) -> Result<()> {
        if attempts > self.max_retries {
            return Err(TransferError::RetriesExhausted {
                file: self.name.clone(),
                seq,
                attempts,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, TransferConfig};
    use crate::server::DatagramServer;

    fn test_config(resource_dir: &Path, payload_size: u32) -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                resource_dir: resource_dir.to_string_lossy().into_owned(),
                ..Default::default()
            },
            transfer: TransferConfig {
                payload_size,
                timeout_secs: 2,
                max_retries: 3,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    async fn start_server(config: Arc<Config>) -> (SocketAddr, CancellationToken) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let server = DatagramServer::new(config);
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(async move { server.serve(socket, shutdown).await });
        (addr, token)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_fetch_round_trip() {
        let resources = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let payload = patterned(10_000);
        std::fs::write(resources.path().join("data.bin"), &payload).unwrap();

        let config = test_config(resources.path(), 512);
        let (addr, token) = start_server(Arc::clone(&config)).await;

        let client = DatagramClient::connect(config, &addr.to_string())
            .await
            .unwrap();
        assert_eq!(client.list().await.unwrap(), vec!["data.bin".to_string()]);
        assert_eq!(client.size("data.bin").await.unwrap(), 10_000);
        assert!(client.check("data.bin").await.unwrap());

        let shutdown = CancellationToken::new();
        let dest = client
            .fetch("data.bin", downloads.path(), &shutdown)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), payload);
        token.cancel();
    }

    #[tokio::test]
    async fn test_corrupted_packet_triggers_single_resend() {
        // Scripted peer: first GET answered with a corrupted packet, the
        // expected RESEND answered correctly, then EOF.
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();
        let payload = b"0123456789abcdef".to_vec();
        let script_payload = payload.clone();

        let script = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut resend_count = 0u32;

            let (len, client_addr) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(
                DatagramRequest::parse(&buf[..len]).unwrap(),
                DatagramRequest::Get { name: "f".into(), seq: 0 }
            );
            let corrupted = DatagramReply::Packet {
                seq: 0,
                checksum: checksum(&script_payload).wrapping_add(1),
                payload: script_payload.clone(),
            };
            peer.send_to(&corrupted.encode(), client_addr).await.unwrap();

            let (len, client_addr) = peer.recv_from(&mut buf).await.unwrap();
            assert_eq!(
                DatagramRequest::parse(&buf[..len]).unwrap(),
                DatagramRequest::Resend { name: "f".into(), seq: 0 }
            );
            resend_count += 1;
            let good = DatagramReply::Packet {
                seq: 0,
                checksum: checksum(&script_payload),
                payload: script_payload.clone(),
            };
            peer.send_to(&good.encode(), client_addr).await.unwrap();

            resend_count
        });

        let worker = RangeWorker {
            server: addr,
            name: "f".into(),
            range: ByteRange { start: 0, end: 15 },
            payload_size: 16,
            recv_timeout: Duration::from_secs(2),
            max_retries: 3,
        };
        let buffer = worker.run(CancellationToken::new()).await.unwrap();
        assert_eq!(buffer, payload);
        assert_eq!(script.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        // Scripted peer: every request answered with a corrupted packet. The
        // worker must fail after its budget, not loop forever.
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let Ok((_, client_addr)) = peer.recv_from(&mut buf).await else {
                    break;
                };
                let junk = DatagramReply::Packet {
                    seq: 0,
                    checksum: 0xdead_beef,
                    payload: b"garbage".to_vec(),
                };
                let _ = peer.send_to(&junk.encode(), client_addr).await;
            }
        });

        let worker = RangeWorker {
            server: addr,
            name: "f".into(),
            range: ByteRange { start: 0, end: 15 },
            payload_size: 16,
            recv_timeout: Duration::from_secs(2),
            max_retries: 2,
        };
        let err = worker.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetriesExhausted { seq: 0, attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_short_final_packet_completes_range() {
        let resources = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        // 100 bytes, payload 16, 4 pipes: aligned range_len = 32, so the last
        // worker's range is [96-99] and the server's final packet is short.
        let payload = patterned(100);
        std::fs::write(resources.path().join("tail.bin"), &payload).unwrap();

        let config = test_config(resources.path(), 16);
        let (addr, token) = start_server(Arc::clone(&config)).await;

        let client = DatagramClient::connect(config, &addr.to_string())
            .await
            .unwrap();
        let shutdown = CancellationToken::new();
        let dest = client
            .fetch("tail.bin", downloads.path(), &shutdown)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest).unwrap(), payload);
        token.cancel();
    }
}
