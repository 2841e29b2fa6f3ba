//! Datagram-binding server: a stateless request loop per socket.
//!
//! Every datagram is a self-contained request; the only "session" state is
//! the `CONNECT`/`WELCOME` handshake exchange itself. `GET` and `RESEND` are
//! served identically — both re-read the requested packet from disk, recompute
//! its checksum, and send it, so a retransmission needs no server-side state.
//!
//! The multi-port variant binds several consecutive ports and runs one
//! independent copy of the loop per socket; the sockets share nothing but the
//! read-only resource directory.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ResourceCatalog;
use crate::config::Config;
use crate::error::Result;
use crate::proto::datagram::{checksum, DatagramReply, DatagramRequest};

/// Datagram-binding server dispatcher.
#[derive(Clone)]
pub struct DatagramServer {
    config: Arc<Config>,
    catalog: ResourceCatalog,
}

impl DatagramServer {
    pub fn new(config: Arc<Config>) -> Self {
        let catalog = ResourceCatalog::new(config.server.resource_dir.clone());
        Self { config, catalog }
    }

    /// Run one request loop per socket; returns when `shutdown` fires.
    pub async fn serve_all(
        &self,
        sockets: Vec<UdpSocket>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        for socket in sockets {
            let server = self.clone();
            let token = shutdown.clone();
            tasks.spawn(async move { server.serve(socket, token).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Datagram listener failed: {e}"),
                Err(e) => warn!("Datagram listener panicked: {e}"),
            }
        }
        Ok(())
    }

    /// Single-socket request loop.
    pub async fn serve(&self, socket: UdpSocket, shutdown: CancellationToken) -> Result<()> {
        let local = socket.local_addr()?;
        info!(addr = %local, "Datagram server listening");

        // Debounced logging state (local to this socket's loop).
        let mut last_list: Option<Vec<String>> = None;
        let mut buf = vec![0u8; 2048];

        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };
            let (len, peer) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(addr = %local, "Datagram receive failed: {e}");
                    continue;
                }
            };

            let reply = match DatagramRequest::parse(&buf[..len]) {
                Ok(DatagramRequest::Connect) => {
                    info!(addr = %local, peer = %peer, "Client connected");
                    DatagramReply::Welcome
                }
                Ok(DatagramRequest::List) => {
                    let names: Vec<String> = self
                        .catalog
                        .scan()
                        .await
                        .into_iter()
                        .map(|r| r.name)
                        .collect();
                    if last_list.as_ref() != Some(&names) {
                        info!(addr = %local, count = names.len(), "File list updated");
                        last_list = Some(names.clone());
                    }
                    DatagramReply::List(names)
                }
                Ok(DatagramRequest::Size { name }) => match self.catalog.size_of(&name).await {
                    Some(size) => {
                        debug!(file = %name, size, "Size query");
                        DatagramReply::Size(size)
                    }
                    None => DatagramReply::Error("File not found.".into()),
                },
                Ok(DatagramRequest::Check { name }) => {
                    if self.catalog.size_of(&name).await.is_some() {
                        DatagramReply::Exists
                    } else {
                        DatagramReply::NotFound
                    }
                }
                Ok(DatagramRequest::Get { name, seq }) => self.serve_packet(&name, seq).await,
                Ok(DatagramRequest::Resend { name, seq }) => {
                    debug!(file = %name, seq, peer = %peer, "Resend requested");
                    self.serve_packet(&name, seq).await
                }
                Err(e) => {
                    warn!(peer = %peer, "Bad request: {e}");
                    DatagramReply::Error("Unknown command.".into())
                }
            };

            if let Err(e) = socket.send_to(&reply.encode(), peer).await {
                warn!(peer = %peer, "Datagram send failed: {e}");
            }
        }

        info!(addr = %local, "Datagram server shutting down");
        Ok(())
    }

    /// Read packet `seq` of `name` and wrap it with its checksum. Offsets at
    /// or past end-of-file answer with the `EOF` sentinel.
    async fn serve_packet(&self, name: &str, seq: u64) -> DatagramReply {
        let Some(path) = self.catalog.resolve(name) else {
            return DatagramReply::Error("File not found.".into());
        };
        let payload_size = u64::from(self.config.transfer.payload_size);
        let offset = seq * payload_size;

        match read_chunk_at(&path, offset, payload_size as usize).await {
            Ok(payload) if payload.is_empty() => DatagramReply::Eof,
            Ok(payload) => DatagramReply::Packet {
                seq,
                checksum: checksum(&payload),
                payload,
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                DatagramReply::Error("File not found.".into())
            }
            Err(e) => {
                warn!(file = %name, seq, "Packet read failed: {e}");
                DatagramReply::Error("Read failed.".into())
            }
        }
    }
}

/// Read up to `len` bytes at `offset`, short only at end-of-file.
async fn read_chunk_at(
    path: &std::path::Path,
    offset: u64,
    len: usize,
) -> std::io::Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut payload = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut payload[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    payload.truncate(filled);
    Ok(payload)
}
