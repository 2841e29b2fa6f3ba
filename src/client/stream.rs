//! Stream-binding client: one control connection, N data channels.
//!
//! Range requests for a file are dispatched sequentially on the control
//! connection; the framed responses are received concurrently, one receiver
//! task per assigned data channel, each writing into its channel's temp file.
//! Reassembly in ChannelId order then produces the artifact.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::ResourceDescriptor;
use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::plan::plan;
use crate::proto::stream::{
    encode_command, parse_catalog, parse_chunk_header, parse_port_reply, read_frame, ChunkRequest,
    ControlCommand,
};
use crate::proto::{CATALOG_FRAME_SIZE, CONTROL_FRAME_SIZE};
use crate::reassemble;

/// Bound on any single wait for a control reply or a chunk on a data channel.
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// A connected stream-binding session: control connection plus, after
/// [`StreamSession::open_channels`], the parallel data channels.
pub struct StreamSession {
    config: Arc<Config>,
    server_addr: SocketAddr,
    control_rd: OwnedReadHalf,
    control_wr: OwnedWriteHalf,
    channels: Vec<Arc<Mutex<BufReader<TcpStream>>>>,
}

impl StreamSession {
    /// Connect the control connection. Failure aborts the session — there is
    /// no automatic retry at this level.
    pub async fn connect(config: Arc<Config>) -> Result<Self> {
        let addr: SocketAddr = config
            .client
            .server_addr
            .parse()
            .map_err(|e| TransferError::Protocol(format!("bad server address: {e}")))?;
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|source| TransferError::Connect {
                addr: config.client.server_addr.clone(),
                source,
            })?;
        info!(server = %addr, "Control connection established");
        let (control_rd, control_wr) = socket.into_split();
        Ok(Self {
            config,
            server_addr: addr,
            control_rd,
            control_wr,
            channels: Vec::new(),
        })
    }

    /// `LIST`: fetch and parse the server's catalog.
    pub async fn list(&mut self) -> Result<Vec<ResourceDescriptor>> {
        self.control_wr
            .write_all(&encode_command(&ControlCommand::List)?)
            .await?;
        let frame = self.read_reply(CATALOG_FRAME_SIZE).await?;
        let resources = parse_catalog(&frame)?;
        debug!(entries = resources.len(), "Catalog received");
        Ok(resources)
    }

    /// `OPEN`: learn the ephemeral data port and connect `pipe_count`
    /// channels to it, in ChannelId order.
    pub async fn open_channels(&mut self) -> Result<()> {
        self.control_wr
            .write_all(&encode_command(&ControlCommand::Open)?)
            .await?;
        let frame = self.read_reply(CONTROL_FRAME_SIZE).await?;
        let port = parse_port_reply(&frame)?;

        let data_addr = SocketAddr::new(self.server_addr.ip(), port);
        let pipe_count = self.config.transfer.pipe_count;
        let mut channels = Vec::with_capacity(pipe_count as usize);
        for channel_id in 0..pipe_count {
            let socket =
                TcpStream::connect(data_addr)
                    .await
                    .map_err(|source| TransferError::Connect {
                        addr: data_addr.to_string(),
                        source,
                    })?;
            debug!(channel_id, port, "Data channel connected");
            channels.push(Arc::new(Mutex::new(BufReader::new(socket))));
        }
        self.channels = channels;
        info!(count = pipe_count, port, "Data channels open");
        Ok(())
    }

    /// Fetch one resource into `dest_dir`, reassembling per-channel parts.
    pub async fn fetch(
        &mut self,
        resource: &ResourceDescriptor,
        dest_dir: &Path,
        shutdown: &CancellationToken,
    ) -> Result<PathBuf> {
        let dest = dest_dir.join(&resource.name);
        tokio::fs::create_dir_all(dest_dir).await?;

        let plan = plan(resource.size_bytes, self.config.transfer.pipe_count)?;
        if plan.ranges.is_empty() {
            // Zero-byte resource: nothing to request.
            tokio::fs::File::create(&dest).await?;
            info!(file = %resource.name, "Empty resource materialized");
            return Ok(dest);
        }
        if self.channels.is_empty() {
            return Err(TransferError::Protocol(
                "fetch before open_channels: no data channels".into(),
            ));
        }

        let mut receivers = JoinSet::new();
        for range in &plan.ranges {
            let request = ChunkRequest {
                name: resource.name.clone(),
                file_size: resource.size_bytes,
                range: *range,
            };
            // Dispatch sequentially on control…
            self.control_wr
                .write_all(&encode_command(&ControlCommand::Get(request.clone()))?)
                .await?;

            // …receive concurrently on the assigned channel.
            let channel_id = plan.channel_for(range, self.config.transfer.pipe_count);
            let channel = Arc::clone(&self.channels[channel_id as usize]);
            let part = reassemble::part_path(&dest, channel_id);
            let token = shutdown.clone();
            receivers.spawn(async move {
                tokio::select! {
                    () = token.cancelled() => Err(TransferError::Canceled),
                    received = receive_chunk(channel, &request, &part) => received,
                }
            });
        }

        while let Some(joined) = receivers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    receivers.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    receivers.abort_all();
                    return Err(TransferError::Protocol(format!("receiver task died: {e}")));
                }
            }
        }

        reassemble::assemble_parts(&dest, plan.ranges.len() as u32, resource.size_bytes, &resource.name)
            .await?;
        Ok(dest)
    }

    async fn read_reply(&mut self, width: usize) -> Result<Vec<u8>> {
        match timeout(REPLY_TIMEOUT, read_frame(&mut self.control_rd, width)).await {
            Ok(Ok(Some(frame))) => Ok(frame),
            Ok(Ok(None)) => Err(TransferError::Protocol(
                "server closed the control connection".into(),
            )),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransferError::Timeout {
                what: "control reply".into(),
            }),
        }
    }
}

/// Await exactly one framed chunk on `channel` and stream its payload into
/// `part`. The echoed header must match the request — a mismatch means
/// responses crossed channels.
async fn receive_chunk(
    channel: Arc<Mutex<BufReader<TcpStream>>>,
    request: &ChunkRequest,
    part: &Path,
) -> Result<()> {
    let mut reader = channel.lock().await;

    let mut header = Vec::new();
    let read_header = reader.read_until(b'\n', &mut header);
    match timeout(REPLY_TIMEOUT, read_header).await {
        Ok(Ok(0)) => {
            return Err(TransferError::Protocol(
                "data channel closed before response".into(),
            ))
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(TransferError::Timeout {
                what: format!("chunk {} of {}", request.range, request.name),
            })
        }
    }

    let header = String::from_utf8(header)
        .map_err(|_| TransferError::Protocol("chunk header is not valid UTF-8".into()))?;
    let echoed = parse_chunk_header(&header)?;
    if echoed != *request {
        return Err(TransferError::Protocol(format!(
            "response mismatch: asked {} of {}, got {} of {}",
            request.range, request.name, echoed.range, echoed.name
        )));
    }

    let mut part_file = tokio::fs::File::create(part).await?;
    let len = request.range.len();
    let mut limited = (&mut *reader).take(len);
    let copy = tokio::io::copy(&mut limited, &mut part_file);
    let copied = match timeout(REPLY_TIMEOUT, copy).await {
        Ok(Ok(copied)) => copied,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(TransferError::Timeout {
                what: format!("payload of {} {}", request.name, request.range),
            })
        }
    };
    if copied != len {
        return Err(TransferError::SizeMismatch {
            file: request.name.clone(),
            expected: len,
            actual: copied,
        });
    }
    part_file.flush().await?;
    debug!(file = %request.name, range = %request.range, "Chunk received");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ServerConfig, TransferConfig};
    use crate::server::StreamServer;
    use tokio::net::TcpListener;

    async fn start_server(resource_dir: &Path) -> (SocketAddr, CancellationToken, Arc<Config>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Arc::new(Config {
            server: ServerConfig {
                resource_dir: resource_dir.to_string_lossy().into_owned(),
                open_accept_timeout_secs: 5,
                ..Default::default()
            },
            client: ClientConfig {
                server_addr: addr.to_string(),
                ..Default::default()
            },
            transfer: TransferConfig::default(),
            ..Default::default()
        });
        let server = StreamServer::new(Arc::clone(&config));
        let token = CancellationToken::new();
        let shutdown = token.clone();
        tokio::spawn(async move { server.serve(listener, shutdown).await });
        (addr, token, config)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_list_open_fetch_round_trip() {
        let resources = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let big = patterned(50_000);
        std::fs::write(resources.path().join("a.txt"), b"0123456789").unwrap();
        std::fs::write(resources.path().join("b.bin"), &big).unwrap();
        let (_addr, token, config) = start_server(resources.path()).await;

        let mut session = StreamSession::connect(Arc::clone(&config)).await.unwrap();
        let catalog = session.list().await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].name, "a.txt");
        assert_eq!(catalog[0].size_bytes, 10);
        assert_eq!(catalog[1].size_bytes, 50_000);

        session.open_channels().await.unwrap();
        let shutdown = CancellationToken::new();
        for resource in &catalog {
            session
                .fetch(resource, downloads.path(), &shutdown)
                .await
                .unwrap();
        }

        assert_eq!(
            std::fs::read(downloads.path().join("a.txt")).unwrap(),
            b"0123456789"
        );
        assert_eq!(std::fs::read(downloads.path().join("b.bin")).unwrap(), big);
        token.cancel();
    }

    #[tokio::test]
    async fn test_zero_byte_resource() {
        let resources = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        std::fs::write(resources.path().join("empty.dat"), b"").unwrap();
        let (_addr, token, config) = start_server(resources.path()).await;

        let mut session = StreamSession::connect(config).await.unwrap();
        let catalog = session.list().await.unwrap();
        session.open_channels().await.unwrap();
        let shutdown = CancellationToken::new();
        let dest = session
            .fetch(&catalog[0], downloads.path(), &shutdown)
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(dest).unwrap().len(), 0);
        token.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_sessions_do_not_cross_deliver() {
        let resources = tempfile::tempdir().unwrap();
        let first = patterned(20_000);
        let second: Vec<u8> = patterned(30_000).iter().map(|b| b ^ 0xaa).collect();
        std::fs::write(resources.path().join("first.bin"), &first).unwrap();
        std::fs::write(resources.path().join("second.bin"), &second).unwrap();
        let (_addr, token, config) = start_server(resources.path()).await;

        let shutdown = CancellationToken::new();
        let run = |target: &'static str, dir: std::path::PathBuf| {
            let config = Arc::clone(&config);
            let shutdown = shutdown.clone();
            async move {
                let mut session = StreamSession::connect(config).await.unwrap();
                let catalog = session.list().await.unwrap();
                session.open_channels().await.unwrap();
                let resource = catalog.iter().find(|r| r.name == target).unwrap();
                session.fetch(resource, &dir, &shutdown).await.unwrap();
                dir.join(target)
            }
        };

        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (path_a, path_b) = tokio::join!(
            run("first.bin", dir_a.path().to_path_buf()),
            run("second.bin", dir_b.path().to_path_buf())
        );

        assert_eq!(std::fs::read(path_a).unwrap(), first);
        assert_eq!(std::fs::read(path_b).unwrap(), second);
        token.cancel();
    }
}
