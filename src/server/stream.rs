//! Stream-binding server: control sessions and parallel data channels.
//!
//! ## Session lifecycle
//!
//! 1. The accept loop hands each control connection to its own session task.
//! 2. `LIST` answers with a catalog frame; `OPEN` binds an ephemeral data
//!    listener, replies with its port, and accepts exactly `pipe_count`
//!    connections (accept index = ChannelId) within a bounded window.
//! 3. Each accepted data connection is owned by a dedicated writer task fed
//!    over an mpsc queue, so `GET`s are validated on the control loop but
//!    served concurrently across channels. Bytes on one data connection stay
//!    strictly sequential.
//! 4. A control connection idle past the configured timeout is closed.
//!
//! Error policy: a malformed command frame gets an `ERR|…` reply (the control
//! exchange is lock-step, so the reply is read in place of the expected one)
//! and the session continues. An unserviceable `GET` is logged and dropped —
//! its response would travel on a data channel, so the client's bounded data
//! read surfaces the failure. A failed `OPEN` closes the session. A broken
//! session never takes down the accept loop.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::ResourceCatalog;
use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::proto::stream::{
    encode_catalog, encode_chunk_header, encode_error_reply, encode_port_reply, parse_command,
    read_frame, ChunkRequest, ControlCommand,
};
use crate::proto::CONTROL_FRAME_SIZE;

/// One queued range for a channel writer task.
struct ChunkJob {
    path: PathBuf,
    request: ChunkRequest,
}

/// Stream-binding server dispatcher.
pub struct StreamServer {
    config: Arc<Config>,
    catalog: ResourceCatalog,
}

impl StreamServer {
    pub fn new(config: Arc<Config>) -> Self {
        let catalog = ResourceCatalog::new(config.server.resource_dir.clone());
        Self { config, catalog }
    }

    /// Accept control connections until `shutdown` fires. The listener is
    /// bound by the caller so tests can use an ephemeral port.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "Stream server listening");

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, addr)) => {
                    let session = Session {
                        session_id: uuid::Uuid::new_v4().to_string(),
                        config: Arc::clone(&self.config),
                        catalog: self.catalog.clone(),
                        addr,
                    };
                    let token = shutdown.clone();
                    tokio::spawn(async move {
                        info!(session = %session.session_id, peer = %session.addr, "Client connected");
                        if let Err(e) = session.run(socket, token).await {
                            warn!(peer = %session.addr, "Session ended with error: {e}");
                        }
                    });
                }
                Err(e) => {
                    // Transient accept failures (EMFILE etc.) must not kill the loop.
                    error!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!("Stream server shutting down");
        Ok(())
    }
}

struct Session {
    session_id: String,
    config: Arc<Config>,
    catalog: ResourceCatalog,
    addr: SocketAddr,
}

impl Session {
    async fn run(&self, socket: TcpStream, shutdown: CancellationToken) -> Result<()> {
        let local_ip = socket.local_addr()?.ip();
        let (mut reader, mut writer) = socket.into_split();
        let idle = Duration::from_secs(self.config.server.control_idle_timeout_secs);
        let mut channels: Option<Vec<mpsc::Sender<ChunkJob>>> = None;

        loop {
            let frame = tokio::select! {
                () = shutdown.cancelled() => break,
                frame = timeout(idle, read_frame(&mut reader, CONTROL_FRAME_SIZE)) => frame,
            };
            let frame = match frame {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    debug!(session = %self.session_id, "Client disconnected");
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    info!(session = %self.session_id, "Control connection idle, closing");
                    break;
                }
            };

            match parse_command(&frame) {
                Ok(ControlCommand::List) => self.send_catalog(&mut writer).await?,
                Ok(ControlCommand::Open) => {
                    // A half-established channel set cannot be repaired over
                    // this control connection; fail the session instead.
                    channels = Some(self.open_channels(&mut writer, local_ip).await?);
                }
                Ok(ControlCommand::Get(request)) => {
                    if let Err(e) = self.dispatch_get(channels.as_deref(), &request).await {
                        warn!(
                            session = %self.session_id,
                            file = %request.name,
                            range = %request.range,
                            "GET refused: {e}"
                        );
                    }
                }
                Err(e) => {
                    warn!(session = %self.session_id, "Bad control frame: {e}");
                    writer.write_all(&encode_error_reply(&e.to_string())?).await?;
                }
            }
        }
        Ok(())
    }

    async fn send_catalog(&self, writer: &mut OwnedWriteHalf) -> Result<()> {
        let resources = self.catalog.scan().await;
        let (frame, encoded) = encode_catalog(&resources);
        if encoded < resources.len() {
            warn!(
                total = resources.len(),
                encoded, "Catalog exceeds frame, trailing entries dropped"
            );
        }
        writer.write_all(&frame).await?;
        debug!(session = %self.session_id, entries = encoded, "Catalog sent");
        Ok(())
    }

    /// Bind an ephemeral data listener, tell the client its port, then accept
    /// exactly `pipe_count` connections. Bounded: if the client opens fewer
    /// connections within the window, the `OPEN` fails instead of blocking
    /// forever.
    async fn open_channels(
        &self,
        writer: &mut OwnedWriteHalf,
        bind_ip: IpAddr,
    ) -> Result<Vec<mpsc::Sender<ChunkJob>>> {
        let data_listener = TcpListener::bind((bind_ip, 0)).await?;
        let port = data_listener.local_addr()?.port();

        writer.write_all(&encode_port_reply(port)?).await?;
        info!(session = %self.session_id, port, "Data listener open");

        let pipe_count = self.config.transfer.pipe_count;
        let window = Duration::from_secs(self.config.server.open_accept_timeout_secs);
        let mut senders = Vec::with_capacity(pipe_count as usize);

        let accept_all = async {
            for channel_id in 0..pipe_count {
                let (data_socket, peer) = data_listener.accept().await?;
                debug!(session = %self.session_id, channel_id, peer = %peer, "Data channel accepted");
                let (tx, rx) = mpsc::channel::<ChunkJob>(32);
                senders.push(tx);
                let session_id = self.session_id.clone();
                tokio::spawn(channel_writer(session_id, channel_id, data_socket, rx));
            }
            Ok::<_, std::io::Error>(())
        };

        match timeout(window, accept_all).await {
            Ok(Ok(())) => Ok(senders),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransferError::Timeout {
                what: format!("{pipe_count} data-channel connections"),
            }),
        }
    }

    /// Validate a `GET` and queue it on the channel the assignment formula
    /// selects. Serving happens on the channel's writer task.
    async fn dispatch_get(
        &self,
        channels: Option<&[mpsc::Sender<ChunkJob>]>,
        request: &ChunkRequest,
    ) -> Result<()> {
        let Some(channels) = channels else {
            return Err(TransferError::Protocol(
                "GET before OPEN: no data channels".into(),
            ));
        };
        let path = self
            .catalog
            .resolve(&request.name)
            .ok_or_else(|| TransferError::Protocol(format!("bad resource name {:?}", request.name)))?;
        let actual_size = self
            .catalog
            .size_of(&request.name)
            .await
            .ok_or_else(|| TransferError::Server(format!("{}: file not found", request.name)))?;
        if actual_size != request.file_size {
            return Err(TransferError::SizeMismatch {
                file: request.name.clone(),
                expected: request.file_size,
                actual: actual_size,
            });
        }

        // Same pure function of (range, pipe count) the client used.
        let pipe_count = channels.len() as u64;
        let range_len = request.file_size.div_ceil(pipe_count).max(1);
        let channel_id = ((request.range.start / range_len) % pipe_count) as usize;

        channels[channel_id]
            .send(ChunkJob {
                path,
                request: request.clone(),
            })
            .await
            .map_err(|_| TransferError::Protocol(format!("channel {channel_id} writer gone")))?;
        Ok(())
    }
}

/// Owns one data connection; serves queued ranges in arrival order. Streams
/// file bytes in 64 KiB blocks — never a whole range in memory.
async fn channel_writer(
    session_id: String,
    channel_id: u32,
    socket: TcpStream,
    mut jobs: mpsc::Receiver<ChunkJob>,
) {
    let mut writer = BufWriter::new(socket);
    while let Some(job) = jobs.recv().await {
        if let Err(e) = send_chunk(&mut writer, &job).await {
            warn!(
                session = %session_id,
                channel_id,
                file = %job.request.name,
                range = %job.request.range,
                "Data channel write failed: {e}"
            );
            break;
        }
        debug!(
            session = %session_id,
            channel_id,
            file = %job.request.name,
            range = %job.request.range,
            "Chunk sent"
        );
    }
}

async fn send_chunk(writer: &mut BufWriter<TcpStream>, job: &ChunkJob) -> Result<()> {
    let len = job.request.range.len();
    let mut file = tokio::fs::File::open(&job.path).await?;
    file.seek(std::io::SeekFrom::Start(job.request.range.start))
        .await?;

    writer.write_all(&encode_chunk_header(&job.request)).await?;
    let mut limited = file.take(len);
    let copied = tokio::io::copy(&mut limited, writer).await?;
    if copied != len {
        return Err(TransferError::SizeMismatch {
            file: job.request.name.clone(),
            expected: len,
            actual: copied,
        });
    }
    writer.flush().await?;
    Ok(())
}
