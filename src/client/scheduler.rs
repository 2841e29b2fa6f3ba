//! Download scheduler: the client's outer loop.
//!
//! Each pass re-reads the manifest, filters entries already satisfied on
//! disk, fetches the rest, and then waits out the rescan interval. A target
//! counts as satisfied only when a same-named file of the expected size
//! exists in the download directory — a name match alone is not enough, and
//! a wrong-sized leftover is re-fetched in full.
//!
//! The loop never terminates on its own; every wait is interruptible by the
//! shared cancellation token, so shutdown needs no thread killing.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{DatagramClient, StreamSession, Transport};
use crate::config::Config;
use crate::error::{Result, TransferError};

/// Outcome counts for one scheduling pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Targets already present with the expected size.
    pub satisfied: usize,
    /// Targets fetched this pass.
    pub fetched: usize,
    /// Targets whose fetch failed (retried next pass).
    pub failed: usize,
    /// Targets the server does not currently offer.
    pub missing: usize,
}

/// Drives repeated transfer passes until cancelled.
pub struct DownloadScheduler {
    config: Arc<Config>,
    transport: Transport,
}

impl DownloadScheduler {
    pub fn new(config: Arc<Config>, transport: Transport) -> Self {
        Self { config, transport }
    }

    /// Run passes until `shutdown` fires. Pass-level failures (unreachable
    /// server, vanished manifest) are reported and retried next pass.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let interval = Duration::from_secs(self.config.client.rescan_interval_secs);
        loop {
            match self.run_pass(&shutdown).await {
                Ok(report) => {
                    info!(
                        satisfied = report.satisfied,
                        fetched = report.fetched,
                        failed = report.failed,
                        missing = report.missing,
                        "Pass complete"
                    );
                }
                Err(TransferError::Canceled) => break,
                Err(e) if e.is_recoverable() => warn!("Pass failed: {e}"),
                Err(e) => error!("Pass failed: {e}"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }

    /// One pass: manifest → filter → fetch remaining → report.
    pub async fn run_pass(&self, shutdown: &CancellationToken) -> Result<PassReport> {
        let targets = read_manifest(Path::new(&self.config.client.manifest)).await;
        if targets.is_empty() {
            debug!(manifest = %self.config.client.manifest, "No targets");
            return Ok(PassReport::default());
        }

        match self.transport {
            Transport::Stream => self.stream_pass(&targets, shutdown).await,
            Transport::Datagram => self.datagram_pass(&targets, shutdown).await,
        }
    }

    async fn stream_pass(
        &self,
        targets: &[String],
        shutdown: &CancellationToken,
    ) -> Result<PassReport> {
        let download_dir = Path::new(&self.config.client.download_dir);
        let mut session = StreamSession::connect(Arc::clone(&self.config)).await?;
        let catalog = session.list().await?;
        let mut channels_open = false;
        let mut report = PassReport::default();

        for target in targets {
            if shutdown.is_cancelled() {
                return Err(TransferError::Canceled);
            }
            let Some(resource) = catalog.iter().find(|r| &r.name == target) else {
                warn!(file = %target, "Not offered by server");
                report.missing += 1;
                continue;
            };
            if is_satisfied(&download_dir.join(target), resource.size_bytes).await {
                debug!(file = %target, "Already downloaded, skipping");
                report.satisfied += 1;
                continue;
            }
            if !channels_open {
                session.open_channels().await?;
                channels_open = true;
            }
            match session.fetch(resource, download_dir, shutdown).await {
                Ok(_) => report.fetched += 1,
                Err(TransferError::Canceled) => return Err(TransferError::Canceled),
                Err(e) => {
                    warn!(file = %target, "Fetch failed: {e}");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    async fn datagram_pass(
        &self,
        targets: &[String],
        shutdown: &CancellationToken,
    ) -> Result<PassReport> {
        let download_dir = Path::new(&self.config.client.download_dir);
        let base: SocketAddr = self
            .config
            .client
            .datagram_addr
            .parse()
            .map_err(|e| TransferError::Protocol(format!("bad server address: {e}")))?;
        let port_count = self.config.client.datagram_ports.max(1);

        // One lazily-connected client per server port; files rotate across
        // ports so the multi-port server variant shares the load.
        let mut clients: Vec<Option<DatagramClient>> = (0..port_count).map(|_| None).collect();
        let mut report = PassReport::default();

        for (index, target) in targets.iter().enumerate() {
            if shutdown.is_cancelled() {
                return Err(TransferError::Canceled);
            }
            let slot = index % port_count as usize;
            let client = match clients[slot].take() {
                Some(client) => client,
                None => {
                    let addr = SocketAddr::new(base.ip(), base.port() + slot as u16);
                    DatagramClient::connect(Arc::clone(&self.config), &addr.to_string()).await?
                }
            };
            let outcome = datagram_target(&client, target, download_dir, shutdown).await;
            clients[slot] = Some(client);
            match outcome? {
                TargetOutcome::Satisfied => report.satisfied += 1,
                TargetOutcome::Fetched => report.fetched += 1,
                TargetOutcome::Failed => report.failed += 1,
                TargetOutcome::Missing => report.missing += 1,
            }
        }
        Ok(report)
    }
}

enum TargetOutcome {
    Satisfied,
    Fetched,
    Failed,
    Missing,
}

async fn datagram_target(
    client: &DatagramClient,
    target: &str,
    download_dir: &Path,
    shutdown: &CancellationToken,
) -> Result<TargetOutcome> {
    let size = match client.size(target).await {
        Ok(size) => size,
        Err(TransferError::Server(message)) => {
            warn!(file = %target, "Not offered by server: {message}");
            return Ok(TargetOutcome::Missing);
        }
        Err(e) => return Err(e),
    };
    if is_satisfied(&download_dir.join(target), size).await {
        debug!(file = %target, "Already downloaded, skipping");
        return Ok(TargetOutcome::Satisfied);
    }
    match client.fetch(target, download_dir, shutdown).await {
        Ok(_) => Ok(TargetOutcome::Fetched),
        Err(TransferError::Canceled) => Err(TransferError::Canceled),
        Err(e) => {
            warn!(file = %target, "Fetch failed: {e}");
            Ok(TargetOutcome::Failed)
        }
    }
}

/// Read the manifest: one target name per non-empty line, duplicates
/// removed, order preserved. A missing manifest is an empty target set.
pub async fn read_manifest(path: &Path) -> Vec<String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) => {
            warn!(manifest = %path.display(), "Manifest unreadable: {e}");
            return Vec::new();
        }
    };
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect()
}

/// Satisfied = same-named plain file of exactly the expected size.
async fn is_satisfied(dest: &Path, expected_size: u64) -> bool {
    match tokio::fs::metadata(dest).await {
        Ok(metadata) => metadata.is_file() && metadata.len() == expected_size,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClientConfig, ServerConfig, TransferConfig};
    use crate::server::{DatagramServer, StreamServer};
    use tokio::net::{TcpListener, UdpSocket};

    #[tokio::test]
    async fn test_read_manifest_trims_and_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "a.txt\n\n  b.bin  \na.txt\n\t\nc.dat\n").unwrap();
        assert_eq!(read_manifest(&path).await, vec!["a.txt", "b.bin", "c.dat"]);
    }

    #[tokio::test]
    async fn test_read_manifest_missing_is_empty() {
        assert!(read_manifest(Path::new("/nonexistent/input.txt")).await.is_empty());
    }

    #[tokio::test]
    async fn test_is_satisfied_requires_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"12345").unwrap();
        assert!(is_satisfied(&path, 5).await);
        assert!(!is_satisfied(&path, 6).await);
        assert!(!is_satisfied(&dir.path().join("missing"), 5).await);
    }

    fn scheduler_config(
        resources: &Path,
        downloads: &Path,
        manifest: &Path,
        server_addr: String,
        datagram_addr: String,
    ) -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                resource_dir: resources.to_string_lossy().into_owned(),
                ..Default::default()
            },
            client: ClientConfig {
                server_addr,
                datagram_addr,
                download_dir: downloads.to_string_lossy().into_owned(),
                manifest: manifest.to_string_lossy().into_owned(),
                ..Default::default()
            },
            transfer: TransferConfig {
                payload_size: 64,
                timeout_secs: 2,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_stream_pass_skips_satisfied_and_fetches_rest() {
        let resources = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        std::fs::write(resources.path().join("a.txt"), b"AAAAAAAAAA").unwrap();
        std::fs::write(resources.path().join("b.txt"), b"BBBBBBBB").unwrap();
        let manifest = downloads.path().join("input.txt");
        std::fs::write(&manifest, "a.txt\nb.txt\nghost.txt\n").unwrap();

        // a.txt already present with the right size but different bytes: the
        // pass must leave it untouched (no range requests for it).
        std::fs::write(downloads.path().join("a.txt"), b"XXXXXXXXXX").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = scheduler_config(
            resources.path(),
            downloads.path(),
            &manifest,
            addr.to_string(),
            "127.0.0.1:1".to_string(),
        );
        let server = StreamServer::new(Arc::clone(&config));
        let token = CancellationToken::new();
        let server_token = token.clone();
        tokio::spawn(async move { server.serve(listener, server_token).await });

        let scheduler = DownloadScheduler::new(Arc::clone(&config), Transport::Stream);
        let report = scheduler.run_pass(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            report,
            PassReport {
                satisfied: 1,
                fetched: 1,
                failed: 0,
                missing: 1
            }
        );
        // Untouched: still the pre-seeded bytes, not the server's.
        assert_eq!(
            std::fs::read(downloads.path().join("a.txt")).unwrap(),
            b"XXXXXXXXXX"
        );
        assert_eq!(
            std::fs::read(downloads.path().join("b.txt")).unwrap(),
            b"BBBBBBBB"
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_datagram_pass_round_trip() {
        let resources = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(resources.path().join("d.bin"), &payload).unwrap();
        let manifest = downloads.path().join("input.txt");
        std::fs::write(&manifest, "d.bin\n").unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let config = scheduler_config(
            resources.path(),
            downloads.path(),
            &manifest,
            "127.0.0.1:1".to_string(),
            addr.to_string(),
        );
        let server = DatagramServer::new(Arc::clone(&config));
        let token = CancellationToken::new();
        let server_token = token.clone();
        tokio::spawn(async move { server.serve(socket, server_token).await });

        let scheduler = DownloadScheduler::new(Arc::clone(&config), Transport::Datagram);
        let report = scheduler.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.fetched, 1);
        assert_eq!(std::fs::read(downloads.path().join("d.bin")).unwrap(), payload);

        // Second pass: now satisfied, nothing fetched.
        let report = scheduler.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.satisfied, 1);
        assert_eq!(report.fetched, 0);
        token.cancel();
    }
}
