//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PIPEGET_LISTEN`, `PIPEGET_RESOURCE_DIR`,
//!    `PIPEGET_DOWNLOAD_DIR`
//! 2. **Config file** — path via `--config <path>`, or `pipeget.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:6969"            # stream binding control listener
//! datagram_listen = "0.0.0.0:12345"  # datagram binding base address
//! datagram_ports = 1                 # >1 = multi-port variant
//! resource_dir = "./resources"
//! control_idle_timeout_secs = 100
//! open_accept_timeout_secs = 10
//!
//! [client]
//! server_addr = "127.0.0.1:6969"
//! datagram_addr = "127.0.0.1:12345"
//! datagram_ports = 1
//! download_dir = "./files_received"
//! manifest = "input.txt"
//! rescan_interval_secs = 5
//!
//! [transfer]
//! pipe_count = 4
//! payload_size = 1024    # datagram payload bytes per packet
//! timeout_secs = 5       # datagram receive timeout
//! max_retries = 5        # per-sequence retry budget
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML. Immutable after load;
/// components receive it behind an `Arc`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server listeners and resource-root settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address of the stream-binding control listener (default `0.0.0.0:6969`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Base socket address of the datagram binding (default `0.0.0.0:12345`).
    #[serde(default = "default_datagram_listen")]
    pub datagram_listen: String,
    /// Number of consecutive datagram ports to bind (default 1; >1 enables
    /// the multi-port variant, one independent socket task per port).
    #[serde(default = "default_datagram_ports")]
    pub datagram_ports: u16,
    /// Directory scanned for transferable resources (default `./resources`).
    #[serde(default = "default_resource_dir")]
    pub resource_dir: String,
    /// Idle seconds after which a control connection is closed (default 100).
    #[serde(default = "default_control_idle_timeout")]
    pub control_idle_timeout_secs: u64,
    /// Seconds the `OPEN` data listener waits for all channel connections
    /// before failing the session (default 10).
    #[serde(default = "default_open_accept_timeout")]
    pub open_accept_timeout_secs: u64,
}

/// Client targets and destination layout.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Stream-binding server address (default `127.0.0.1:6969`).
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Datagram-binding server address (default `127.0.0.1:12345`).
    #[serde(default = "default_datagram_addr")]
    pub datagram_addr: String,
    /// Number of consecutive server ports to spread datagram sessions over
    /// (default 1; match the server's `datagram_ports`).
    #[serde(default = "default_datagram_ports")]
    pub datagram_ports: u16,
    /// Directory completed artifacts land in (default `./files_received`).
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    /// Manifest file listing target names, one per non-empty line (default `input.txt`).
    #[serde(default = "default_manifest")]
    pub manifest: String,
    /// Seconds between scheduler passes (default 5).
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u64,
}

/// Parameters shared by both bindings.
#[derive(Debug, Clone, Deserialize)]
pub struct TransferConfig {
    /// Parallel channels per file (default 4).
    #[serde(default = "default_pipe_count")]
    pub pipe_count: u32,
    /// Datagram payload bytes per packet (default 1024).
    #[serde(default = "default_payload_size")]
    pub payload_size: u32,
    /// Datagram receive timeout in seconds (default 5).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retry budget per sequence number on the datagram binding (default 5).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:6969".to_string()
}
fn default_datagram_listen() -> String {
    "0.0.0.0:12345".to_string()
}
fn default_datagram_ports() -> u16 {
    1
}
fn default_resource_dir() -> String {
    "./resources".to_string()
}
fn default_control_idle_timeout() -> u64 {
    100
}
fn default_open_accept_timeout() -> u64 {
    10
}
fn default_server_addr() -> String {
    "127.0.0.1:6969".to_string()
}
fn default_datagram_addr() -> String {
    "127.0.0.1:12345".to_string()
}
fn default_download_dir() -> String {
    "./files_received".to_string()
}
fn default_manifest() -> String {
    "input.txt".to_string()
}
fn default_rescan_interval() -> u64 {
    5
}
fn default_pipe_count() -> u32 {
    4
}
fn default_payload_size() -> u32 {
    1024
}
fn default_timeout_secs() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            datagram_listen: default_datagram_listen(),
            datagram_ports: default_datagram_ports(),
            resource_dir: default_resource_dir(),
            control_idle_timeout_secs: default_control_idle_timeout(),
            open_accept_timeout_secs: default_open_accept_timeout(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            datagram_addr: default_datagram_addr(),
            datagram_ports: default_datagram_ports(),
            download_dir: default_download_dir(),
            manifest: default_manifest(),
            rescan_interval_secs: default_rescan_interval(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pipe_count: default_pipe_count(),
            payload_size: default_payload_size(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `pipeget.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("pipeget.toml").exists() {
            let content =
                std::fs::read_to_string("pipeget.toml").expect("Failed to read pipeget.toml");
            toml::from_str(&content).expect("Failed to parse pipeget.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("PIPEGET_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("PIPEGET_RESOURCE_DIR") {
            config.server.resource_dir = dir;
        }
        if let Ok(dir) = std::env::var("PIPEGET_DOWNLOAD_DIR") {
            config.client.download_dir = dir;
        }

        config
    }
}
