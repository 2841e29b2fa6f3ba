//! Client-side transfer machinery: channel set, datagram workers, and the
//! download scheduler that drives them.

pub mod datagram;
pub mod scheduler;
pub mod stream;

pub use datagram::DatagramClient;
pub use scheduler::DownloadScheduler;
pub use stream::StreamSession;

/// Which transport binding a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    /// Control connection plus N dedicated data connections.
    Stream,
    /// Per-range worker sockets with checksum-and-retry.
    Datagram,
}
