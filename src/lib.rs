#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

//! pipeget library — parallel chunked file transfer over two transport bindings.
//!
//! A client retrieves named resources from a server, splitting each file into
//! independent byte ranges fetched over parallel channels:
//!
//! - **Stream binding** — one TCP control connection plus N dedicated data
//!   connections; range delivery is ordered per channel.
//! - **Datagram binding** — per-range UDP workers with explicit CRC32
//!   checksum-and-retry.
//!
//! Key building blocks:
//! - `catalog` — server-side resource enumeration
//! - `plan` — byte-range partitioning and channel assignment
//! - `proto` — wire codecs for both bindings
//! - `server` — stream and datagram dispatchers
//! - `client` — channel set, datagram workers, download scheduler
//! - `reassemble` — partial-data concatenation and integrity checks

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod hasher;
pub mod plan;
pub mod proto;
pub mod reassemble;
pub mod server;

// Re-export key types at crate root for convenience.
pub use catalog::{ResourceCatalog, ResourceDescriptor};
pub use config::Config;
pub use error::TransferError;
pub use plan::ByteRange;
