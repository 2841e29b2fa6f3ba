//! Server-side dispatchers for both transport bindings.

pub mod datagram;
pub mod stream;

pub use datagram::DatagramServer;
pub use stream::StreamServer;
