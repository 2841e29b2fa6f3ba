//! Wire codecs for both transport bindings.
//!
//! Everything the peer sends is parsed by a dedicated decoder into plain
//! structs — received text is never evaluated or interpreted beyond these
//! grammars. Field delimiters are `|` for both bindings; resource names
//! containing delimiter bytes are excluded at catalog-scan time.
//!
//! - [`stream`] — fixed-width control frames and chunk response framing for
//!   the reliable binding.
//! - [`datagram`] — pipe-delimited request/reply messages and
//!   `seq:crc32:payload` packets for the unreliable binding.

pub mod datagram;
pub mod stream;

/// Fixed width of a control-channel command frame, space padded.
pub const CONTROL_FRAME_SIZE: usize = 256;

/// Fixed width of the catalog reply frame, space padded.
pub const CATALOG_FRAME_SIZE: usize = 4096;

/// Generous bound on the `seq:checksum:` packet prefix; receive buffers are
/// sized `payload_size + DATAGRAM_HEADER_MAX`.
pub const DATAGRAM_HEADER_MAX: usize = 32;
