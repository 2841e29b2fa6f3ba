//! Control-frame codec for the stream binding.
//!
//! ## Frame shapes
//!
//! Every control-channel message is a fixed-width, space-padded frame
//! ([`CONTROL_FRAME_SIZE`] bytes; the catalog reply uses
//! [`CATALOG_FRAME_SIZE`]). Inside a frame, the command line is terminated by
//! `\r\n` and an optional payload follows.
//!
//! | Direction | Frame                         | Meaning                               |
//! |-----------|-------------------------------|---------------------------------------|
//! | C → S     | `LIST\r\n`                    | Request the catalog                   |
//! | C → S     | `OPEN\r\n`                    | Request a data-channel endpoint       |
//! | C → S     | `GET\r\n<name>\|<size>\|<start>\|<end>` | Request one byte range      |
//! | S → C     | `PORT\|<port>`                | `OPEN` reply: ephemeral listener port |
//! | S → C     | `ERR\|<message>`              | Explicit protocol error, session continues |
//! | S → C     | `<name>\|<size>\n…` (catalog frame) | `LIST` reply, one record per line |
//!
//! A chunk response on a data connection is not fixed width: it is the echoed
//! request line, `\r\n`, then exactly `end - start + 1` raw payload bytes.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{CATALOG_FRAME_SIZE, CONTROL_FRAME_SIZE};
use crate::catalog::ResourceDescriptor;
use crate::error::{Result, TransferError};
use crate::plan::ByteRange;

/// A parsed control-channel command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    List,
    Open,
    Get(ChunkRequest),
}

/// The `GET` payload: which range of which file, plus the total size the
/// client planned against (echoed back in the chunk response header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub name: String,
    pub file_size: u64,
    pub range: ByteRange,
}

impl ChunkRequest {
    /// `name|size|start|end`
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.name, self.file_size, self.range.start, self.range.end
        )
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() != 4 {
            return Err(TransferError::Protocol(format!(
                "chunk request needs 4 fields, got {}: {s:?}",
                parts.len()
            )));
        }
        let file_size = parse_u64(parts[1], "file size")?;
        let start = parse_u64(parts[2], "range start")?;
        let end = parse_u64(parts[3], "range end")?;
        if end < start || end >= file_size.max(1) {
            return Err(TransferError::Protocol(format!(
                "invalid range {start}-{end} for size {file_size}"
            )));
        }
        Ok(Self {
            name: parts[0].to_string(),
            file_size,
            range: ByteRange { start, end },
        })
    }
}

fn parse_u64(s: &str, what: &str) -> Result<u64> {
    s.parse()
        .map_err(|_| TransferError::Protocol(format!("bad {what}: {s:?}")))
}

/// Pad `content` with spaces to exactly `width` bytes.
fn pad_frame(content: &str, width: usize) -> Result<Vec<u8>> {
    if content.len() > width {
        return Err(TransferError::Protocol(format!(
            "frame payload of {} bytes exceeds frame width {width}",
            content.len()
        )));
    }
    let mut frame = content.as_bytes().to_vec();
    frame.resize(width, b' ');
    Ok(frame)
}

/// Decode a padded frame back to its trimmed textual content.
fn unpad_frame(frame: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| TransferError::Protocol("frame is not valid UTF-8".into()))?;
    Ok(text.trim_end_matches([' ', '\0']))
}

pub fn encode_command(command: &ControlCommand) -> Result<Vec<u8>> {
    let content = match command {
        ControlCommand::List => "LIST\r\n".to_string(),
        ControlCommand::Open => "OPEN\r\n".to_string(),
        ControlCommand::Get(req) => format!("GET\r\n{}", req.encode()),
    };
    pad_frame(&content, CONTROL_FRAME_SIZE)
}

pub fn parse_command(frame: &[u8]) -> Result<ControlCommand> {
    let content = unpad_frame(frame)?;
    let (verb, payload) = match content.split_once("\r\n") {
        Some((verb, payload)) => (verb, payload),
        None => (content, ""),
    };
    match verb {
        "LIST" => Ok(ControlCommand::List),
        "OPEN" => Ok(ControlCommand::Open),
        "GET" => Ok(ControlCommand::Get(ChunkRequest::parse(payload)?)),
        other => Err(TransferError::Protocol(format!(
            "unknown command {other:?}"
        ))),
    }
}

/// `OPEN` reply carrying the ephemeral data-listener port.
pub fn encode_port_reply(port: u16) -> Result<Vec<u8>> {
    pad_frame(&format!("PORT|{port}"), CONTROL_FRAME_SIZE)
}

/// Explicit error reply; the session continues afterwards.
pub fn encode_error_reply(message: &str) -> Result<Vec<u8>> {
    // The message must fit the fixed frame; cut on a char boundary.
    let mut msg = message.replace(['\r', '\n'], " ");
    let mut cut = (CONTROL_FRAME_SIZE - 8).min(msg.len());
    while !msg.is_char_boundary(cut) {
        cut -= 1;
    }
    msg.truncate(cut);
    pad_frame(&format!("ERR|{msg}"), CONTROL_FRAME_SIZE)
}

/// Parse an `OPEN` reply: either `PORT|<port>` or `ERR|<message>`.
pub fn parse_port_reply(frame: &[u8]) -> Result<u16> {
    let content = unpad_frame(frame)?;
    if let Some(msg) = content.strip_prefix("ERR|") {
        return Err(TransferError::Server(msg.to_string()));
    }
    let port = content
        .strip_prefix("PORT|")
        .ok_or_else(|| TransferError::Protocol(format!("expected PORT reply, got {content:?}")))?;
    port.parse()
        .map_err(|_| TransferError::Protocol(format!("bad port: {port:?}")))
}

/// Encode the catalog into its fixed-width frame, one `name|size` record per
/// line. Records that no longer fit are dropped; the number encoded is
/// returned so the caller can log the truncation.
pub fn encode_catalog(resources: &[ResourceDescriptor]) -> (Vec<u8>, usize) {
    let mut content = String::new();
    let mut encoded = 0;
    for resource in resources {
        let record = format!("{}|{}\n", resource.name, resource.size_bytes);
        if content.len() + record.len() > CATALOG_FRAME_SIZE {
            break;
        }
        content.push_str(&record);
        encoded += 1;
    }
    let mut frame = content.into_bytes();
    frame.resize(CATALOG_FRAME_SIZE, b' ');
    (frame, encoded)
}

/// Parse a catalog frame back into `(name, size)` descriptors.
pub fn parse_catalog(frame: &[u8]) -> Result<Vec<ResourceDescriptor>> {
    let content = unpad_frame(frame)?;
    let mut resources = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, size) = line.split_once('|').ok_or_else(|| {
            TransferError::Protocol(format!("bad catalog record: {line:?}"))
        })?;
        resources.push(ResourceDescriptor {
            name: name.to_string(),
            size_bytes: parse_u64(size, "catalog size")?,
        });
    }
    Ok(resources)
}

/// Header line preceding a chunk payload on a data connection.
pub fn encode_chunk_header(request: &ChunkRequest) -> Vec<u8> {
    format!("{}\r\n", request.encode()).into_bytes()
}

pub fn parse_chunk_header(line: &str) -> Result<ChunkRequest> {
    ChunkRequest::parse(line.trim_end_matches(['\r', '\n']))
}

/// Read one fixed-width frame. `Ok(None)` means the peer closed cleanly
/// before sending anything.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    width: usize,
) -> std::io::Result<Option<Vec<u8>>> {
    let mut frame = vec![0u8; width];
    let mut filled = 0;
    while filled < width {
        let n = reader.read(&mut frame[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("peer closed mid-frame ({filled}/{width} bytes)"),
            ));
        }
        filled += n;
    }
    Ok(Some(frame))
}
