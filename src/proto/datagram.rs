//! Message codec for the datagram binding.
//!
//! Requests are pipe-delimited text; data packets carry a textual
//! `seq:crc32:` prefix followed by the raw payload bytes.
//!
//! | Direction | Message                  | Meaning                                  |
//! |-----------|--------------------------|------------------------------------------|
//! | C → S     | `CONNECT`                | Handshake probe                          |
//! | C → S     | `LIST`                   | Request resource names                   |
//! | C → S     | `SIZE\|<name>`           | Request one resource's size              |
//! | C → S     | `GET\|<name>\|<seq>`     | Request packet `<seq>`                   |
//! | C → S     | `RESEND\|<name>\|<seq>`  | Re-request packet `<seq>`                |
//! | C → S     | `CHECK\|<name>`          | Probe resource existence                 |
//! | S → C     | `WELCOME`                | Handshake accept                         |
//! | S → C     | `LIST\|a,b,c` / `LIST\|NO_FILES` | Names, comma separated           |
//! | S → C     | `SIZE\|<bytes>`          | Size reply                               |
//! | S → C     | `EXISTS` / `NOT_FOUND`   | `CHECK` reply                            |
//! | S → C     | `<seq>:<crc32>:<payload>`| Data packet                              |
//! | S → C     | `EOF`                    | Requested offset is past end of resource |
//! | S → C     | `ERROR\|<message>`       | Explicit failure, exchange continues     |
//!
//! There is no cumulative acknowledgement: each `GET` for sequence `n+1`
//! implicitly acknowledges packet `n`.

use crate::error::{Result, TransferError};

/// CRC32 of a packet payload, as carried in the packet prefix.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// A parsed client request datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramRequest {
    Connect,
    List,
    Size { name: String },
    Get { name: String, seq: u64 },
    Resend { name: String, seq: u64 },
    Check { name: String },
}

impl DatagramRequest {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DatagramRequest::Connect => "CONNECT".into(),
            DatagramRequest::List => "LIST".into(),
            DatagramRequest::Size { name } => format!("SIZE|{name}"),
            DatagramRequest::Get { name, seq } => format!("GET|{name}|{seq}"),
            DatagramRequest::Resend { name, seq } => format!("RESEND|{name}|{seq}"),
            DatagramRequest::Check { name } => format!("CHECK|{name}"),
        }
        .into_bytes()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| TransferError::Protocol("request is not valid UTF-8".into()))?
            .trim();
        let mut fields = text.split('|');
        let verb = fields.next().unwrap_or("");
        let request = match verb {
            "CONNECT" => DatagramRequest::Connect,
            "LIST" => DatagramRequest::List,
            "SIZE" => DatagramRequest::Size {
                name: required(fields.next(), "SIZE name")?,
            },
            "CHECK" => DatagramRequest::Check {
                name: required(fields.next(), "CHECK name")?,
            },
            "GET" | "RESEND" => {
                let name = required(fields.next(), "file name")?;
                let seq = required(fields.next(), "sequence number")?
                    .parse()
                    .map_err(|_| TransferError::Protocol("bad sequence number".into()))?;
                if verb == "GET" {
                    DatagramRequest::Get { name, seq }
                } else {
                    DatagramRequest::Resend { name, seq }
                }
            }
            other => {
                return Err(TransferError::Protocol(format!(
                    "unknown command {other:?}"
                )))
            }
        };
        if fields.next().is_some() {
            return Err(TransferError::Protocol(format!(
                "trailing fields in {text:?}"
            )));
        }
        Ok(request)
    }
}

fn required(field: Option<&str>, what: &str) -> Result<String> {
    match field {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(TransferError::Protocol(format!("missing {what}"))),
    }
}

/// A parsed server reply datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatagramReply {
    Welcome,
    /// Resource names; an empty vector encodes as `LIST|NO_FILES`.
    List(Vec<String>),
    Size(u64),
    Exists,
    NotFound,
    Eof,
    Error(String),
    Packet {
        seq: u64,
        checksum: u32,
        payload: Vec<u8>,
    },
}

impl DatagramReply {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            DatagramReply::Welcome => b"WELCOME".to_vec(),
            DatagramReply::List(names) => {
                if names.is_empty() {
                    b"LIST|NO_FILES".to_vec()
                } else {
                    format!("LIST|{}", names.join(",")).into_bytes()
                }
            }
            DatagramReply::Size(bytes) => format!("SIZE|{bytes}").into_bytes(),
            DatagramReply::Exists => b"EXISTS".to_vec(),
            DatagramReply::NotFound => b"NOT_FOUND".to_vec(),
            DatagramReply::Eof => b"EOF".to_vec(),
            DatagramReply::Error(message) => format!("ERROR|{message}").into_bytes(),
            DatagramReply::Packet {
                seq,
                checksum,
                payload,
            } => {
                let mut packet = format!("{seq}:{checksum}:").into_bytes();
                packet.extend_from_slice(payload);
                packet
            }
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        match data {
            b"WELCOME" => return Ok(DatagramReply::Welcome),
            b"EXISTS" => return Ok(DatagramReply::Exists),
            b"NOT_FOUND" => return Ok(DatagramReply::NotFound),
            b"EOF" => return Ok(DatagramReply::Eof),
            _ => {}
        }
        if let Some(rest) = data.strip_prefix(b"LIST|") {
            let text = std::str::from_utf8(rest)
                .map_err(|_| TransferError::Protocol("LIST reply is not valid UTF-8".into()))?;
            if text == "NO_FILES" {
                return Ok(DatagramReply::List(Vec::new()));
            }
            return Ok(DatagramReply::List(
                text.split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect(),
            ));
        }
        if let Some(rest) = data.strip_prefix(b"SIZE|") {
            let text = std::str::from_utf8(rest)
                .map_err(|_| TransferError::Protocol("SIZE reply is not valid UTF-8".into()))?;
            let bytes = text
                .trim()
                .parse()
                .map_err(|_| TransferError::Protocol(format!("bad size: {text:?}")))?;
            return Ok(DatagramReply::Size(bytes));
        }
        if let Some(rest) = data.strip_prefix(b"ERROR|") {
            return Ok(DatagramReply::Error(
                String::from_utf8_lossy(rest).into_owned(),
            ));
        }
        parse_packet(data)
    }
}

/// Parse `<seq>:<crc32>:<payload>`. The payload is raw bytes and may itself
/// contain `:` — only the first two colons delimit.
fn parse_packet(data: &[u8]) -> Result<DatagramReply> {
    let first = find_colon(data, 0)?;
    let second = find_colon(data, first + 1)?;
    let seq = parse_ascii_u64(&data[..first])?;
    let checksum = u32::try_from(parse_ascii_u64(&data[first + 1..second])?)
        .map_err(|_| TransferError::Protocol("checksum out of range".into()))?;
    Ok(DatagramReply::Packet {
        seq,
        checksum,
        payload: data[second + 1..].to_vec(),
    })
}

fn find_colon(data: &[u8], from: usize) -> Result<usize> {
    data[from..]
        .iter()
        .position(|&b| b == b':')
        .map(|i| from + i)
        .ok_or_else(|| TransferError::Protocol("malformed packet: missing delimiter".into()))
}

fn parse_ascii_u64(data: &[u8]) -> Result<u64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransferError::Protocol("malformed packet: non-numeric field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        for request in [
            DatagramRequest::Connect,
            DatagramRequest::List,
            DatagramRequest::Size {
                name: "a.txt".into(),
            },
            DatagramRequest::Get {
                name: "a.txt".into(),
                seq: 42,
            },
            DatagramRequest::Resend {
                name: "b.bin".into(),
                seq: 0,
            },
            DatagramRequest::Check {
                name: "c.dat".into(),
            },
        ] {
            let wire = request.encode();
            assert_eq!(DatagramRequest::parse(&wire).unwrap(), request);
        }
    }

    #[test]
    fn test_unknown_request_rejected() {
        assert!(DatagramRequest::parse(b"DELETE|a.txt").is_err());
        assert!(DatagramRequest::parse(b"GET|a.txt").is_err()); // missing seq
        assert!(DatagramRequest::parse(b"GET|a.txt|x").is_err());
        assert!(DatagramRequest::parse(b"GET|a.txt|1|extra").is_err());
    }

    #[test]
    fn test_reply_round_trip() {
        let payload = b"binary:with|delimiters\x00\xff".to_vec();
        for reply in [
            DatagramReply::Welcome,
            DatagramReply::List(vec!["a.txt".into(), "b.bin".into()]),
            DatagramReply::List(Vec::new()),
            DatagramReply::Size(2_000_000),
            DatagramReply::Exists,
            DatagramReply::NotFound,
            DatagramReply::Eof,
            DatagramReply::Error("File not found.".into()),
            DatagramReply::Packet {
                seq: 7,
                checksum: checksum(&payload),
                payload,
            },
        ] {
            let wire = reply.encode();
            assert_eq!(DatagramReply::parse(&wire).unwrap(), reply);
        }
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let payload = b"the quick brown fox".to_vec();
        let good = DatagramReply::Packet {
            seq: 3,
            checksum: checksum(&payload),
            payload: payload.clone(),
        };
        let mut wire = good.encode();
        let last = wire.len() - 1;
        wire[last] ^= 0x01; // flip one payload bit
        match DatagramReply::parse(&wire).unwrap() {
            DatagramReply::Packet {
                checksum: claimed,
                payload: received,
                ..
            } => {
                assert_ne!(checksum(&received), claimed);
            }
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_packet_rejected() {
        assert!(DatagramReply::parse(b"no-delimiters-here").is_err());
        assert!(DatagramReply::parse(b"12:notanumber:payload").is_err());
        assert!(DatagramReply::parse(b"x:123:payload").is_err());
    }
}
