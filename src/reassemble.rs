//! Reassembly of per-channel partial data into the final artifact.
//!
//! Stream binding: each channel's bytes land in a temp file next to the
//! destination; `assemble_parts` concatenates them in ChannelId order and
//! removes the temps. Datagram binding: each worker accumulates its range in
//! memory; `write_buffers` concatenates in worker order.
//!
//! Both paths end with the same post-condition check: the artifact's size
//! must equal the size announced by the catalog. A mismatch removes the
//! artifact and surfaces `SizeMismatch` — never a silent success.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::{Result, TransferError};
use crate::hasher;

/// Temp file that channel `id`'s bytes are written into while a stream
/// transfer is in flight.
pub fn part_path(dest: &Path, channel_id: u32) -> PathBuf {
    let mut name = dest.file_name().map_or_else(
        || std::ffi::OsString::from("download"),
        std::ffi::OsStr::to_os_string,
    );
    name.push(format!(".part{channel_id}"));
    dest.with_file_name(name)
}

/// Concatenate per-channel temp files into `dest` in ChannelId order, remove
/// the temps, and verify the expected size.
pub async fn assemble_parts(
    dest: &Path,
    channel_count: u32,
    expected_size: u64,
    name: &str,
) -> Result<()> {
    let mut out = tokio::fs::File::create(dest).await?;
    for channel_id in 0..channel_count {
        let part = part_path(dest, channel_id);
        let mut input = match tokio::fs::File::open(&part).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                drop(out);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(TransferError::MissingPart { path: part });
            }
            Err(e) => return Err(e.into()),
        };
        tokio::io::copy(&mut input, &mut out).await?;
    }
    out.flush().await?;
    drop(out);

    for channel_id in 0..channel_count {
        let _ = tokio::fs::remove_file(part_path(dest, channel_id)).await;
    }

    verify_size(dest, expected_size, name).await
}

/// Write worker buffers into `dest` in worker order and verify the expected
/// size.
pub async fn write_buffers(
    dest: &Path,
    buffers: &[Vec<u8>],
    expected_size: u64,
    name: &str,
) -> Result<()> {
    let mut out = tokio::fs::File::create(dest).await?;
    for buffer in buffers {
        out.write_all(buffer).await?;
    }
    out.flush().await?;
    drop(out);

    verify_size(dest, expected_size, name).await
}

async fn verify_size(dest: &Path, expected_size: u64, name: &str) -> Result<()> {
    let actual = tokio::fs::metadata(dest).await?.len();
    if actual != expected_size {
        warn!(
            file = %name,
            expected = expected_size,
            actual,
            "Reassembled artifact has wrong size, removing"
        );
        let _ = tokio::fs::remove_file(dest).await;
        return Err(TransferError::SizeMismatch {
            file: name.to_string(),
            expected: expected_size,
            actual,
        });
    }

    match hasher::hash_file(dest).await {
        Ok(digest) => info!(file = %name, size = actual, sha256 = %digest, "Transfer complete"),
        Err(e) => info!(file = %name, size = actual, "Transfer complete (digest unavailable: {e})"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan;

    #[tokio::test]
    async fn test_round_trip_ten_bytes_four_channels() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("ten.bin");
        let original: Vec<u8> = (0u8..10).collect();

        // Split per the plan and write each range to its channel part.
        let plan = plan(10, 4).unwrap();
        for range in &plan.ranges {
            let id = plan.channel_for(range, 4);
            let slice = &original[range.start as usize..=range.end as usize];
            std::fs::write(part_path(&dest, id), slice).unwrap();
        }

        assemble_parts(&dest, 4, 10, "ten.bin").await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), original);
        for id in 0..4 {
            assert!(!part_path(&dest, id).exists(), "temp part {id} left behind");
        }
    }

    #[tokio::test]
    async fn test_size_mismatch_removes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("short.bin");
        std::fs::write(part_path(&dest, 0), b"only").unwrap();

        let err = assemble_parts(&dest, 1, 100, "short.bin").await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::SizeMismatch {
                expected: 100,
                actual: 4,
                ..
            }
        ));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_missing_part_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gap.bin");
        std::fs::write(part_path(&dest, 0), b"abc").unwrap();
        // part 1 never written

        let err = assemble_parts(&dest, 2, 6, "gap.bin").await.unwrap_err();
        assert!(matches!(err, TransferError::MissingPart { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_write_buffers_in_worker_order() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("udp.bin");
        let buffers = vec![b"aaa".to_vec(), b"bb".to_vec(), b"c".to_vec()];

        write_buffers(&dest, &buffers, 6, "udp.bin").await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"aaabbc");
    }

    #[tokio::test]
    async fn test_empty_file_assembles() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("empty.bin");
        write_buffers(&dest, &[], 0, "empty.bin").await.unwrap();
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    }
}
