//! Offline replay of captured agent sessions.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use profiler_core::BlobReader;
use profiler_streams::PodDump;

use crate::protocol::{replay, ReplaySummary};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("failed to open capture {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("capture {path} is empty")]
    Empty { path: String },
}

/// Replays an in-memory capture into a fresh `PodDump`.
pub async fn replay_bytes(data: &[u8]) -> (PodDump, ReplaySummary) {
    let mut dump = PodDump::new();
    let summary = replay(&mut BlobReader::new(data), &mut dump).await;
    (dump, summary)
}

/// Maps a capture file and replays it.
pub async fn replay_capture(path: &Path) -> Result<(PodDump, ReplaySummary), ReplayError> {
    let open_err = |source| ReplayError::Open {
        path: path.display().to_string(),
        source,
    };
    let file = File::open(path).map_err(open_err)?;
    if file.metadata().map_err(open_err)?.len() == 0 {
        return Err(ReplayError::Empty {
            path: path.display().to_string(),
        });
    }

    // Safety: the capture is opened read-only and the mapping is dropped
    // before this function returns.
    let mmap = unsafe { Mmap::map(&file).map_err(open_err)? };

    let (dump, summary) = replay_bytes(&mmap).await;
    let pct = if mmap.is_empty() {
        0
    } else {
        100 * summary.data_bytes / mmap.len() as u64
    };
    tracing::info!(
        capture = %path.display(),
        pod = %dump.name(),
        size = mmap.len(),
        data_bytes = summary.data_bytes,
        stream_share_pct = pct,
        "capture replayed"
    );
    Ok((dump, summary))
}
