//! Per-unit log file: timestamped, line-buffered capture of the child's
//! combined stdout/stderr.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tracing::warn;

/// Cap on the log file size before it is truncated at open.
const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// Appends timestamped lines to a unit's log file.
#[derive(Debug, Clone)]
pub struct UnitLogWriter {
    path: PathBuf,
    max_bytes: u64,
}

impl UnitLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: MAX_LOG_BYTES,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the log for appending, truncating first if it outgrew the cap.
    pub async fn open(&self) -> io::Result<File> {
        let oversize = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len() > self.max_bytes,
            Err(_) => false,
        };
        let mut options = OpenOptions::new();
        options.create(true).write(true);
        if oversize {
            options.truncate(true);
        } else {
            options.append(true);
        }
        options.open(&self.path).await
    }
}

/// Copy lines from a child stream into the log, prefixing each with an
/// RFC 3339 timestamp. Runs until the stream closes (child exit).
pub(crate) async fn pump_stream<R>(id: String, writer: UnitLogWriter, stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut file = match writer.open().await {
        Ok(file) => file,
        Err(err) => {
            warn!(unit = %id, %err, "failed to open unit log file");
            return;
        }
    };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let stamped = format!(
                    "[{}] {}\n",
                    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                    line
                );
                if let Err(err) = file.write_all(stamped.as_bytes()).await {
                    warn!(unit = %id, %err, "failed to write unit log line");
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                warn!(unit = %id, %err, "error reading child output");
                return;
            }
        }
    }
}
