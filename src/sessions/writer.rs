//! Append-only file handle owned by one session.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Result of pushing a batch of chunks to disk.
///
/// `chunks` hands the batch back to the caller. On failure the first
/// `written` chunks are on disk in full and the next one is on disk up to
/// byte `partial`; [`unwritten`](Self::unwritten) yields exactly the rest.
#[derive(Debug)]
pub struct WriteOutcome {
    pub chunks: Vec<Vec<u8>>,
    pub written: usize,
    pub partial: usize,
    pub bytes: u64,
    pub error: Option<io::Error>,
}

impl WriteOutcome {
    pub fn unwritten(self) -> Vec<Vec<u8>> {
        let mut rest: Vec<Vec<u8>> = self.chunks.into_iter().skip(self.written).collect();
        if let Some(first) = rest.first_mut() {
            first.drain(..self.partial.min(first.len()));
        }
        rest
    }

    /// Number of chunks not (fully) on disk.
    pub fn unwritten_count(&self) -> usize {
        self.chunks.len().saturating_sub(self.written)
    }
}

/// Exclusive append handle for a session log file.
///
/// Every write for a session goes through one `SessionWriter` behind an
/// async mutex, which is what keeps chunks in arrival order across the
/// periodic, out-of-cycle and final flushes.
#[derive(Debug)]
pub struct SessionWriter {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
}

impl SessionWriter {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_file(path.to_path_buf(), file))
    }

    pub(crate) fn from_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file: Some(file),
            bytes_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Write `chunks` in order on the blocking pool.
    ///
    /// Stops at the first failing write. The handle is lent to the blocking
    /// task and put back afterwards; if that task panics the handle is lost
    /// and the writer reports itself closed.
    pub async fn write_chunks(&mut self, chunks: Vec<Vec<u8>>) -> WriteOutcome {
        let Some(file) = self.file.take() else {
            return WriteOutcome {
                chunks,
                written: 0,
                partial: 0,
                bytes: 0,
                error: Some(closed_error()),
            };
        };

        let task = tokio::task::spawn_blocking(move || {
            let mut file = file;
            let progress = write_batch(&mut file, &chunks);
            (file, chunks, progress)
        });

        match task.await {
            Ok((file, chunks, progress)) => {
                self.file = Some(file);
                self.bytes_written += progress.bytes;
                WriteOutcome {
                    chunks,
                    written: progress.written,
                    partial: progress.partial,
                    bytes: progress.bytes,
                    error: progress.error,
                }
            }
            Err(join_error) => {
                tracing::error!(
                    path = %self.path.display(),
                    "session writer task failed: {join_error}"
                );
                WriteOutcome {
                    chunks: Vec::new(),
                    written: 0,
                    partial: 0,
                    bytes: 0,
                    error: Some(io::Error::other(join_error.to_string())),
                }
            }
        }
    }

    /// Stamp the file's modification time with `completed_at`, then release
    /// the handle. The retention window of a completed log starts at that
    /// stamp, not at its last write. Closing twice is a no-op.
    pub fn close(&mut self, completed_at: SystemTime) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        file.set_modified(completed_at)
    }
}

struct BatchProgress {
    written: usize,
    partial: usize,
    bytes: u64,
    error: Option<io::Error>,
}

/// Write each chunk with plain `write` calls so that a failure part-way
/// through a chunk still reports how many of its bytes reached the file.
fn write_batch<W: Write>(out: &mut W, chunks: &[Vec<u8>]) -> BatchProgress {
    let mut bytes = 0u64;
    for (index, chunk) in chunks.iter().enumerate() {
        let mut offset = 0;
        while offset < chunk.len() {
            match out.write(&chunk[offset..]) {
                Ok(0) => {
                    return BatchProgress {
                        written: index,
                        partial: offset,
                        bytes,
                        error: Some(io::ErrorKind::WriteZero.into()),
                    };
                }
                Ok(n) => {
                    offset += n;
                    bytes += n as u64;
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    return BatchProgress {
                        written: index,
                        partial: offset,
                        bytes,
                        error: Some(error),
                    };
                }
            }
        }
    }

    BatchProgress {
        written: chunks.len(),
        partial: 0,
        bytes,
        error: out.flush().err(),
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session log handle already closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn chunks(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    /// Accepts `budget` bytes, at most `max_per_call` per call, then fails.
    struct FailingSink {
        accepted: Vec<u8>,
        budget: usize,
        max_per_call: usize,
    }

    impl Write for FailingSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = buf.len().min(self.budget).min(self.max_per_call);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_chunks_in_order_and_appends_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.log");

        let mut writer = SessionWriter::open(&path).unwrap();
        let outcome = writer.write_chunks(chunks(&["a", "bc", "\n"])).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.written, 3);
        assert_eq!(outcome.bytes, 4);
        writer.close(SystemTime::now()).unwrap();

        let mut reopened = SessionWriter::open(&path).unwrap();
        reopened.write_chunks(chunks(&["d"])).await;
        reopened.close(SystemTime::now()).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abc\nd");
    }

    #[tokio::test]
    async fn closed_writer_returns_batch_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SessionWriter::open(&dir.path().join("s.log")).unwrap();
        writer.close(SystemTime::now()).unwrap();
        assert!(writer.is_closed());
        writer.close(SystemTime::now()).unwrap();

        let outcome = writer.write_chunks(chunks(&["x", "y"])).await;
        assert!(outcome.error.is_some());
        assert_eq!(outcome.unwritten_count(), 2);
        assert_eq!(outcome.unwritten(), chunks(&["x", "y"]));
    }

    #[test]
    fn close_stamps_completion_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.log");
        let mut writer = SessionWriter::open(&path).unwrap();
        let whole_secs = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let stamp = std::time::UNIX_EPOCH + Duration::from_secs(whole_secs - 5);

        writer.close(stamp).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), stamp);
    }

    #[test]
    fn failure_mid_chunk_leaves_only_the_unwritten_tail() {
        let mut sink = FailingSink {
            accepted: Vec::new(),
            budget: 5,
            max_per_call: 2,
        };
        let batch = chunks(&["ab", "cdefgh", "ij"]);

        let progress = write_batch(&mut sink, &batch);
        assert!(progress.error.is_some());
        assert_eq!(progress.written, 1);
        assert_eq!(progress.partial, 3);
        assert_eq!(progress.bytes, 5);

        let outcome = WriteOutcome {
            chunks: batch,
            written: progress.written,
            partial: progress.partial,
            bytes: progress.bytes,
            error: progress.error,
        };
        let rest = outcome.unwritten();
        assert_eq!(rest, chunks(&["fgh", "ij"]));

        // Retrying the tail reproduces the batch exactly once.
        sink.budget = usize::MAX;
        assert!(write_batch(&mut sink, &rest).error.is_none());
        assert_eq!(sink.accepted, b"abcdefghij");
    }

    #[test]
    fn partial_offset_may_split_a_multibyte_character() {
        let mut sink = FailingSink {
            accepted: Vec::new(),
            budget: 1,
            max_per_call: 1,
        };
        let batch = chunks(&["é!"]);

        let progress = write_batch(&mut sink, &batch);
        let rest = WriteOutcome {
            chunks: batch,
            written: progress.written,
            partial: progress.partial,
            bytes: progress.bytes,
            error: progress.error,
        }
        .unwritten();

        sink.budget = usize::MAX;
        sink.max_per_call = usize::MAX;
        write_batch(&mut sink, &rest);
        assert_eq!(String::from_utf8(sink.accepted).unwrap(), "é!");
    }
}
