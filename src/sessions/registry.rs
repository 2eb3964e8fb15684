//! Active registry: the in-memory record of every session still being written.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use super::id::SessionId;
use super::writer::SessionWriter;

/// Writer handle shared between the registry and whoever is flushing.
pub type SharedWriter = Arc<tokio::sync::Mutex<SessionWriter>>;

/// Buffer limits applied on enqueue and on re-queue after a failed flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    /// Pending bytes at which an out-of-cycle flush is requested.
    pub flush_threshold_bytes: usize,
    /// Hard cap on pending bytes per session.
    pub max_pending_bytes: usize,
}

/// What happened to a chunk handed to [`ActiveRegistry::enqueue`].
#[derive(Debug)]
pub enum Enqueued {
    Queued {
        pending_bytes: usize,
        flush_due: bool,
        created: bool,
    },
    /// Over the pending cap; the chunk was dropped.
    Rejected { pending_bytes: usize },
    /// The session is being completed; the chunk was dropped.
    Completing,
    /// The log file could not be opened; no record was created.
    OpenFailed(io::Error),
}

struct SessionRecord {
    writer: SharedWriter,
    buffer: VecDeque<Vec<u8>>,
    pending_bytes: usize,
    opened_at: SystemTime,
    last_activity: SystemTime,
    last_flush_time: Option<SystemTime>,
    consecutive_failures: u32,
    dropped_chunks: u64,
    completing: bool,
}

impl SessionRecord {
    fn new(writer: SessionWriter, now: SystemTime) -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            buffer: VecDeque::new(),
            pending_bytes: 0,
            opened_at: now,
            last_activity: now,
            last_flush_time: None,
            consecutive_failures: 0,
            dropped_chunks: 0,
            completing: false,
        }
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.pending_bytes = 0;
        self.buffer.drain(..).collect()
    }
}

/// Point-in-time view of one registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub pending_chunks: usize,
    pub pending_bytes: usize,
    pub opened_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub last_flush_time: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub dropped_chunks: u64,
    pub completing: bool,
}

/// Mutex-protected map of session id to session record.
///
/// The lock guards record insertion/removal and every buffer. File data is
/// never written while it is held; the only file-system calls made under it
/// are the append-mode open of a new session and the unlink performed by
/// [`with_unregistered`](Self::with_unregistered), so registering a session
/// and deleting its file can never interleave.
pub struct ActiveRegistry {
    directory: PathBuf,
    limits: BufferLimits,
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl ActiveRegistry {
    pub fn new(directory: impl Into<PathBuf>, limits: BufferLimits) -> Self {
        Self {
            directory: directory.into(),
            limits,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn log_path(&self, id: &SessionId) -> PathBuf {
        self.directory.join(id.file_name())
    }

    /// Queue `chunk` for `id`, creating the record (and opening its file) on
    /// first use.
    pub fn enqueue(&self, id: &SessionId, chunk: &str, now: SystemTime) -> Enqueued {
        let mut sessions = self.sessions.lock();

        let created = !sessions.contains_key(id);
        if created {
            match SessionWriter::open(&self.log_path(id)) {
                Ok(writer) => {
                    sessions.insert(id.clone(), SessionRecord::new(writer, now));
                }
                Err(error) => return Enqueued::OpenFailed(error),
            }
        }

        let Some(record) = sessions.get_mut(id) else {
            return Enqueued::Completing;
        };
        if record.completing {
            return Enqueued::Completing;
        }

        // A lone chunk is always accepted, otherwise it could never be stored.
        if !record.buffer.is_empty()
            && record.pending_bytes + chunk.len() > self.limits.max_pending_bytes
        {
            record.dropped_chunks += 1;
            return Enqueued::Rejected {
                pending_bytes: record.pending_bytes,
            };
        }

        record.buffer.push_back(chunk.as_bytes().to_vec());
        record.pending_bytes += chunk.len();
        record.last_activity = now;
        Enqueued::Queued {
            pending_bytes: record.pending_bytes,
            flush_due: record.pending_bytes >= self.limits.flush_threshold_bytes,
            created,
        }
    }

    pub fn writer(&self, id: &SessionId) -> Option<SharedWriter> {
        self.sessions.lock().get(id).map(|r| Arc::clone(&r.writer))
    }

    /// Snapshot-and-clear the buffer of `id`. `None` when `id` is not registered.
    pub fn take_buffer(&self, id: &SessionId) -> Option<Vec<Vec<u8>>> {
        self.sessions.lock().get_mut(id).map(SessionRecord::drain)
    }

    /// Put an unwritten batch back in front of anything queued since it was
    /// taken. Returns how many of the newest chunks had to be dropped to stay
    /// under the pending cap.
    pub fn requeue_front(&self, id: &SessionId, chunks: Vec<Vec<u8>>) -> usize {
        let mut sessions = self.sessions.lock();
        let Some(record) = sessions.get_mut(id) else {
            return chunks.len();
        };

        for chunk in chunks.into_iter().rev() {
            record.pending_bytes += chunk.len();
            record.buffer.push_front(chunk);
        }

        let mut dropped = 0;
        while record.pending_bytes > self.limits.max_pending_bytes && record.buffer.len() > 1 {
            if let Some(chunk) = record.buffer.pop_back() {
                record.pending_bytes -= chunk.len();
                dropped += 1;
            }
        }
        record.dropped_chunks += dropped as u64;
        dropped
    }

    pub fn record_flush(&self, id: &SessionId, now: SystemTime) {
        if let Some(record) = self.sessions.lock().get_mut(id) {
            record.last_flush_time = Some(now);
            record.last_activity = now;
            record.consecutive_failures = 0;
        }
    }

    /// Count a failed flush; returns the running count of consecutive failures.
    pub fn record_failure(&self, id: &SessionId) -> u32 {
        match self.sessions.lock().get_mut(id) {
            Some(record) => {
                record.consecutive_failures += 1;
                record.consecutive_failures
            }
            None => 0,
        }
    }

    /// Mark `id` as completing and take its remaining buffer.
    ///
    /// Only applies if the record still owns `writer`; a record re-created
    /// after an earlier completion is left alone. From here on appends for
    /// `id` are dropped until the record is removed.
    pub fn begin_completion(
        &self,
        id: &SessionId,
        writer: &SharedWriter,
    ) -> Option<Vec<Vec<u8>>> {
        let mut sessions = self.sessions.lock();
        let record = sessions.get_mut(id)?;
        if !Arc::ptr_eq(&record.writer, writer) {
            return None;
        }
        record.completing = true;
        Some(record.drain())
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Sessions with no append or flush since `cutoff`.
    pub fn idle_since(&self, cutoff: SystemTime) -> Vec<SessionId> {
        let sessions = self.sessions.lock();
        let mut ids: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, r)| !r.completing && r.last_activity < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock();
        let mut results: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(id, r)| SessionSnapshot {
                session_id: id.clone(),
                pending_chunks: r.buffer.len(),
                pending_bytes: r.pending_bytes,
                opened_at: r.opened_at.into(),
                last_activity: r.last_activity.into(),
                last_flush_time: r.last_flush_time.map(Into::into),
                consecutive_failures: r.consecutive_failures,
                dropped_chunks: r.dropped_chunks,
                completing: r.completing,
            })
            .collect();
        results.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        results
    }

    /// Run `f` while holding the registry lock, but only if `id` is not
    /// registered. Returns `None` (without running `f`) for a registered id.
    pub fn with_unregistered<R>(&self, id: &SessionId, f: impl FnOnce() -> R) -> Option<R> {
        let sessions = self.sessions.lock();
        if sessions.contains_key(id) {
            return None;
        }
        let result = f();
        drop(sessions);
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> BufferLimits {
        BufferLimits {
            flush_threshold_bytes: 8,
            max_pending_bytes: 16,
        }
    }

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    fn texts(chunks: Vec<Vec<u8>>) -> Vec<String> {
        chunks
            .into_iter()
            .map(|c| String::from_utf8(c).unwrap())
            .collect()
    }

    #[test]
    fn enqueue_creates_record_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let sid = id("s1");

        match registry.enqueue(&sid, "abc", SystemTime::now()) {
            Enqueued::Queued {
                pending_bytes,
                flush_due,
                created,
            } => {
                assert_eq!(pending_bytes, 3);
                assert!(!flush_due);
                assert!(created);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(registry.contains(&sid));
        assert!(dir.path().join("s1.log").exists());

        match registry.enqueue(&sid, "defgh", SystemTime::now()) {
            Enqueued::Queued {
                flush_due, created, ..
            } => {
                assert!(flush_due);
                assert!(!created);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn open_failure_creates_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path().join("missing"), limits());
        let sid = id("s1");

        assert!(matches!(
            registry.enqueue(&sid, "abc", SystemTime::now()),
            Enqueued::OpenFailed(_)
        ));
        assert!(!registry.contains(&sid));
    }

    #[test]
    fn take_buffer_preserves_order_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let sid = id("s1");
        for chunk in ["a", "b", "c"] {
            registry.enqueue(&sid, chunk, SystemTime::now());
        }

        assert_eq!(texts(registry.take_buffer(&sid).unwrap()), vec!["a", "b", "c"]);
        assert!(registry.take_buffer(&sid).unwrap().is_empty());
        assert!(registry.take_buffer(&id("other")).is_none());
    }

    #[test]
    fn pending_cap_rejects_new_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let sid = id("s1");

        registry.enqueue(&sid, "0123456789", SystemTime::now());
        assert!(matches!(
            registry.enqueue(&sid, "0123456789", SystemTime::now()),
            Enqueued::Rejected { pending_bytes: 10 }
        ));
        assert_eq!(registry.snapshot()[0].dropped_chunks, 1);
    }

    #[test]
    fn oversized_lone_chunk_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let sid = id("s1");

        assert!(matches!(
            registry.enqueue(&sid, &"x".repeat(64), SystemTime::now()),
            Enqueued::Queued { .. }
        ));
    }

    #[test]
    fn requeue_goes_in_front_and_drops_newest_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let sid = id("s1");

        registry.enqueue(&sid, "aaaa", SystemTime::now());
        registry.enqueue(&sid, "bbbb", SystemTime::now());
        let batch = registry.take_buffer(&sid).unwrap();
        registry.enqueue(&sid, "cccc", SystemTime::now());
        registry.enqueue(&sid, "dddd", SystemTime::now());
        registry.enqueue(&sid, "eeee", SystemTime::now());

        let dropped = registry.requeue_front(&sid, batch);
        assert_eq!(dropped, 1);
        assert_eq!(
            texts(registry.take_buffer(&sid).unwrap()),
            vec!["aaaa", "bbbb", "cccc", "dddd"]
        );
    }

    #[test]
    fn completing_session_drops_appends_until_removed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let sid = id("s1");

        registry.enqueue(&sid, "a", SystemTime::now());
        let writer = registry.writer(&sid).unwrap();
        assert_eq!(
            texts(registry.begin_completion(&sid, &writer).unwrap()),
            vec!["a"]
        );
        assert!(matches!(
            registry.enqueue(&sid, "b", SystemTime::now()),
            Enqueued::Completing
        ));
        assert!(registry.remove(&sid));
        assert!(!registry.remove(&sid));
        assert!(registry.begin_completion(&sid, &writer).is_none());
    }

    #[test]
    fn begin_completion_ignores_recreated_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let sid = id("s1");

        registry.enqueue(&sid, "a", SystemTime::now());
        let stale = registry.writer(&sid).unwrap();
        registry.remove(&sid);
        registry.enqueue(&sid, "b", SystemTime::now());

        assert!(registry.begin_completion(&sid, &stale).is_none());
        assert_eq!(texts(registry.take_buffer(&sid).unwrap()), vec!["b"]);
    }

    #[test]
    fn idle_since_reports_quiet_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let now = SystemTime::now();
        let long_ago = now - Duration::from_secs(3600);

        registry.enqueue(&id("old"), "a", long_ago);
        registry.enqueue(&id("new"), "a", now);

        assert_eq!(
            registry.idle_since(now - Duration::from_secs(60)),
            vec![id("old")]
        );
    }

    #[test]
    fn with_unregistered_skips_registered_ids() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ActiveRegistry::new(dir.path(), limits());
        let sid = id("s1");
        registry.enqueue(&sid, "a", SystemTime::now());

        assert_eq!(registry.with_unregistered(&sid, || 1), None);
        assert_eq!(registry.with_unregistered(&id("s2"), || 2), Some(2));
    }
}
