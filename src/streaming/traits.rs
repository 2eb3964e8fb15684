use async_trait::async_trait;

/// Destination for streamed session output.
///
/// `append` must never wait on disk; implementations buffer and persist in
/// the background. Neither operation reports success or failure to the
/// caller.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Queue `chunk` for `session_id`.
    fn append(&self, session_id: &str, chunk: &str);

    /// Persist everything queued for `session_id` and release its file.
    async fn complete(&self, session_id: &str);

    /// Stop background work and complete every open session.
    async fn shutdown(&self);

    fn name(&self) -> &str;
}
