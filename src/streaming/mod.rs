pub mod manager;
mod tasks;
pub mod traits;

pub use manager::{FlushReport, StreamingLogManager};
pub use traits::StreamSink;

use crate::config::StreamingLogsConfig;

/// Build the stream sink described by `config` and start its background
/// maintenance. A disabled configuration yields an inert sink.
pub fn create_stream_sink(config: &StreamingLogsConfig) -> anyhow::Result<Box<dyn StreamSink>> {
    Ok(Box::new(StreamingLogManager::start(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_returns_disabled_sink() {
        let config = StreamingLogsConfig {
            enabled: false,
            ..StreamingLogsConfig::default()
        };
        let sink = create_stream_sink(&config).unwrap();
        assert_eq!(sink.name(), "disabled");
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn factory_returns_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let config = StreamingLogsConfig {
            directory: dir.path().display().to_string(),
            ..StreamingLogsConfig::default()
        };
        let sink = create_stream_sink(&config).unwrap();
        assert_eq!(sink.name(), "file");

        sink.append("s1", "line\n");
        sink.shutdown().await;
        assert_eq!(
            std::fs::read_to_string(dir.path().join("s1.log")).unwrap(),
            "line\n"
        );
    }
}
