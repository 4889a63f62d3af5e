//! JSONL file sink - one event per line, append-only

use super::Sink;
use crate::domain::error::SinkError;
use crate::domain::types::ScanEvent;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub struct JsonlSink {
    name: String,
    path: PathBuf,
    /// Serialises appends so concurrent dispatches never interleave lines
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(name: &str, file_path: &str) -> Self {
        info!(sink = %name, file_path = %file_path, "jsonl_sink_initialized");
        Self { name: name.to_string(), path: PathBuf::from(file_path), write_lock: Mutex::new(()) }
    }

    async fn append_line(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        debug!(file = %self.path.display(), bytes = %buf.len(), "jsonl_written");
        Ok(())
    }
}

#[async_trait]
impl Sink for JsonlSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, event: &ScanEvent) -> Result<(), SinkError> {
        let json = serde_json::to_string(event).map_err(|e| SinkError::Permanent(e.to_string()))?;
        // disk errors (full, locked, unmounted) are usually transient
        self.append_line(&json).await.map_err(|e| SinkError::Retriable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn event(seq: u64) -> ScanEvent {
        ScanEvent {
            event_id: Uuid::now_v7(),
            scanner_id: "pi-dock".to_string(),
            sequence_no: seq,
            object_id: "OBJ002".to_string(),
            object_name: "Laptop".to_string(),
            category: "personal".to_string(),
            location_id: "LOC002".to_string(),
            location_name: "Server Room".to_string(),
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlSink::new("audit", path.to_str().unwrap());

        sink.send(&event(1)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["object_id"], "OBJ002");
        assert_eq!(parsed["sequence_no"], 1);
    }

    #[tokio::test]
    async fn test_append_mode_and_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("audit.jsonl");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{\"existing\":\"data\"}\n").unwrap();

        let sink = JsonlSink::new("audit", path.to_str().unwrap());
        sink.send(&event(1)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("existing"));
    }

    #[tokio::test]
    async fn test_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("audit.jsonl");
        let sink = JsonlSink::new("audit", path.to_str().unwrap());
        sink.send(&event(1)).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(JsonlSink::new("audit", path.to_str().unwrap()));

        let mut handles = Vec::new();
        for seq in 0..20 {
            let sink = sink.clone();
            handles.push(tokio::spawn(async move { sink.send(&event(seq)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 20);
        for line in lines {
            let _: ScanEvent = serde_json::from_str(line).unwrap();
        }
    }
}
