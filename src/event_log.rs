use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use dw_plugin::event::BusEvent;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

/// One appended event and its position in the log. Sequences start at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub seq: u64,
    pub event: BusEvent,
}

/// Append-only store behind bus persistence and replay.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Returns the sequence number the event was stored under.
    async fn append(&self, event: &BusEvent) -> Result<u64>;

    /// Highest sequence appended so far, 0 when empty.
    async fn last_sequence(&self) -> Result<u64>;

    /// Entries with `after < seq <= upto`, oldest first.
    async fn read(&self, after: u64, upto: u64) -> Result<Vec<LoggedEvent>>;
}

#[derive(Default)]
pub struct MemoryEventLog {
    entries: RwLock<Vec<LoggedEvent>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: &BusEvent) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let seq = entries.len() as u64 + 1;
        entries.push(LoggedEvent { seq, event: event.clone() });
        Ok(seq)
    }

    async fn last_sequence(&self) -> Result<u64> {
        Ok(self.entries.read().await.len() as u64)
    }

    async fn read(&self, after: u64, upto: u64) -> Result<Vec<LoggedEvent>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.seq > after && e.seq <= upto)
            .cloned()
            .collect())
    }
}

/// One JSON object per line, `{"seq": n, "event": {...}}`.
///
/// Reopening an existing file continues its numbering. Lines that fail to
/// parse are skipped with a warning.
pub struct JsonlEventLog {
    path: PathBuf,
    file: Mutex<fs::File>,
    last: AtomicU64,
}

impl JsonlEventLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let last = read_entries(&path).await?.last().map(|e| e.seq).unwrap_or(0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self { path, file: Mutex::new(file), last: AtomicU64::new(last) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn read_entries(path: &Path) -> Result<Vec<LoggedEvent>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading event log {}", path.display())),
    };
    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LoggedEvent>(line) {
            Ok(entry) => out.push(entry),
            Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping unreadable event log line"),
        }
    }
    Ok(out)
}

#[async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: &BusEvent) -> Result<u64> {
        let mut file = self.file.lock().await;
        let seq = self.last.load(Ordering::SeqCst) + 1;
        let mut line = serde_json::to_vec(&LoggedEvent { seq, event: event.clone() })?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        self.last.store(seq, Ordering::SeqCst);
        Ok(seq)
    }

    async fn last_sequence(&self) -> Result<u64> {
        Ok(self.last.load(Ordering::SeqCst))
    }

    async fn read(&self, after: u64, upto: u64) -> Result<Vec<LoggedEvent>> {
        // hold the writer so we never see a half-written line
        let _file = self.file.lock().await;
        Ok(read_entries(&self.path)
            .await?
            .into_iter()
            .filter(|e| e.seq > after && e.seq <= upto)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_log_reads_half_open_ranges() {
        let log = MemoryEventLog::new();
        for t in ["a", "b", "c"] {
            log.append(&BusEvent::new(t, "test")).await.unwrap();
        }
        assert_eq!(log.last_sequence().await.unwrap(), 3);
        let mid: Vec<_> = log.read(1, 2).await.unwrap().into_iter().map(|e| e.event.event_type).collect();
        assert_eq!(mid, vec!["b"]);
    }

    #[tokio::test]
    async fn jsonl_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        {
            let log = JsonlEventLog::open(&path).await.unwrap();
            log.append(&BusEvent::new("one", "test").with_label("k", "v")).await.unwrap();
            log.append(&BusEvent::new("two", "test")).await.unwrap();
        }
        let log = JsonlEventLog::open(&path).await.unwrap();
        assert_eq!(log.last_sequence().await.unwrap(), 2);
        assert_eq!(log.append(&BusEvent::new("three", "test")).await.unwrap(), 3);
        let all = log.read(0, 3).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event.labels["k"], "v");
    }
}
