use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use log::info;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// One bearing estimate out of the tracker.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrackSample {
    pub timestamp_ms: u64,
    pub stage: &'static str,
    pub iteration: u64,
    pub angle_deg: f64,
    pub delay_deg: f64,
    pub peak_dbfs: f64,
}

impl TrackSample {
    pub fn now(stage: &'static str, iteration: u64, angle_deg: f64, delay_deg: f64, peak_dbfs: f64) -> TrackSample {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        TrackSample {
            timestamp_ms,
            stage,
            iteration,
            angle_deg,
            delay_deg,
            peak_dbfs,
        }
    }
}

#[async_trait]
pub trait Reporter: Send + Sync {
    fn name(&self) -> &'static str;
    async fn report(&self, sample: &TrackSample);
}

/// Fan-out over every registered sink.
pub struct ReporterList {
    reporters: Vec<Arc<dyn Reporter>>,
}

impl Default for ReporterList {
    fn default() -> Self {
        Self::new()
    }
}

impl ReporterList {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn register<R: Reporter + 'static>(&mut self, reporter: R) {
        self.reporters.push(Arc::new(reporter));
    }

    pub fn register_shared(&mut self, reporter: Arc<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    pub async fn report(&self, sample: &TrackSample) {
        for r in &self.reporters {
            r.report(sample).await;
        }
    }
}

/// Leveled log line per sample.
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn report(&self, sample: &TrackSample) {
        info!(
            "[{}] iter={} angle={:.2} deg delay={:.2} deg peak={:.1} dBFS",
            sample.stage, sample.iteration, sample.angle_deg, sample.delay_deg, sample.peak_dbfs
        );
    }
}

/// Append-only newline-delimited JSON sink.
pub struct JsonlReporter {
    file: Arc<tokio::sync::Mutex<tokio::fs::File>>,
}

impl JsonlReporter {
    pub async fn new(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Arc::new(tokio::sync::Mutex::new(file)),
        })
    }
}

#[async_trait]
impl Reporter for JsonlReporter {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn report(&self, sample: &TrackSample) {
        if let Ok(json) = serde_json::to_string(sample) {
            let mut f = self.file.lock().await;
            let _ = f.write_all(json.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }
    }
}

/// Bounded ring of the most recent samples, for one-shot queries and
/// shutdown summaries.
pub struct HistoryRing {
    inner: Mutex<VecDeque<TrackSample>>,
    max_len: usize,
}

impl HistoryRing {
    pub fn new(max_len: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            max_len: max_len.max(1),
        }
    }

    pub fn latest(&self) -> Option<TrackSample> {
        self.inner.lock().unwrap().back().cloned()
    }

    pub fn snapshot(&self) -> Vec<TrackSample> {
        self.inner.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl Reporter for HistoryRing {
    fn name(&self) -> &'static str {
        "history"
    }

    async fn report(&self, sample: &TrackSample) {
        let mut ring = self.inner.lock().unwrap();
        if ring.len() == self.max_len {
            ring.pop_front();
        }
        ring.push_back(sample.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(iteration: u64) -> TrackSample {
        TrackSample {
            timestamp_ms: 1000 + iteration,
            stage: "track",
            iteration,
            angle_deg: 9.5,
            delay_deg: -30.0,
            peak_dbfs: -61.2,
        }
    }

    #[tokio::test]
    async fn jsonl_writes_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let reporter = JsonlReporter::new(file.path().to_str().unwrap())
            .await
            .unwrap();
        reporter.report(&sample(0)).await;
        reporter.report(&sample(1)).await;
        let content = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"angle_deg\":9.5"));
    }

    #[tokio::test]
    async fn history_ring_is_bounded_and_ordered() {
        let ring = HistoryRing::new(3);
        for i in 0..5 {
            ring.report(&sample(i)).await;
        }
        assert_eq!(ring.len(), 3);
        let snap = ring.snapshot();
        assert_eq!(snap[0].iteration, 2);
        assert_eq!(ring.latest().unwrap().iteration, 4);
    }

    #[tokio::test]
    async fn list_fans_out() {
        let ring = Arc::new(HistoryRing::new(8));
        let mut list = ReporterList::new();
        list.register_shared(Arc::clone(&ring) as Arc<dyn Reporter>);
        list.register(LogReporter);
        list.report(&sample(7)).await;
        assert_eq!(ring.latest().unwrap().iteration, 7);
    }
}
