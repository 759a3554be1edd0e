use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::ids::JobIdentifier;
use cadence_core::ports::ConsoleLog;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Console output per job, kept in memory.
#[derive(Default)]
pub struct MemoryConsoleLog {
    lines: Mutex<HashMap<JobIdentifier, Vec<String>>>,
}

impl MemoryConsoleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lines(&self, job: &JobIdentifier) -> Vec<String> {
        self.lines.lock().await.get(job).cloned().unwrap_or_default()
    }

    /// Whether any line written for `job` contains `text`.
    pub async fn contains(&self, job: &JobIdentifier, text: &str) -> bool {
        self.lines
            .lock()
            .await
            .get(job)
            .is_some_and(|lines| lines.iter().any(|l| l.contains(text)))
    }
}

#[async_trait]
impl ConsoleLog for MemoryConsoleLog {
    async fn append(&self, job: &JobIdentifier, text: &str) -> Result<()> {
        self.lines
            .lock()
            .await
            .entry(job.clone())
            .or_default()
            .push(text.to_string());
        Ok(())
    }
}
