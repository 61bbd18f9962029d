// Fan-in for one orchestration page: every spawned job owns a completion handle and
// reports exactly once. The page waits for all reports or fails on the first error
// beyond the threshold.

use tokio::sync::mpsc;

use crate::error::{Result, RollupError};

#[derive(Debug)]
struct JobReport {
    resource_id: String,
    result: std::result::Result<(), String>,
}

pub struct PageTracker {
    tx: mpsc::UnboundedSender<JobReport>,
    rx: mpsc::UnboundedReceiver<JobReport>,
    total: usize,
    error_threshold: usize,
}

impl PageTracker {
    /// `error_threshold` is the number of failed jobs tolerated before the page fails.
    pub fn new(error_threshold: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            total: 0,
            error_threshold,
        }
    }

    pub fn handle(&mut self, resource_id: impl Into<String>) -> CompletionHandle {
        self.total += 1;
        CompletionHandle {
            resource_id: resource_id.into(),
            tx: Some(self.tx.clone()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Wait for every handle. Returns the number of successful jobs.
    ///
    /// On failure the remaining jobs keep running detached; their reports are discarded.
    pub async fn wait(self) -> Result<usize> {
        let PageTracker {
            tx,
            mut rx,
            total,
            error_threshold,
        } = self;
        drop(tx);
        let mut succeeded = 0;
        let mut failed = 0;
        let mut first: Option<String> = None;
        while let Some(report) = rx.recv().await {
            match report.result {
                Ok(()) => succeeded += 1,
                Err(reason) => {
                    failed += 1;
                    tracing::warn!(resource_id = %report.resource_id, error = %reason, "job failed");
                    first.get_or_insert_with(|| format!("{}: {}", report.resource_id, reason));
                    if failed > error_threshold {
                        return Err(RollupError::PageFailed {
                            failed,
                            total,
                            first: first.unwrap_or_default(),
                        });
                    }
                }
            }
        }
        Ok(succeeded)
    }
}

pub struct CompletionHandle {
    resource_id: String,
    tx: Option<mpsc::UnboundedSender<JobReport>>,
}

impl CompletionHandle {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn complete(mut self, result: Result<()>) {
        self.send(result.map_err(|e| e.to_string()));
    }

    fn send(&mut self, result: std::result::Result<(), String>) {
        if let Some(tx) = self.tx.take() {
            // The tracker may already have given up on the page.
            let _ = tx.send(JobReport {
                resource_id: self.resource_id.clone(),
                result,
            });
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let reason = RollupError::JobAbandoned {
                resource_id: self.resource_id.clone(),
            }
            .to_string();
            self.send(Err(reason));
        }
    }
}
