use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use crate::contract::OrchestrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSendError {
    Full,
    Closed,
}

impl From<JobSendError> for OrchestrationError {
    fn from(err: JobSendError) -> Self {
        match err {
            JobSendError::Full => Self::ResourceExhausted("engine job queue is full".to_string()),
            JobSendError::Closed => Self::Collaborator("engine job queue closed".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobQueueStats {
    pub depth: usize,
    pub peak_depth: usize,
    pub total_sent: u64,
}

#[derive(Debug)]
struct JobCounters {
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    total_sent: AtomicU64,
}

impl JobCounters {
    fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            total_sent: AtomicU64::new(0),
        }
    }

    fn on_send(&self) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
    }

    fn on_recv(&self) {
        let _ = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    }

    fn snapshot(&self) -> JobQueueStats {
        JobQueueStats {
            depth: self.depth.load(Ordering::Relaxed),
            peak_depth: self.peak_depth.load(Ordering::Relaxed),
            total_sent: self.total_sent.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of a bounded FIFO feeding the engine worker.
#[derive(Debug)]
pub struct JobQueueTx<T> {
    inner: SyncSender<T>,
    counters: Arc<JobCounters>,
}

impl<T> Clone for JobQueueTx<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

#[derive(Debug)]
pub struct JobQueueRx<T> {
    inner: Receiver<T>,
    counters: Arc<JobCounters>,
}

impl<T> JobQueueTx<T> {
    pub fn send(&self, value: T) -> Result<(), JobSendError> {
        self.inner.send(value).map_err(|_| JobSendError::Closed)?;
        self.counters.on_send();
        Ok(())
    }

    pub fn try_send(&self, value: T) -> Result<(), JobSendError> {
        match self.inner.try_send(value) {
            Ok(()) => {
                self.counters.on_send();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(JobSendError::Full),
            Err(TrySendError::Disconnected(_)) => Err(JobSendError::Closed),
        }
    }

    pub fn stats(&self) -> JobQueueStats {
        self.counters.snapshot()
    }
}

impl<T> JobQueueRx<T> {
    /// Blocks for the next job; `None` once every sender is gone.
    pub fn recv(&self) -> Option<T> {
        let item = self.inner.recv().ok()?;
        self.counters.on_recv();
        Some(item)
    }

    pub fn stats(&self) -> JobQueueStats {
        self.counters.snapshot()
    }
}

pub fn job_queue<T>(capacity: usize) -> (JobQueueTx<T>, JobQueueRx<T>) {
    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let counters = Arc::new(JobCounters::new());
    (
        JobQueueTx {
            inner: tx,
            counters: Arc::clone(&counters),
        },
        JobQueueRx {
            inner: rx,
            counters,
        },
    )
}
