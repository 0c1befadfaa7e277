//! Background maintenance
//!
//! One worker thread per store runs flushes and compactions requested by
//! tables. Failed compactions are retried with exponential backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::CompactionConfig;
use crate::error::Result;
use crate::table::Table;
use crate::CellarError;

/// Tables by name, shared between the store and the worker
pub type TableRegistry = Arc<RwLock<HashMap<String, Arc<Table>>>>;

/// Poll interval while no retry is pending
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Work item for the maintenance thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// Flush the table's memtable if it is over the size limit
    Flush(String),

    /// Run a minor compaction; `attempt` counts earlier failures
    Compact { table: String, attempt: u32 },

    /// Stop the worker
    Shutdown,
}

/// Handle to the maintenance thread
pub struct MaintenanceWorker {
    sender: Sender<MaintenanceTask>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    /// Spawn the worker thread
    ///
    /// Besides queued tasks, the worker fsyncs WAL entries older than
    /// `wal_sync_every`.
    pub fn start(tables: TableRegistry, config: CompactionConfig, wal_sync_every: Duration) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let poll = if wal_sync_every.is_zero() {
            IDLE_POLL
        } else {
            wal_sync_every.min(IDLE_POLL)
        };
        let worker = Worker {
            receiver,
            tables,
            config,
            poll,
            retries: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name("cellar-maintenance".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Sender for tables to request work
    pub fn sender(&self) -> Sender<MaintenanceTask> {
        self.sender.clone()
    }

    /// Stop the thread and wait for the task in progress
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(MaintenanceTask::Shutdown);
            if handle.join().is_err() {
                error!("Maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Retry {
    due: Instant,
    table: String,
    attempt: u32,
}

struct Worker {
    receiver: Receiver<MaintenanceTask>,
    tables: TableRegistry,
    config: CompactionConfig,
    /// Longest sleep between WAL sync checks
    poll: Duration,
    retries: Vec<Retry>,
}

impl Worker {
    fn run(mut self) {
        info!("Maintenance worker started");
        loop {
            match self.receiver.recv_timeout(self.next_wakeup()) {
                Ok(MaintenanceTask::Flush(table)) => self.flush(&table),
                Ok(MaintenanceTask::Compact { table, attempt }) => self.compact(&table, attempt),
                Ok(MaintenanceTask::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.sync_due_wals();
            self.run_due_retries();
        }
        info!("Maintenance worker stopped");
    }

    fn next_wakeup(&self) -> Duration {
        let now = Instant::now();
        self.retries
            .iter()
            .map(|r| r.due.saturating_duration_since(now))
            .min()
            .unwrap_or(self.poll)
            .min(self.poll)
    }

    fn sync_due_wals(&self) {
        let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        for table in tables {
            if let Err(e) = table.sync_wal_if_due() {
                error!(table = table.name(), error = %e, "Background WAL sync failed");
            }
        }
    }

    fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    fn flush(&mut self, name: &str) {
        let table = match self.table(name) {
            Some(table) => table,
            None => return,
        };
        // Requests pile up while the memtable stays full
        if !table.memtable_full() {
            return;
        }
        match table.flush() {
            Ok(()) => {}
            Err(CellarError::TableDeleting(_)) | Err(CellarError::TableDisabled(_)) => {}
            Err(e) => error!(table = name, error = %e, "Background flush failed"),
        }
    }

    fn compact(&mut self, name: &str, attempt: u32) {
        let table = match self.table(name) {
            Some(table) => table,
            None => return,
        };
        if attempt == 0 && !table.needs_compaction() {
            return;
        }

        match table.compact(false) {
            Ok(_) => {}
            Err(CellarError::CompactionAborted) | Err(CellarError::TableDeleting(_)) => {
                debug!(table = name, "Compaction cancelled");
            }
            Err(e) => {
                let next = attempt + 1;
                if next > self.config.max_retries {
                    error!(table = name, attempts = next, error = %e, "Compaction failed, giving up");
                    return;
                }
                let delay = backoff(&self.config, attempt);
                warn!(
                    table = name,
                    attempt = next,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Compaction failed, retrying"
                );
                self.retries.push(Retry {
                    due: Instant::now() + delay,
                    table: name.to_string(),
                    attempt: next,
                });
            }
        }
    }

    fn run_due_retries(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<Retry>, Vec<Retry>) = self.retries.drain(..).partition(|r| r.due <= now);
        self.retries = pending;
        for retry in due {
            self.compact(&retry.table, retry.attempt);
        }
    }
}

/// `retry_base * 2^attempt`, capped at `retry_max`
pub fn backoff(config: &CompactionConfig, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    config
        .retry_base
        .checked_mul(factor)
        .unwrap_or(config.retry_max)
        .min(config.retry_max)
}
