//! Concurrent task record table owned by an execution backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{SimulationTask, TaskId, TaskRecord};
use crate::{Error, Result};

/// Records of one submitted campaign, keyed by task id.
///
/// Every update runs under the entry lock, so a record is mutated atomically
/// even when worker tasks and the poller race. The first transition of a
/// record into a terminal state is published once on an unbounded channel,
/// which [`drain_terminal`](Self::drain_terminal) empties.
pub struct TaskTable {
    records: DashMap<TaskId, TaskRecord>,
    terminal_tx: mpsc::UnboundedSender<TaskRecord>,
    terminal_rx: Mutex<mpsc::UnboundedReceiver<TaskRecord>>,
    finished: AtomicUsize,
}

impl TaskTable {
    /// Create Pending records for `tasks`.
    #[must_use]
    pub fn new(tasks: &[SimulationTask], max_attempts: u32) -> Self {
        let (terminal_tx, terminal_rx) = mpsc::unbounded_channel();
        let records = DashMap::with_capacity(tasks.len());
        for task in tasks {
            records.insert(
                task.id().clone(),
                TaskRecord::new(task.id().clone(), task.index(), max_attempts),
            );
        }
        Self {
            records,
            terminal_tx,
            terminal_rx: Mutex::new(terminal_rx),
            finished: AtomicUsize::new(0),
        }
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the table holds no record.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether every record is terminal.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.finished.load(Ordering::Acquire) == self.records.len()
    }

    /// Copy of one record.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<TaskRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Apply `f` to a record.
    ///
    /// # Errors
    ///
    /// Returns `Error::Other` for an unknown id, or whatever `f` returns.
    pub fn update<T>(&self, id: &TaskId, f: impl FnOnce(&mut TaskRecord) -> Result<T>) -> Result<T> {
        let mut entry = self
            .records
            .get_mut(id)
            .ok_or_else(|| Error::Other(format!("unknown task {id}")))?;
        let was_terminal = entry.is_terminal();
        let out = f(entry.value_mut())?;
        if !was_terminal && entry.is_terminal() {
            self.finished.fetch_add(1, Ordering::AcqRel);
            tracing::debug!(task = %id, status = ?entry.status(), "task finished");
            // The receiver lives as long as the table.
            let _ = self.terminal_tx.send(entry.value().clone());
        }
        Ok(out)
    }

    /// Records that became terminal since the previous call.
    #[must_use]
    pub fn drain_terminal(&self) -> Vec<TaskRecord> {
        let mut rx = self
            .terminal_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        out
    }

    /// All records, in matrix order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(TaskRecord::index);
        records
    }

    /// Permanently fail every non-terminal record. Returns how many changed.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<TaskId> = self.records.iter().map(|r| r.key().clone()).collect();
        ids.iter()
            .filter(|id| self.update(id, |r| Ok(r.cancel())).unwrap_or(false))
            .count()
    }
}
