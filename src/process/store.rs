//! In-memory store of background process records.
//!
//! A [`ProcessRecord`] is the sandbox-wide bookkeeping object for one
//! background or streaming command: status, buffered output, listener
//! fan-out, and a weak `{session_id, command_id}` link back to the session
//! command it wraps. Records are kept after termination so output stays
//! retrievable, and are swept by [`ProcessStore::cleanup`] once they are both
//! terminal and old enough.
//!
//! Listeners are plain unbounded channel senders; a closed receiver is
//! dropped on the next send. Terminal transitions are one-shot — they notify
//! status listeners, then clear every listener set so attached log streams
//! observe a close.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::sessions::protocol::OutputStream;
use crate::util::now_ms;

/// Lifecycle status of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
    Error,
}

impl ProcessStatus {
    /// Terminal statuses never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Killed | Self::Error
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
            Self::Error => "error",
        }
    }
}

impl FromStr for ProcessStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "killed" => Ok(Self::Killed),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

/// One labeled piece of process output, as delivered to log listeners.
#[derive(Debug, Clone, Serialize)]
pub struct LogChunk {
    pub stream: OutputStream,
    pub data: String,
}

/// Weak link from a record to the session command backing it. Resolution is
/// always by lookup — records never hold a session reference.
#[derive(Debug, Clone)]
pub struct CommandRef {
    pub session_id: String,
    pub command_id: String,
}

/// Bookkeeping for one background/streaming command.
#[derive(Debug)]
pub struct ProcessRecord {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub status: ProcessStatus,
    /// Monotonic start instant, used for age-based cleanup.
    pub started: Instant,
    /// Epoch milliseconds for the wire.
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub exit_code: Option<i32>,
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    /// `None` once the command has completed (nothing left to kill).
    pub command_ref: Option<CommandRef>,
    output_listeners: Vec<mpsc::UnboundedSender<LogChunk>>,
    status_listeners: Vec<mpsc::UnboundedSender<ProcessStatus>>,
}

impl ProcessRecord {
    #[must_use]
    pub fn new(id: String, command: String, session_id: String, command_ref: CommandRef) -> Self {
        Self {
            id,
            pid: None,
            command,
            status: ProcessStatus::Starting,
            started: Instant::now(),
            start_time: now_ms(),
            end_time: None,
            exit_code: None,
            session_id,
            stdout: String::new(),
            stderr: String::new(),
            command_ref: Some(command_ref),
            output_listeners: Vec::new(),
            status_listeners: Vec::new(),
        }
    }

    /// Append a chunk to the matching buffer and fan it out. Listeners whose
    /// receiver is gone are dropped.
    pub fn push_output(&mut self, chunk: LogChunk) {
        match chunk.stream {
            OutputStream::Stdout => self.stdout.push_str(&chunk.data),
            OutputStream::Stderr => self.stderr.push_str(&chunk.data),
        }
        self.output_listeners
            .retain(|tx| tx.send(chunk.clone()).is_ok());
    }

    /// Move to a new status, notifying status listeners.
    ///
    /// Returns `false` without any effect when the record is already
    /// terminal — terminal statuses are one-shot. Entering a terminal status
    /// stamps `end_time` and clears all listener sets, which closes attached
    /// log streams.
    pub fn transition(&mut self, status: ProcessStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.status_listeners.retain(|tx| tx.send(status).is_ok());
        if status.is_terminal() {
            self.end_time = Some(now_ms());
            self.command_ref = None;
            self.output_listeners.clear();
            self.status_listeners.clear();
        }
        true
    }

    /// Attach a live output listener. Callers must check for a terminal
    /// status first and close their channel themselves in that case.
    pub fn add_output_listener(&mut self, tx: mpsc::UnboundedSender<LogChunk>) {
        self.output_listeners.push(tx);
    }

    /// Attach a status listener (same terminal-status caveat as above).
    pub fn add_status_listener(&mut self, tx: mpsc::UnboundedSender<ProcessStatus>) {
        self.status_listeners.push(tx);
    }

    /// Wire-format snapshot without buffers or listeners.
    #[must_use]
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.id.clone(),
            pid: self.pid,
            command: self.command.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            exit_code: self.exit_code,
            session_id: self.session_id.clone(),
        }
    }
}

/// Serializable snapshot of a [`ProcessRecord`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub command: String,
    pub status: ProcessStatus,
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub session_id: String,
}

/// Map of process id → record. Not internally synchronized — the owning
/// service wraps it in its own lock.
#[derive(Default)]
pub struct ProcessStore {
    records: HashMap<String, ProcessRecord>,
}

impl ProcessStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: ProcessRecord) {
        self.records.insert(record.id.clone(), record);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ProcessRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ProcessRecord> {
        self.records.get_mut(id)
    }

    /// Apply a partial update. Fails (returns `false`) on unknown ids.
    pub fn update(&mut self, id: &str, apply: impl FnOnce(&mut ProcessRecord)) -> bool {
        match self.records.get_mut(id) {
            Some(record) => {
                apply(record);
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, id: &str) -> bool {
        self.records.remove(id).is_some()
    }

    /// Snapshots of all records, optionally filtered by status equality.
    #[must_use]
    pub fn list(&self, status: Option<ProcessStatus>) -> Vec<ProcessInfo> {
        let mut items: Vec<ProcessInfo> = self
            .records
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .map(ProcessRecord::info)
            .collect();
        items.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        items
    }

    /// Remove records that are terminal **and** started before the cutoff.
    /// Returns how many were removed.
    pub fn cleanup(&mut self, older_than: Instant) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, r| !(r.status.is_terminal() && r.started < older_than));
        before - self.records.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(id: &str) -> ProcessRecord {
        ProcessRecord::new(
            id.to_string(),
            "sleep 1".to_string(),
            "s1".to_string(),
            CommandRef {
                session_id: "s1".to_string(),
                command_id: id.to_string(),
            },
        )
    }

    #[test]
    fn terminal_transitions_are_one_shot() {
        let mut rec = record("p1");
        assert!(rec.transition(ProcessStatus::Running));
        assert!(rec.transition(ProcessStatus::Completed));
        assert!(rec.end_time.is_some());

        // Already terminal: refused, status unchanged.
        assert!(!rec.transition(ProcessStatus::Killed));
        assert_eq!(rec.status, ProcessStatus::Completed);
    }

    #[test]
    fn terminal_transition_closes_listeners() {
        let mut rec = record("p2");
        let (tx, mut rx) = mpsc::unbounded_channel();
        rec.add_output_listener(tx);
        let (stx, mut srx) = mpsc::unbounded_channel();
        rec.add_status_listener(stx);

        rec.transition(ProcessStatus::Failed);

        assert_eq!(srx.try_recv(), Ok(ProcessStatus::Failed));
        // Listener sets were cleared, so both channels are now closed.
        assert!(srx.try_recv().is_err());
        assert_eq!(
            rx.try_recv().unwrap_err(),
            mpsc::error::TryRecvError::Disconnected
        );
    }

    #[test]
    fn push_output_buffers_and_fans_out() {
        let mut rec = record("p3");
        let (tx, mut rx) = mpsc::unbounded_channel();
        rec.add_output_listener(tx);

        rec.push_output(LogChunk {
            stream: OutputStream::Stdout,
            data: "a\n".to_string(),
        });
        rec.push_output(LogChunk {
            stream: OutputStream::Stderr,
            data: "b\n".to_string(),
        });

        assert_eq!(rec.stdout, "a\n");
        assert_eq!(rec.stderr, "b\n");
        assert_eq!(rx.try_recv().unwrap().data, "a\n");
        assert_eq!(rx.try_recv().unwrap().data, "b\n");
    }

    #[test]
    fn update_fails_on_unknown_id() {
        let mut store = ProcessStore::new();
        assert!(!store.update("nope", |r| r.pid = Some(1)));

        store.insert(record("p4"));
        assert!(store.update("p4", |r| r.pid = Some(7)));
        assert_eq!(store.get("p4").unwrap().pid, Some(7));
    }

    #[test]
    fn list_filters_on_status() {
        let mut store = ProcessStore::new();
        store.insert(record("a"));
        let mut done = record("b");
        done.transition(ProcessStatus::Completed);
        store.insert(done);

        assert_eq!(store.list(None).len(), 2);
        let completed = store.list(Some(ProcessStatus::Completed));
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, "b");
        assert!(store.list(Some(ProcessStatus::Killed)).is_empty());
    }

    #[test]
    fn cleanup_only_removes_old_terminal_records() {
        let mut store = ProcessStore::new();

        let mut old_done = record("old-done");
        old_done.started = Instant::now() - Duration::from_secs(7200);
        old_done.transition(ProcessStatus::Completed);
        store.insert(old_done);

        let mut old_running = record("old-running");
        old_running.started = Instant::now() - Duration::from_secs(7200);
        old_running.transition(ProcessStatus::Running);
        store.insert(old_running);

        let mut fresh_done = record("fresh-done");
        fresh_done.transition(ProcessStatus::Killed);
        store.insert(fresh_done);

        let removed = store.cleanup(Instant::now() - Duration::from_secs(1800));
        assert_eq!(removed, 1);
        assert!(store.get("old-done").is_none());
        assert!(store.get("old-running").is_some());
        assert!(store.get("fresh-done").is_some());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ProcessStatus::Starting,
            ProcessStatus::Running,
            ProcessStatus::Completed,
            ProcessStatus::Failed,
            ProcessStatus::Killed,
            ProcessStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ProcessStatus>(), Ok(status));
        }
        assert!("bogus".parse::<ProcessStatus>().is_err());
    }
}
