use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

/// Minimum byte delta between two progress emissions.
const PROGRESS_BYTES_STEP: u64 = 256 * 1024;
/// Maximum quiet time between two progress emissions.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(350);

/// Direction of a transfer, as reported to progress listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// A progress update for one transfer. `total` is 0 when the size is unknown.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub id: String,
    pub direction: Direction,
    pub bytes: u64,
    pub total: u64,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Listener {
    conn_id: u64,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

/// Process-wide registry matching transfer ids to progress connections.
///
/// A single mutex guards the map; entries are small and every operation is
/// O(1). Shard the lock by transfer id if contention ever shows up in
/// profiles.
pub struct ProgressHub {
    listeners: Mutex<HashMap<String, Listener>>,
    next_conn_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Register a connection for a transfer id.
    ///
    /// If a connection is already registered for this id it is superseded:
    /// its sender is dropped, which closes the old listener's stream.
    pub fn register(self: &Arc<Self>, transfer_id: &str) -> ProgressListener {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock().unwrap();
        listeners.insert(transfer_id.to_string(), Listener { conn_id, tx });
        ProgressListener {
            hub: Arc::clone(self),
            transfer_id: transfer_id.to_string(),
            conn_id,
            rx,
        }
    }

    /// Remove a registration, but only if it still belongs to `conn_id`.
    /// A late unregister from a superseded connection must not clobber the
    /// registration that replaced it.
    pub fn unregister(&self, transfer_id: &str, conn_id: u64) {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners
            .get(transfer_id)
            .is_some_and(|l| l.conn_id == conn_id)
        {
            listeners.remove(transfer_id);
        }
    }

    /// Deliver an event to the listener for its transfer id, if any.
    /// Lossy: no registration or a closed channel silently drops the event.
    pub fn send(&self, event: ProgressEvent) {
        let listeners = self.listeners.lock().unwrap();
        if let Some(listener) = listeners.get(&event.id) {
            let _ = listener.tx.send(event);
        }
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

/// The receiving half of one progress connection.
///
/// Dropping the listener unregisters it; the conn-id check in `unregister`
/// keeps a superseded listener's drop from removing its replacement.
pub struct ProgressListener {
    hub: Arc<ProgressHub>,
    transfer_id: String,
    conn_id: u64,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressListener {
    /// Receive the next event. Returns `None` once superseded or unregistered.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ProgressListener {
    fn drop(&mut self) {
        self.hub.unregister(&self.transfer_id, self.conn_id);
    }
}

#[derive(Debug)]
struct ReporterState {
    bytes: u64,
    last_sent_bytes: u64,
    last_sent_at: Option<Instant>,
    finished: bool,
}

/// Emits throttled progress events for one transfer.
///
/// A reporter without a transfer id is inert. All emission is best-effort:
/// a missing or closed listener never affects the transfer itself, and the
/// terminal event is emitted at most once.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    hub: Arc<ProgressHub>,
    transfer_id: Option<String>,
    direction: Direction,
    total: u64,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(
        hub: Arc<ProgressHub>,
        transfer_id: Option<String>,
        direction: Direction,
        total: Option<u64>,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                hub,
                transfer_id,
                direction,
                total: total.unwrap_or(0),
                state: Mutex::new(ReporterState {
                    bytes: 0,
                    last_sent_bytes: 0,
                    last_sent_at: None,
                    finished: false,
                }),
            }),
        }
    }

    /// Record the running byte count for the transfer.
    ///
    /// The count never goes backwards. An event is emitted when at least
    /// 256 KiB has accumulated since the last one or 350 ms has elapsed,
    /// whichever comes first.
    pub fn tick(&self, bytes: u64) {
        let Some(id) = self.inner.transfer_id.as_deref() else {
            return;
        };
        let mut state = self.inner.state.lock().unwrap();
        if state.finished {
            return;
        }
        if bytes > state.bytes {
            state.bytes = bytes;
        }
        let step_reached = state.bytes - state.last_sent_bytes >= PROGRESS_BYTES_STEP;
        let interval_elapsed = state
            .last_sent_at
            .is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL);
        if !step_reached && !interval_elapsed {
            return;
        }
        state.last_sent_bytes = state.bytes;
        state.last_sent_at = Some(Instant::now());
        let event = self.event(id, state.bytes, false, None);
        drop(state);
        self.inner.hub.send(event);
    }

    /// Emit the terminal event for a successful transfer, flushing a final
    /// non-terminal update first so listeners always see the closing count.
    pub fn finish(&self) {
        let Some(id) = self.inner.transfer_id.as_deref() else {
            return;
        };
        let mut state = self.inner.state.lock().unwrap();
        if state.finished {
            return;
        }
        state.finished = true;
        let bytes = state.bytes;
        let flush = state.last_sent_at.is_none() || state.last_sent_bytes != bytes;
        drop(state);
        if flush {
            self.inner.hub.send(self.event(id, bytes, false, None));
        }
        self.inner.hub.send(self.event(id, bytes, true, None));
    }

    /// Emit the terminal event for a failed transfer.
    pub fn fail(&self, error: &str) {
        let Some(id) = self.inner.transfer_id.as_deref() else {
            return;
        };
        let mut state = self.inner.state.lock().unwrap();
        if state.finished {
            return;
        }
        state.finished = true;
        let bytes = state.bytes;
        drop(state);
        self.inner
            .hub
            .send(self.event(id, bytes, true, Some(error.to_string())));
    }

    fn event(&self, id: &str, bytes: u64, done: bool, error: Option<String>) -> ProgressEvent {
        ProgressEvent {
            id: id.to_string(),
            direction: self.inner.direction,
            bytes,
            total: self.inner.total,
            done,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, bytes: u64) -> ProgressEvent {
        ProgressEvent {
            id: id.to_string(),
            direction: Direction::Upload,
            bytes,
            total: 0,
            done: false,
            error: None,
        }
    }

    fn drain(listener: &mut ProgressListener) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(ev) = listener.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_register_send_receive() {
        let hub = Arc::new(ProgressHub::new());
        let mut listener = hub.register("t1");
        hub.send(event("t1", 42));
        let received = listener.recv().await.unwrap();
        assert_eq!(received.bytes, 42);
    }

    #[tokio::test]
    async fn test_send_without_listener_is_noop() {
        let hub = Arc::new(ProgressHub::new());
        hub.send(event("nobody", 1));
    }

    #[tokio::test]
    async fn test_second_registration_supersedes_first() {
        let hub = Arc::new(ProgressHub::new());
        let mut first = hub.register("t1");
        let mut second = hub.register("t1");

        // The first connection's stream is closed by the supersession.
        assert!(first.recv().await.is_none());

        hub.send(event("t1", 7));
        assert_eq!(second.recv().await.unwrap().bytes, 7);
    }

    #[tokio::test]
    async fn test_superseded_drop_does_not_clobber_replacement() {
        let hub = Arc::new(ProgressHub::new());
        let first = hub.register("t1");
        let mut second = hub.register("t1");
        drop(first);

        hub.send(event("t1", 9));
        assert_eq!(second.recv().await.unwrap().bytes, 9);
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let hub = Arc::new(ProgressHub::new());
        let listener = hub.register("t1");
        drop(listener);
        assert!(hub.listeners.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sized_transfer_reports_monotonic_progress() {
        let hub = Arc::new(ProgressHub::new());
        let mut listener = hub.register("t1");
        let reporter = ProgressReporter::new(
            Arc::clone(&hub),
            Some("t1".to_string()),
            Direction::Upload,
            Some(10_000),
        );

        reporter.tick(2_500);
        reporter.tick(5_000);
        reporter.tick(10_000);
        reporter.finish();

        let events = drain(&mut listener);
        assert!(events.len() >= 2);
        for pair in events.windows(2) {
            assert!(pair[0].bytes <= pair[1].bytes);
        }
        let terminal = events.last().unwrap();
        assert!(terminal.done);
        assert_eq!(terminal.bytes, 10_000);
        assert_eq!(terminal.total, 10_000);
        // The last non-terminal event carries the same closing count.
        let final_update = &events[events.len() - 2];
        assert!(!final_update.done);
        assert_eq!(final_update.bytes, terminal.bytes);
        assert_eq!(events.iter().filter(|e| e.done).count(), 1);
    }

    #[tokio::test]
    async fn test_byte_count_never_decreases() {
        let hub = Arc::new(ProgressHub::new());
        let mut listener = hub.register("t1");
        let reporter = ProgressReporter::new(
            Arc::clone(&hub),
            Some("t1".to_string()),
            Direction::Download,
            None,
        );

        reporter.tick(500_000);
        reporter.tick(100);
        reporter.finish();

        let events = drain(&mut listener);
        for pair in events.windows(2) {
            assert!(pair[0].bytes <= pair[1].bytes);
        }
        assert_eq!(events.last().unwrap().bytes, 500_000);
    }

    #[tokio::test]
    async fn test_failure_emits_single_terminal_with_error() {
        let hub = Arc::new(ProgressHub::new());
        let mut listener = hub.register("t1");
        let reporter = ProgressReporter::new(
            Arc::clone(&hub),
            Some("t1".to_string()),
            Direction::Upload,
            Some(1_000),
        );

        reporter.tick(400);
        reporter.fail("backend unreachable");
        // Later outcomes must not produce a second terminal event.
        reporter.finish();
        reporter.tick(900);

        let events = drain(&mut listener);
        let terminals: Vec<_> = events.iter().filter(|e| e.done).collect();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].error.as_deref(), Some("backend unreachable"));
        assert_eq!(terminals[0].bytes, 400);
    }

    #[tokio::test]
    async fn test_reporter_without_transfer_id_is_inert() {
        let hub = Arc::new(ProgressHub::new());
        let mut listener = hub.register("t1");
        let reporter = ProgressReporter::new(Arc::clone(&hub), None, Direction::Upload, None);

        reporter.tick(100);
        reporter.finish();
        assert!(drain(&mut listener).is_empty());
    }

    #[test]
    fn test_event_serialization() {
        let ev = ProgressEvent {
            id: "t1".to_string(),
            direction: Direction::Download,
            bytes: 10,
            total: 100,
            done: false,
            error: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["direction"], "download");
        assert_eq!(json["bytes"], 10);
        assert!(json.get("error").is_none());

        let failed = ProgressEvent {
            error: Some("boom".to_string()),
            done: true,
            ..ev
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["error"], "boom");
        assert_eq!(json["done"], true);
    }
}
