//! Outbound update batching.
//!
//! High-frequency local changes (mouse moves, selection drags, viewport
//! pans) never hit the wire directly. They are merged into a single
//! pending [`PresenceUpdate`] and drained at most once per fast tick, so
//! a burst of per-pixel mouse events costs one message. A much slower
//! heartbeat tick bounds how long the session can stay silent: any sent
//! message counts as liveness, and only a fully quiet interval produces
//! an explicit heartbeat.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::protocol::{CellEdit, MouseUpdate, PresenceUpdate, Selection, SheetPos};

/// The single pending delta, merged in place between ticks.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: PresenceUpdate,
}

impl UpdateQueue {
    pub fn set_mouse(&mut self, x: f64, y: f64) {
        self.pending.mouse = Some(MouseUpdate::At { x, y });
    }

    pub fn clear_mouse(&mut self) {
        self.pending.mouse = Some(MouseUpdate::Hidden);
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.pending.selection = Some(selection);
    }

    pub fn set_sheet(&mut self, sheet_id: Uuid) {
        self.pending.sheet_id = Some(sheet_id);
    }

    pub fn set_cell_edit(&mut self, cell_edit: CellEdit) {
        self.pending.cell_edit = Some(cell_edit);
    }

    /// Ends a live cell edit: an inactive edit state is still transmitted
    /// so remote peers drop the editing indicator.
    pub fn clear_cell_edit(&mut self) {
        self.pending.cell_edit = Some(CellEdit::default());
    }

    pub fn set_viewport(&mut self, viewport: String) {
        self.pending.viewport = Some(viewport);
    }

    pub fn set_code_running(&mut self, cells: Vec<SheetPos>) {
        self.pending.code_running = Some(cells);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flush the pending delta, leaving the queue empty.
    pub fn take(&mut self) -> Option<PresenceUpdate> {
        if self.pending.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending))
    }

    pub fn clear(&mut self) {
        self.pending = PresenceUpdate::default();
    }
}

/// Drains the [`UpdateQueue`] on a fixed-rate tick and tracks liveness
/// for the heartbeat tick. Both ticks are driven by the host.
pub struct UpdateBatcher {
    queue: UpdateQueue,
    update_interval: Duration,
    heartbeat_interval: Duration,
    last_tick: Instant,
    /// Last time any message went out, heartbeats included.
    last_sent: Instant,
}

impl UpdateBatcher {
    pub fn new(update_interval: Duration, heartbeat_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            queue: UpdateQueue::default(),
            update_interval,
            heartbeat_interval,
            // Allow an immediate first flush.
            last_tick: now - update_interval,
            last_sent: now,
        }
    }

    pub fn queue(&mut self) -> &mut UpdateQueue {
        &mut self.queue
    }

    /// Fast tick. Returns the coalesced delta to send, if the rate limit
    /// allows and anything is pending. The returned delta counts as the
    /// most recent liveness signal.
    pub fn tick(&mut self, now: Instant) -> Option<PresenceUpdate> {
        if now.duration_since(self.last_tick) < self.update_interval {
            return None;
        }
        self.last_tick = now;
        let update = self.queue.take()?;
        self.last_sent = now;
        Some(update)
    }

    /// Slow tick. True when the session has been quiet long enough that
    /// an explicit heartbeat is due.
    pub fn heartbeat_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_sent) >= self.heartbeat_interval
    }

    /// Record that a message was sent outside the batcher (heartbeat,
    /// transaction, join), pushing the next heartbeat out.
    pub fn mark_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }
}
