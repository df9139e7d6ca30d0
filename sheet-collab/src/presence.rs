//! In-memory table of remote participants and their transient state.
//!
//! Presence is everything that is *not* document content: cursors,
//! selections, viewports, live cell edits, running computations. The map
//! is owned exclusively by the sync core; the UI layer only reads
//! snapshots and subscribes to [`CollabEvent`]s.
//!
//! Two inbound paths mutate it:
//!
//! - a full roster snapshot reconciles the whole table (insert new
//!   participants, merge existing ones field by field, drop absentees),
//! - a per-participant delta merges only the fields it carries.
//!
//! A delta may arrive before the roster introduces its sender; that is
//! tolerated silently, and the roster fills the entry in later. The local
//! session never gets an entry — self-updates are filtered out.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::client::CollabEvent;
use crate::protocol::{
    CellEdit, MouseUpdate, PresenceUpdate, RoomUser, Selection, SheetPos, UserIdentity,
};

/// One remote participant's presence state.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub session_id: Uuid,
    pub identity: UserIdentity,
    /// Display-color index, assigned on first sight and stable while the
    /// participant remains present. Wraps around the palette size.
    pub color: usize,
    pub sheet_id: Uuid,
    pub selection: Option<Selection>,
    pub cell_edit: CellEdit,
    pub viewport: String,
    pub code_running: Vec<SheetPos>,
    pub mouse_x: f64,
    pub mouse_y: f64,
    pub mouse_visible: bool,
}

impl Participant {
    fn from_roster(user: RoomUser, color: usize) -> Self {
        Self {
            session_id: user.session_id,
            identity: user.identity,
            color,
            sheet_id: user.sheet_id,
            selection: user.selection,
            cell_edit: user.cell_edit,
            viewport: user.viewport,
            code_running: user.code_running,
            mouse_x: 0.0,
            mouse_y: 0.0,
            mouse_visible: false,
        }
    }
}

/// Table of remote participants, keyed by session id.
pub struct PresenceMap {
    local_session: Uuid,
    palette_size: usize,
    /// Next display-color index to hand out.
    next_color: usize,
    participants: HashMap<Uuid, Participant>,
    events: UnboundedSender<CollabEvent>,
}

impl PresenceMap {
    pub fn new(
        local_session: Uuid,
        palette_size: usize,
        events: UnboundedSender<CollabEvent>,
    ) -> Self {
        Self {
            local_session,
            palette_size: palette_size.max(1),
            next_color: 0,
            participants: HashMap::new(),
            events,
        }
    }

    /// Full reconciliation against an authoritative roster snapshot.
    ///
    /// Existing entries keep their color and transient fields not carried
    /// by the roster; entries absent from the snapshot are removed.
    pub fn apply_roster(&mut self, users: Vec<RoomUser>) {
        let mut remaining: HashSet<Uuid> = self.participants.keys().copied().collect();

        for user in users {
            if user.session_id == self.local_session {
                continue;
            }
            remaining.remove(&user.session_id);

            if let Some(existing) = self.participants.get_mut(&user.session_id) {
                existing.identity = user.identity;
                existing.sheet_id = user.sheet_id;
                existing.selection = user.selection;
                log::debug!("roster updated participant {}", user.session_id);
            } else {
                let color = self.next_color;
                self.next_color = (self.next_color + 1) % self.palette_size;
                let session_id = user.session_id;
                self.participants
                    .insert(session_id, Participant::from_roster(user, color));
                log::debug!("participant {session_id} entered room (color {color})");
                let _ = self.events.send(CollabEvent::ParticipantJoined { session_id });
            }
        }

        for session_id in remaining {
            self.participants.remove(&session_id);
            log::debug!("participant {session_id} left room");
            let _ = self.events.send(CollabEvent::ParticipantLeft { session_id });
        }

        let _ = self.events.send(CollabEvent::RosterChanged);
    }

    /// Incremental merge of one participant's delta. Fields not carried by
    /// the delta stay as they are. Self-updates and deltas for unknown
    /// participants are ignored.
    pub fn apply_update(&mut self, session_id: Uuid, update: PresenceUpdate) {
        if session_id == self.local_session {
            return;
        }
        let Some(player) = self.participants.get_mut(&session_id) else {
            // Delta raced ahead of the roster snapshot; the roster will
            // introduce this participant shortly.
            log::debug!("presence delta for unknown participant {session_id}, ignored");
            return;
        };

        if let Some(mouse) = update.mouse {
            match mouse {
                MouseUpdate::At { x, y } => {
                    player.mouse_x = x;
                    player.mouse_y = y;
                    player.mouse_visible = true;
                }
                MouseUpdate::Hidden => player.mouse_visible = false,
            }
            let sheet_id = player.sheet_id;
            let _ = self
                .events
                .send(CollabEvent::MouseMoved { session_id, sheet_id });
        }

        if let Some(sheet_id) = update.sheet_id {
            if player.sheet_id != sheet_id {
                player.sheet_id = sheet_id;
                let _ = self.events.send(CollabEvent::SheetChanged { session_id });
            }
        }

        if let Some(selection) = update.selection {
            player.selection = Some(selection);
            let _ = self
                .events
                .send(CollabEvent::SelectionChanged { session_id });
        }

        if let Some(cell_edit) = update.cell_edit {
            player.cell_edit = cell_edit;
            let _ = self.events.send(CollabEvent::CellEditChanged { session_id });
        }

        if let Some(viewport) = update.viewport {
            player.viewport = viewport;
            let _ = self.events.send(CollabEvent::ViewportChanged { session_id });
        }

        if let Some(code_running) = update.code_running {
            player.code_running = code_running;
            let _ = self
                .events
                .send(CollabEvent::CodeRunningChanged { session_id });
        }
    }

    /// Whether any remote participant is actively editing the given cell.
    /// Used upstream to block concurrent edits of the same cell.
    pub fn cell_is_being_edited(&self, x: i64, y: i64, sheet_id: Uuid) -> bool {
        self.participants.values().any(|p| {
            p.sheet_id == sheet_id
                && p.cell_edit.active
                && p.selection
                    .map(|s| s.cursor.x == x && s.cursor.y == y)
                    .unwrap_or(false)
        })
    }

    pub fn get(&self, session_id: &Uuid) -> Option<&Participant> {
        self.participants.get(session_id)
    }

    /// Snapshot of all remote participants, for the UI layer.
    pub fn participants(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Drop all entries. Used when leaving a room.
    pub fn clear(&mut self) {
        self.participants.clear();
        self.next_color = 0;
    }
}
