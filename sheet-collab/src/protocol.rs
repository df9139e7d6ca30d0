//! Binary wire protocol for multiplayer synchronization.
//!
//! Every envelope is a bincode-encoded serde enum. Outbound and inbound
//! directions are separate types so each side only has to handle the
//! kinds it can actually receive:
//!
//! - [`ClientMessage`] — client → server (join, leave, presence update,
//!   heartbeat, transaction submit, backfill request)
//! - [`ServerMessage`] — server → client (join ack, roster snapshot,
//!   presence delta, transaction broadcast, backfill batch, sequence
//!   announcement, error)
//!
//! Presence fields travel as a [`PresenceUpdate`]: every field is an
//! `Option`, and `None` means "unchanged". This makes the merge-if-present
//! semantics explicit in the wire format instead of relying on a dynamic
//! missing-key convention.
//!
//! Operation payloads are opaque `Vec<u8>` — the document engine owns
//! their encoding and this layer never inspects them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CollabError;

// ───────────────────────────────────────────────────────────────────
// Cell / selection value types
// ───────────────────────────────────────────────────────────────────

/// A single cell coordinate within a sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRef {
    pub x: i64,
    pub y: i64,
}

/// An inclusive rectangular range of cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRange {
    pub min: CellRef,
    pub max: CellRef,
}

/// Cursor selection: a single cell, optionally extended to a rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub cursor: CellRef,
    pub range: Option<CellRange>,
}

impl Selection {
    pub fn single(x: i64, y: i64) -> Self {
        Self {
            cursor: CellRef { x, y },
            range: None,
        }
    }
}

/// A cell position qualified by its sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetPos {
    pub x: i64,
    pub y: i64,
    pub sheet_id: Uuid,
}

/// Live cell-edit state for one participant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellEdit {
    pub active: bool,
    pub text: String,
    /// Caret offset within `text`.
    pub cursor: u32,
    /// Whether the edit targets a code/formula cell.
    pub code_editor: bool,
    pub bold: Option<bool>,
    pub italic: Option<bool>,
}

/// Mouse pointer update. `Hidden` clears the pointer without touching the
/// last known coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MouseUpdate {
    Hidden,
    At { x: f64, y: f64 },
}

/// Stable identity fields for a participant. `user_id` is the remote
/// identity key and must be non-empty to join a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub image: String,
}

// ───────────────────────────────────────────────────────────────────
// Presence delta
// ───────────────────────────────────────────────────────────────────

/// Per-field tagged presence delta. `None` means the field is unchanged;
/// deltas are merged into participant state field by field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub mouse: Option<MouseUpdate>,
    pub selection: Option<Selection>,
    pub sheet_id: Option<Uuid>,
    pub cell_edit: Option<CellEdit>,
    /// Opaque serialized camera state.
    pub viewport: Option<String>,
    /// Cells currently being recomputed by this participant.
    pub code_running: Option<Vec<SheetPos>>,
}

impl PresenceUpdate {
    /// True when no field carries a change.
    pub fn is_empty(&self) -> bool {
        self.mouse.is_none()
            && self.selection.is_none()
            && self.sheet_id.is_none()
            && self.cell_edit.is_none()
            && self.viewport.is_none()
            && self.code_running.is_none()
    }

    /// Merge `other` on top of `self`, field by field.
    pub fn merge(&mut self, other: PresenceUpdate) {
        if other.mouse.is_some() {
            self.mouse = other.mouse;
        }
        if other.selection.is_some() {
            self.selection = other.selection;
        }
        if other.sheet_id.is_some() {
            self.sheet_id = other.sheet_id;
        }
        if other.cell_edit.is_some() {
            self.cell_edit = other.cell_edit;
        }
        if other.viewport.is_some() {
            self.viewport = other.viewport;
        }
        if other.code_running.is_some() {
            self.code_running = other.code_running;
        }
    }
}

/// One roster entry in a [`ServerMessage::UsersInRoom`] snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomUser {
    pub session_id: Uuid,
    pub identity: UserIdentity,
    pub sheet_id: Uuid,
    pub selection: Option<Selection>,
    pub cell_edit: CellEdit,
    pub viewport: String,
    pub code_running: Vec<SheetPos>,
}

/// A transaction with its server-assigned position in the total order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedTransaction {
    pub id: Uuid,
    pub sequence_num: u64,
    pub operations: Vec<u8>,
}

// ───────────────────────────────────────────────────────────────────
// Envelopes
// ───────────────────────────────────────────────────────────────────

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join handshake: identity plus a full snapshot of local presence.
    EnterRoom {
        session_id: Uuid,
        file_id: Uuid,
        identity: UserIdentity,
        sheet_id: Uuid,
        selection: Option<Selection>,
        cell_edit: CellEdit,
        viewport: String,
        code_running: Vec<SheetPos>,
    },
    LeaveRoom {
        session_id: Uuid,
        file_id: Uuid,
    },
    /// Coalesced presence delta, sent at most once per fast tick.
    UserUpdate {
        session_id: Uuid,
        file_id: Uuid,
        update: PresenceUpdate,
    },
    /// Liveness signal sent when nothing else has gone out recently.
    Heartbeat {
        session_id: Uuid,
        file_id: Uuid,
    },
    /// Locally-produced transaction, already applied optimistically.
    /// The server assigns the final sequence number.
    Transaction {
        id: Uuid,
        session_id: Uuid,
        file_id: Uuid,
        operations: Vec<u8>,
    },
    /// Backfill request for all transactions from `min_sequence_num` on.
    GetTransactions {
        session_id: Uuid,
        file_id: Uuid,
        min_sequence_num: u64,
    },
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join response: the server's current sequence number for the room.
    EnterRoom {
        file_id: Uuid,
        sequence_num: u64,
    },
    /// Authoritative roster snapshot; absent sessions have left.
    UsersInRoom {
        file_id: Uuid,
        users: Vec<RoomUser>,
    },
    /// Presence delta for one participant.
    UserUpdate {
        session_id: Uuid,
        file_id: Uuid,
        update: PresenceUpdate,
    },
    /// Broadcast of an accepted transaction with its assigned order.
    Transaction {
        id: Uuid,
        file_id: Uuid,
        sequence_num: u64,
        operations: Vec<u8>,
    },
    /// Backfill response, ascending by sequence number.
    Transactions {
        file_id: Uuid,
        transactions: Vec<SequencedTransaction>,
    },
    /// Periodic sequence announcement, sent regardless of activity.
    CurrentTransaction {
        file_id: Uuid,
        sequence_num: u64,
    },
    Error {
        error: String,
    },
    /// No-op keepalive from the server.
    Empty,
}

impl ClientMessage {
    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Encode(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// The room this message addresses.
    pub fn file_id(&self) -> Uuid {
        match self {
            ClientMessage::EnterRoom { file_id, .. }
            | ClientMessage::LeaveRoom { file_id, .. }
            | ClientMessage::UserUpdate { file_id, .. }
            | ClientMessage::Heartbeat { file_id, .. }
            | ClientMessage::Transaction { file_id, .. }
            | ClientMessage::GetTransactions { file_id, .. } => *file_id,
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Decode(e.to_string()))?;
        Ok(msg)
    }

    /// The room this message addresses, if it carries one.
    /// Error and keepalive envelopes are room-less.
    pub fn file_id(&self) -> Option<Uuid> {
        match self {
            ServerMessage::EnterRoom { file_id, .. }
            | ServerMessage::UsersInRoom { file_id, .. }
            | ServerMessage::UserUpdate { file_id, .. }
            | ServerMessage::Transaction { file_id, .. }
            | ServerMessage::Transactions { file_id, .. }
            | ServerMessage::CurrentTransaction { file_id, .. } => Some(*file_id),
            ServerMessage::Error { .. } | ServerMessage::Empty => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update() -> PresenceUpdate {
        PresenceUpdate {
            mouse: Some(MouseUpdate::At { x: 10.5, y: -3.0 }),
            selection: Some(Selection::single(4, 7)),
            sheet_id: Some(Uuid::new_v4()),
            cell_edit: None,
            viewport: Some("{\"x\":0,\"y\":0,\"scale\":1}".into()),
            code_running: None,
        }
    }

    #[test]
    fn test_user_update_roundtrip() {
        let msg = ClientMessage::UserUpdate {
            session_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            update: sample_update(),
        };
        let encoded = msg.encode().unwrap();
        let decoded = ClientMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_enter_room_roundtrip() {
        let msg = ClientMessage::EnterRoom {
            session_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            identity: UserIdentity {
                user_id: "auth0|abc".into(),
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                email: "ada@example.com".into(),
                image: "https://example.com/a.png".into(),
            },
            sheet_id: Uuid::new_v4(),
            selection: Some(Selection::single(0, 0)),
            cell_edit: CellEdit::default(),
            viewport: String::new(),
            code_running: vec![],
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_transaction_roundtrip() {
        let ops = vec![1u8, 2, 3, 4];
        let msg = ClientMessage::Transaction {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            file_id: Uuid::new_v4(),
            operations: ops.clone(),
        };
        let encoded = msg.encode().unwrap();
        match ClientMessage::decode(&encoded).unwrap() {
            ClientMessage::Transaction { operations, .. } => assert_eq!(operations, ops),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_server_transactions_roundtrip() {
        let file_id = Uuid::new_v4();
        let msg = ServerMessage::Transactions {
            file_id,
            transactions: vec![
                SequencedTransaction {
                    id: Uuid::new_v4(),
                    sequence_num: 7,
                    operations: vec![9, 9],
                },
                SequencedTransaction {
                    id: Uuid::new_v4(),
                    sequence_num: 8,
                    operations: vec![],
                },
            ],
        };
        let encoded = msg.encode().unwrap();
        let decoded = ServerMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.file_id(), Some(file_id));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_roomless_envelopes() {
        assert_eq!(ServerMessage::Empty.file_id(), None);
        assert_eq!(
            ServerMessage::Error {
                error: "bad".into()
            }
            .file_id(),
            None
        );
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ServerMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ClientMessage::decode(&[0xFF]).is_err());
    }

    #[test]
    fn test_presence_update_empty() {
        assert!(PresenceUpdate::default().is_empty());
        assert!(!sample_update().is_empty());
    }

    #[test]
    fn test_presence_update_merge_keeps_unset_fields() {
        let mut base = sample_update();
        let original_selection = base.selection;
        base.merge(PresenceUpdate {
            mouse: Some(MouseUpdate::Hidden),
            ..Default::default()
        });
        assert_eq!(base.mouse, Some(MouseUpdate::Hidden));
        assert_eq!(base.selection, original_selection);
    }

    #[test]
    fn test_presence_update_merge_overwrites_set_fields() {
        let mut base = PresenceUpdate::default();
        base.merge(PresenceUpdate {
            viewport: Some("a".into()),
            ..Default::default()
        });
        base.merge(PresenceUpdate {
            viewport: Some("b".into()),
            ..Default::default()
        });
        assert_eq!(base.viewport.as_deref(), Some("b"));
    }

    #[test]
    fn test_cell_edit_defaults_inactive() {
        let edit = CellEdit::default();
        assert!(!edit.active);
        assert!(edit.text.is_empty());
        assert_eq!(edit.cursor, 0);
        assert!(!edit.code_editor);
    }
}
