//! Room membership and the local presence snapshot.
//!
//! A session is one logical client instance identified by a random
//! `session_id`, distinct from the user identity: the same user in two
//! tabs is two sessions. The session tracks which room (file) is joined
//! and keeps a full snapshot of local presence so the join handshake can
//! carry current state instead of defaults.

use uuid::Uuid;

use crate::error::CollabError;
use crate::protocol::{CellEdit, ClientMessage, Selection, SheetPos, UserIdentity};

/// Full local presence state. Outbound deltas update this snapshot as
/// they are queued, so a reconnect handshake reflects reality.
#[derive(Debug, Clone, Default)]
pub struct LocalPresence {
    pub sheet_id: Uuid,
    pub selection: Option<Selection>,
    pub cell_edit: CellEdit,
    pub viewport: String,
    pub code_running: Vec<SheetPos>,
}

/// Membership state for one client session.
pub struct RoomSession {
    session_id: Uuid,
    room: Option<Uuid>,
    identity: Option<UserIdentity>,
    local: LocalPresence,
}

impl RoomSession {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            room: None,
            identity: None,
            local: LocalPresence::default(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn room(&self) -> Option<Uuid> {
        self.room
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        self.identity.as_ref()
    }

    pub fn local(&self) -> &LocalPresence {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalPresence {
        &mut self.local
    }

    /// Record membership in a room. Identity must carry a stable user id;
    /// the snapshot taken here stays fixed for the life of the membership.
    ///
    /// Returns `false` when already joined to the same room (no handshake
    /// needed). Joining a different room replaces the membership.
    pub fn join(
        &mut self,
        file_id: Uuid,
        identity: UserIdentity,
        sheet_id: Uuid,
    ) -> Result<bool, CollabError> {
        if identity.user_id.is_empty() {
            return Err(CollabError::MissingIdentity);
        }
        if self.room == Some(file_id) {
            return Ok(false);
        }
        self.room = Some(file_id);
        self.identity = Some(identity);
        self.local.sheet_id = sheet_id;
        Ok(true)
    }

    /// Build the join handshake from the current snapshot.
    pub fn build_enter_room(&self) -> Result<ClientMessage, CollabError> {
        let file_id = self.room.ok_or(CollabError::NotInRoom)?;
        let identity = self.identity.clone().ok_or(CollabError::MissingIdentity)?;
        Ok(ClientMessage::EnterRoom {
            session_id: self.session_id,
            file_id,
            identity,
            sheet_id: self.local.sheet_id,
            selection: self.local.selection,
            cell_edit: self.local.cell_edit.clone(),
            viewport: self.local.viewport.clone(),
            code_running: self.local.code_running.clone(),
        })
    }

    /// End membership. Returns the leave notice to send when a room was
    /// joined; leaving while not joined is a no-op.
    pub fn leave(&mut self) -> Option<ClientMessage> {
        let file_id = self.room.take()?;
        self.identity = None;
        self.local = LocalPresence::default();
        Some(ClientMessage::LeaveRoom {
            session_id: self.session_id,
            file_id,
        })
    }
}

impl Default for RoomSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> UserIdentity {
        UserIdentity {
            user_id: "auth0|ada".into(),
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: "ada@example.com".into(),
            image: String::new(),
        }
    }

    #[test]
    fn test_join_requires_user_id() {
        let mut session = RoomSession::new();
        let err = session
            .join(Uuid::new_v4(), UserIdentity::default(), Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, CollabError::MissingIdentity));
        assert!(session.room().is_none());
    }

    #[test]
    fn test_rejoining_same_room_is_idempotent() {
        let mut session = RoomSession::new();
        let file_id = Uuid::new_v4();
        assert!(session.join(file_id, identity(), Uuid::new_v4()).unwrap());
        assert!(!session.join(file_id, identity(), Uuid::new_v4()).unwrap());
        assert_eq!(session.room(), Some(file_id));
    }

    #[test]
    fn test_joining_other_room_replaces_membership() {
        let mut session = RoomSession::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        session.join(first, identity(), Uuid::new_v4()).unwrap();
        assert!(session.join(second, identity(), Uuid::new_v4()).unwrap());
        assert_eq!(session.room(), Some(second));
    }

    #[test]
    fn test_handshake_carries_local_snapshot() {
        let mut session = RoomSession::new();
        let file_id = Uuid::new_v4();
        let sheet_id = Uuid::new_v4();
        session.join(file_id, identity(), sheet_id).unwrap();
        session.local_mut().selection = Some(Selection::single(4, 2));
        session.local_mut().viewport = "cam".into();

        match session.build_enter_room().unwrap() {
            ClientMessage::EnterRoom {
                session_id,
                file_id: f,
                sheet_id: s,
                selection,
                viewport,
                ..
            } => {
                assert_eq!(session_id, session.session_id());
                assert_eq!(f, file_id);
                assert_eq!(s, sheet_id);
                assert_eq!(selection.unwrap().cursor.x, 4);
                assert_eq!(viewport, "cam");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_leave_clears_membership_once() {
        let mut session = RoomSession::new();
        let file_id = Uuid::new_v4();
        session.join(file_id, identity(), Uuid::new_v4()).unwrap();

        match session.leave() {
            Some(ClientMessage::LeaveRoom { file_id: f, .. }) => assert_eq!(f, file_id),
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(session.room().is_none());
        assert!(session.leave().is_none());
    }
}
