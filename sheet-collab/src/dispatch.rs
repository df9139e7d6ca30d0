//! Inbound message routing.
//!
//! One decoded [`ServerMessage`] in, mutations to the presence map and
//! sequencer plus a small [`Actions`] record out. The caller owns the
//! side effects (sending a backfill request, emitting events); routing
//! itself stays synchronous and transport-free, which keeps every
//! protocol path unit-testable without a socket.
//!
//! A message addressing a room other than the joined one is rejected
//! individually; the connection and all other traffic continue.

use uuid::Uuid;

use crate::error::CollabError;
use crate::presence::PresenceMap;
use crate::protocol::ServerMessage;
use crate::sequencer::{DocumentEngine, Outcome, TransactionSequencer};

/// Follow-up work owed after routing one message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Actions {
    /// Request a backfill starting at this sequence number.
    pub request_backfill: Option<u64>,
    /// The tracker advanced to this sequence number.
    pub applied: Option<u64>,
    /// Join acknowledged at this server sequence number.
    pub joined: Option<u64>,
    /// The server reported an error in-band.
    pub server_error: Option<String>,
}

pub fn dispatch<E: DocumentEngine>(
    msg: ServerMessage,
    room: Option<Uuid>,
    presence: &mut PresenceMap,
    sequencer: &mut TransactionSequencer<E>,
) -> Result<Actions, CollabError> {
    if let Some(received) = msg.file_id() {
        if room != Some(received) {
            return Err(CollabError::RoomMismatch {
                joined: room.unwrap_or(Uuid::nil()),
                received,
            });
        }
    }

    let mut actions = Actions::default();
    match msg {
        ServerMessage::EnterRoom { sequence_num, .. } => {
            actions.joined = Some(sequence_num);
            actions.request_backfill = sequencer.receive_sequence_num(sequence_num);
        }
        ServerMessage::UsersInRoom { users, .. } => {
            presence.apply_roster(users);
        }
        ServerMessage::UserUpdate {
            session_id, update, ..
        } => {
            presence.apply_update(session_id, update);
        }
        ServerMessage::Transaction {
            id,
            sequence_num,
            operations,
            ..
        } => match sequencer.receive_transaction(id, sequence_num, operations)? {
            Outcome::Applied | Outcome::AckedOwn => {
                actions.applied = Some(sequencer.sequence_num());
            }
            Outcome::Buffered { backfill } => {
                actions.request_backfill = backfill;
            }
            Outcome::Duplicate => {}
        },
        ServerMessage::Transactions { transactions, .. } => {
            let before = sequencer.sequence_num();
            sequencer.receive_transactions(transactions)?;
            if sequencer.sequence_num() > before {
                actions.applied = Some(sequencer.sequence_num());
            }
        }
        ServerMessage::CurrentTransaction { sequence_num, .. } => {
            actions.request_backfill = sequencer.receive_sequence_num(sequence_num);
        }
        ServerMessage::Error { error } => {
            log::warn!("server error: {error}");
            actions.server_error = Some(error);
        }
        ServerMessage::Empty => {}
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CollabEvent;
    use crate::protocol::{CellEdit, RoomUser, SequencedTransaction, UserIdentity};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NullEngine;

    impl DocumentEngine for NullEngine {
        fn apply(&mut self, _: &[u8]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Ok(())
        }

        fn applied_sequence(&self) -> u64 {
            0
        }

        fn receive_sequence_announcement(&mut self, _: u64) {}
    }

    fn fixtures() -> (
        Uuid,
        PresenceMap,
        TransactionSequencer<NullEngine>,
        mpsc::UnboundedReceiver<CollabEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Uuid::new_v4(),
            PresenceMap::new(Uuid::new_v4(), 8, tx),
            TransactionSequencer::new(NullEngine, Duration::from_secs(5)),
            rx,
        )
    }

    #[test]
    fn test_wrong_room_is_rejected_per_message() {
        let (room, mut presence, mut sequencer, _rx) = fixtures();
        let err = dispatch(
            ServerMessage::CurrentTransaction {
                file_id: Uuid::new_v4(),
                sequence_num: 5,
            },
            Some(room),
            &mut presence,
            &mut sequencer,
        )
        .unwrap_err();
        assert!(matches!(err, CollabError::RoomMismatch { .. }));
        assert_eq!(sequencer.sequence_num(), 0);

        // A well-addressed message right after still routes.
        let actions = dispatch(
            ServerMessage::Transaction {
                id: Uuid::new_v4(),
                file_id: room,
                sequence_num: 1,
                operations: vec![],
            },
            Some(room),
            &mut presence,
            &mut sequencer,
        )
        .unwrap();
        assert_eq!(actions.applied, Some(1));
    }

    #[test]
    fn test_roster_routes_to_presence() {
        let (room, mut presence, mut sequencer, _rx) = fixtures();
        let users = vec![RoomUser {
            session_id: Uuid::new_v4(),
            identity: UserIdentity {
                user_id: "u".into(),
                ..Default::default()
            },
            sheet_id: Uuid::new_v4(),
            selection: None,
            cell_edit: CellEdit::default(),
            viewport: String::new(),
            code_running: vec![],
        }];
        dispatch(
            ServerMessage::UsersInRoom {
                file_id: room,
                users,
            },
            Some(room),
            &mut presence,
            &mut sequencer,
        )
        .unwrap();
        assert_eq!(presence.len(), 1);
    }

    #[test]
    fn test_join_ack_behind_server_requests_backfill() {
        let (room, mut presence, mut sequencer, _rx) = fixtures();
        let actions = dispatch(
            ServerMessage::EnterRoom {
                file_id: room,
                sequence_num: 12,
            },
            Some(room),
            &mut presence,
            &mut sequencer,
        )
        .unwrap();
        assert_eq!(actions.joined, Some(12));
        assert_eq!(actions.request_backfill, Some(1));
    }

    #[test]
    fn test_backfill_batch_reports_catchup() {
        let (room, mut presence, mut sequencer, _rx) = fixtures();
        let transactions = (1..=3)
            .map(|sequence_num| SequencedTransaction {
                id: Uuid::new_v4(),
                sequence_num,
                operations: vec![],
            })
            .collect();
        let actions = dispatch(
            ServerMessage::Transactions {
                file_id: room,
                transactions,
            },
            Some(room),
            &mut presence,
            &mut sequencer,
        )
        .unwrap();
        assert_eq!(actions.applied, Some(3));
    }

    #[test]
    fn test_error_and_empty_leave_state_untouched() {
        let (room, mut presence, mut sequencer, _rx) = fixtures();
        let actions = dispatch(
            ServerMessage::Error {
                error: "room full".into(),
            },
            Some(room),
            &mut presence,
            &mut sequencer,
        )
        .unwrap();
        assert_eq!(actions.server_error.as_deref(), Some("room full"));

        let actions = dispatch(
            ServerMessage::Empty,
            Some(room),
            &mut presence,
            &mut sequencer,
        )
        .unwrap();
        assert_eq!(actions, Actions::default());
        assert!(presence.is_empty());
        assert_eq!(sequencer.sequence_num(), 0);
    }
}
