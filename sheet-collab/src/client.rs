//! The collaboration client: one facade tying the pieces together.
//!
//! [`CollabClient`] owns the session, presence map, update batcher,
//! sequencer and connection manager. All document and presence state is
//! mutated from the caller's task; only the transport runs on spawned
//! tasks, feeding a single inbound channel. The host drives three loops:
//!
//! - [`CollabClient::process_next`] — consume one inbound item,
//! - [`CollabClient::update`] — fast tick, flushes coalesced presence,
//! - [`CollabClient::heartbeat`] — slow tick, sends liveness when quiet.
//!
//! State changes surface as [`CollabEvent`]s on an unbounded channel;
//! the UI layer renders from events plus read-only snapshots.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, Connector, Inbound, TokenProvider, WsConnector};
use crate::dispatch::dispatch;
use crate::error::CollabError;
use crate::outbound::UpdateBatcher;
use crate::presence::{Participant, PresenceMap};
use crate::protocol::{CellEdit, ClientMessage, Selection, SheetPos, UserIdentity};
use crate::sequencer::{DocumentEngine, TransactionSequencer};
use crate::session::RoomSession;

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    Connected { reconnected: bool },
    Disconnected,
    /// Join acknowledged; `sequence_num` is the server's current position.
    RoomJoined { file_id: Uuid, sequence_num: u64 },
    /// The participant set changed (any join or leave).
    RosterChanged,
    ParticipantJoined { session_id: Uuid },
    ParticipantLeft { session_id: Uuid },
    MouseMoved { session_id: Uuid, sheet_id: Uuid },
    SheetChanged { session_id: Uuid },
    SelectionChanged { session_id: Uuid },
    CellEditChanged { session_id: Uuid },
    ViewportChanged { session_id: Uuid },
    CodeRunningChanged { session_id: Uuid },
    /// The document advanced to this sequence number.
    TransactionApplied { sequence_num: u64 },
    /// In-band error reported by the server.
    ServerError { message: String },
}

pub struct CollabClient<E: DocumentEngine> {
    session: RoomSession,
    presence: PresenceMap,
    batcher: UpdateBatcher,
    sequencer: TransactionSequencer<E>,
    connection: ConnectionManager,
    inbound: mpsc::Receiver<Inbound>,
    events: UnboundedSender<CollabEvent>,
    event_rx: Option<UnboundedReceiver<CollabEvent>>,
}

impl<E: DocumentEngine> CollabClient<E> {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        token_provider: Option<Arc<dyn TokenProvider>>,
        engine: E,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let session = RoomSession::new();
        let presence = PresenceMap::new(session.session_id(), config.palette_size, events.clone());
        let provider = if config.anonymous { None } else { token_provider };
        let (connection, inbound) =
            ConnectionManager::new(connector, provider, config.reconnect_delay);
        Self {
            presence,
            batcher: UpdateBatcher::new(config.update_interval, config.heartbeat_interval),
            sequencer: TransactionSequencer::new(engine, config.backfill_retry),
            session,
            connection,
            inbound,
            events,
            event_rx: Some(event_rx),
        }
    }

    /// Convenience constructor wiring a [`WsConnector`] from the
    /// configured server URL.
    pub fn connect_ws(
        config: ClientConfig,
        token_provider: Option<Arc<dyn TokenProvider>>,
        engine: E,
    ) -> Self {
        let connector = Arc::new(WsConnector::new(config.server_url.clone()));
        Self::new(config, connector, token_provider, engine)
    }

    /// The event stream. Callable once; the stream lives as long as the
    /// client.
    pub fn take_event_rx(&mut self) -> Option<UnboundedReceiver<CollabEvent>> {
        self.event_rx.take()
    }

    pub fn session_id(&self) -> Uuid {
        self.session.session_id()
    }

    pub fn room(&self) -> Option<Uuid> {
        self.session.room()
    }

    pub fn sequence_num(&self) -> u64 {
        self.sequencer.sequence_num()
    }

    pub fn engine(&self) -> &E {
        self.sequencer.engine()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.presence.participants()
    }

    pub fn participant(&self, session_id: &Uuid) -> Option<&Participant> {
        self.presence.get(session_id)
    }

    /// Whether any remote participant is actively editing the given cell.
    pub fn cell_is_being_edited(&self, x: i64, y: i64, sheet_id: Uuid) -> bool {
        self.presence.cell_is_being_edited(x, y, sheet_id)
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    pub async fn connection_state(&self) -> crate::connection::ConnectionState {
        self.connection.state().await
    }

    // ── room membership ────────────────────────────────────────────

    /// Join a room, connecting first if necessary. The join handshake is
    /// registered for transparent re-issue on every reconnect. Joining
    /// the already-joined room is a no-op.
    pub async fn enter_room(
        &mut self,
        file_id: Uuid,
        identity: UserIdentity,
        sheet_id: Uuid,
    ) -> Result<(), CollabError> {
        if !self.session.join(file_id, identity, sheet_id)? {
            return Ok(());
        }
        self.presence.clear();
        // Transactions queued for a previous room must not replay here.
        self.connection.clear_replay().await;

        let handshake = self.session.build_enter_room()?.encode()?;
        self.connection.set_rejoin(Some(handshake.clone())).await;

        if self.connection.is_connected().await {
            self.connection.send(handshake).await?;
        } else {
            // Connecting sends the registered handshake before resolving.
            self.connection.ensure_connected().await;
        }
        self.batcher.mark_sent(Instant::now());
        Ok(())
    }

    /// Leave the current room. Presence, pending updates and the replay
    /// queue are dropped; applied document state stays. A no-op when not
    /// in a room.
    pub async fn leave_room(&mut self) -> Result<(), CollabError> {
        let Some(notice) = self.session.leave() else {
            return Ok(());
        };
        self.connection.set_rejoin(None).await;
        self.connection.clear_replay().await;
        self.presence.clear();
        self.batcher.queue().clear();

        match self.connection.send(notice.encode()?).await {
            Ok(()) => {
                self.batcher.mark_sent(Instant::now());
                Ok(())
            }
            // Already offline; the server will expire the session.
            Err(CollabError::NotConnected) | Err(CollabError::TransportClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── local presence ─────────────────────────────────────────────
    //
    // Setters only stage a delta; nothing hits the wire until the next
    // `update` tick. Fields that survive a reconnect also update the
    // session snapshot so the rejoin handshake carries them.

    pub fn set_mouse(&mut self, x: f64, y: f64) {
        self.batcher.queue().set_mouse(x, y);
    }

    pub fn hide_mouse(&mut self) {
        self.batcher.queue().clear_mouse();
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.session.local_mut().selection = Some(selection);
        self.batcher.queue().set_selection(selection);
    }

    pub fn set_sheet(&mut self, sheet_id: Uuid) {
        self.session.local_mut().sheet_id = sheet_id;
        self.batcher.queue().set_sheet(sheet_id);
    }

    pub fn set_cell_edit(&mut self, cell_edit: CellEdit) {
        self.session.local_mut().cell_edit = cell_edit.clone();
        self.batcher.queue().set_cell_edit(cell_edit);
    }

    /// End a live cell edit; the inactive state is still transmitted so
    /// remote editing indicators clear.
    pub fn end_cell_edit(&mut self) {
        self.session.local_mut().cell_edit = CellEdit::default();
        self.batcher.queue().clear_cell_edit();
    }

    pub fn set_viewport(&mut self, viewport: String) {
        self.session.local_mut().viewport = viewport.clone();
        self.batcher.queue().set_viewport(viewport);
    }

    pub fn set_code_running(&mut self, cells: Vec<SheetPos>) {
        self.session.local_mut().code_running = cells.clone();
        self.batcher.queue().set_code_running(cells);
    }

    // ── ticks ──────────────────────────────────────────────────────

    /// Fast tick: flush the coalesced presence delta if the rate limit
    /// allows. While offline or out of a room, deltas keep merging
    /// locally and nothing is sent.
    pub async fn update(&mut self) -> Result<(), CollabError> {
        let Some(file_id) = self.session.room() else {
            return Ok(());
        };
        if !self.connection.is_connected().await {
            return Ok(());
        }
        if let Some(update) = self.batcher.tick(Instant::now()) {
            let msg = ClientMessage::UserUpdate {
                session_id: self.session.session_id(),
                file_id,
                update,
            };
            self.connection.send(msg.encode()?).await?;
        }
        Ok(())
    }

    /// Slow tick: send an explicit heartbeat when nothing else has gone
    /// out for a full heartbeat interval.
    pub async fn heartbeat(&mut self) -> Result<(), CollabError> {
        let Some(file_id) = self.session.room() else {
            return Ok(());
        };
        if !self.connection.is_connected().await {
            return Ok(());
        }
        let now = Instant::now();
        if !self.batcher.heartbeat_due(now) {
            return Ok(());
        }
        let msg = ClientMessage::Heartbeat {
            session_id: self.session.session_id(),
            file_id,
        };
        self.connection.send(msg.encode()?).await?;
        self.batcher.mark_sent(now);
        Ok(())
    }

    // ── transactions ───────────────────────────────────────────────

    /// Submit a locally-produced operation batch: applied optimistically,
    /// queued for replay until the server's echo acknowledges it, and
    /// sent immediately when connected. Returns the transaction id.
    pub async fn submit_transaction(&mut self, operations: Vec<u8>) -> Result<Uuid, CollabError> {
        let file_id = self.session.room().ok_or(CollabError::NotInRoom)?;
        let id = self.sequencer.submit(&operations)?;
        let msg = ClientMessage::Transaction {
            id,
            session_id: self.session.session_id(),
            file_id,
            operations,
        };
        let frame = msg.encode()?;
        self.connection.push_replay(id, frame.clone()).await;

        match self.connection.send(frame).await {
            Ok(()) => self.batcher.mark_sent(Instant::now()),
            Err(CollabError::NotConnected) | Err(CollabError::TransportClosed) => {
                // Offline: the replay queue delivers it on reconnect.
                log::debug!("transaction {id} queued while offline");
            }
            Err(e) => return Err(e),
        }
        Ok(id)
    }

    // ── inbound processing ─────────────────────────────────────────

    /// Consume one inbound item, blocking until one arrives. Returns
    /// `false` once the inbound channel closes (client shutdown).
    ///
    /// Malformed frames and frames addressing the wrong room are logged
    /// and dropped individually; the connection stays up. Engine
    /// rejections propagate — they mean local state has diverged.
    pub async fn process_next(&mut self) -> Result<bool, CollabError> {
        let Some(item) = self.inbound.recv().await else {
            return Ok(false);
        };
        match item {
            Inbound::Connected { reconnected } => {
                // The connection layer already re-sent the join handshake
                // and replayed unacknowledged transactions.
                self.batcher.mark_sent(Instant::now());
                let _ = self.events.send(CollabEvent::Connected { reconnected });
            }
            Inbound::Disconnected => {
                let _ = self.events.send(CollabEvent::Disconnected);
            }
            Inbound::Frame(bytes) => self.handle_frame(&bytes).await?,
        }
        Ok(true)
    }

    async fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), CollabError> {
        let msg = match crate::protocol::ServerMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("dropping undecodable frame: {e}");
                return Ok(());
            }
        };

        let actions = match dispatch(
            msg,
            self.session.room(),
            &mut self.presence,
            &mut self.sequencer,
        ) {
            Ok(actions) => actions,
            Err(CollabError::RoomMismatch { joined, received }) => {
                log::warn!("dropping message for room {received} while joined to {joined}");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.connection.retain_replay(self.sequencer.unacked()).await;

        if let Some(sequence_num) = actions.joined {
            if let Some(file_id) = self.session.room() {
                let _ = self.events.send(CollabEvent::RoomJoined {
                    file_id,
                    sequence_num,
                });
            }
        }
        if let Some(sequence_num) = actions.applied {
            let _ = self
                .events
                .send(CollabEvent::TransactionApplied { sequence_num });
        }
        if let Some(message) = actions.server_error {
            let _ = self.events.send(CollabEvent::ServerError { message });
        }
        if let Some(min_sequence_num) = actions.request_backfill {
            self.request_backfill(min_sequence_num).await?;
        }
        Ok(())
    }

    async fn request_backfill(&mut self, min_sequence_num: u64) -> Result<(), CollabError> {
        let Some(file_id) = self.session.room() else {
            return Ok(());
        };
        log::info!("requesting transactions from sequence {min_sequence_num}");
        let msg = ClientMessage::GetTransactions {
            session_id: self.session.session_id(),
            file_id,
            min_sequence_num,
        };
        match self.connection.send(msg.encode()?).await {
            Ok(()) => {
                self.batcher.mark_sent(Instant::now());
                Ok(())
            }
            // The reconnect handshake re-announces the sequence number,
            // which re-triggers the request.
            Err(CollabError::NotConnected) | Err(CollabError::TransportClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
