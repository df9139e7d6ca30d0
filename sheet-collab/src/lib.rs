//! # sheet-collab — Multiplayer synchronization client for spreadsheets
//!
//! Keeps a local spreadsheet document and its UI in sync with a central
//! multiplayer server: connection lifecycle, room membership, presence
//! propagation and totally-ordered transaction sync with catch-up.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ticks/events   ┌──────────────────────────────┐
//! │  Host (UI +  │ ◄──────────────► │         CollabClient         │
//! │  doc engine) │                  │ session · presence · batcher │
//! └──────────────┘                  │ sequencer · dispatch         │
//!                                   └──────────────┬───────────────┘
//!                                                  │ frames
//!                                   ┌──────────────┴───────────────┐
//!                                   │      ConnectionManager       │
//!                                   │ rejoin · replay · reconnect  │
//!                                   └──────────────┬───────────────┘
//!                                                  │ WebSocket
//!                                                  ▼
//!                                          multiplayer server
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded envelopes)
//! - [`connection`] — Transport lifecycle, auth, fixed-delay reconnect
//! - [`session`] — Room membership and the local presence snapshot
//! - [`presence`] — Remote participant table and change events
//! - [`outbound`] — Presence coalescing and heartbeat scheduling
//! - [`sequencer`] — Transaction ordering, gap buffering, backfill
//! - [`dispatch`] — Inbound message routing
//! - [`client`] — The facade tying everything together

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod outbound;
pub mod presence;
pub mod protocol;
pub mod sequencer;
pub mod session;

// Re-exports for convenience
pub use client::{CollabClient, CollabEvent};
pub use config::ClientConfig;
pub use connection::{
    ConnectionManager, ConnectionState, Connector, Inbound, TokenProvider, TransportChannel,
    WsConnector,
};
pub use dispatch::{dispatch, Actions};
pub use error::CollabError;
pub use outbound::{UpdateBatcher, UpdateQueue};
pub use presence::{Participant, PresenceMap};
pub use protocol::{
    CellEdit, CellRange, CellRef, ClientMessage, MouseUpdate, PresenceUpdate, RoomUser, Selection,
    SequencedTransaction, ServerMessage, SheetPos, UserIdentity,
};
pub use sequencer::{DocumentEngine, Outcome, TransactionSequencer};
pub use session::{LocalPresence, RoomSession};
