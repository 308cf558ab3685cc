//! # tandem-collab: Real-time text synchronization
//!
//! Keeps a document identical across replicas by exchanging single-character
//! operations keyed by position identifiers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  TextChange   ┌───────────────┐   frames   ┌─────────────┐
//! │ Editor       │ ────────────► │ ClientSession │ ─────────► │ SyncClient  │
//! │ (surface)    │ ◄──────────── │ (Sequence)    │ ◄───────── │ (WebSocket) │
//! └──────────────┘ apply/mater.  └───────────────┘   events   └──────┬──────┘
//!                                                                    │
//!                                                             ┌──────┴──────┐
//!                                                             │ RelayServer │
//!                                                             │ (rooms)     │
//!                                                             └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Validated wire messages (bincode-encoded frames)
//! - [`editor`]: Editor-surface seam and an in-memory editor
//! - [`echo`]: Suppression of our own programmatic edits
//! - [`transport`]: Outbound seam and transport events
//! - [`session`]: Per-document synchronization state machine
//! - [`manager`]: Registry of shared documents
//! - [`broadcast`]: Room-based fan-out for the relay
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket client transport

pub mod protocol;
pub mod editor;
pub mod echo;
pub mod transport;
pub mod session;
pub mod manager;
pub mod broadcast;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    Available, Info, Initial, Message, MessageType, Operation, OperationKind, ProtocolError,
};
pub use editor::{DocumentId, EditorError, EditorSurface, MemorySurface, TextChange, ViewId};
pub use echo::{EchoGuard, PendingEdit};
pub use transport::{Outbound, TransportError, TransportEvent};
pub use session::{ClientSession, RemoteBuffer, Role, SessionConfig, SessionError, SessionState};
pub use manager::SessionManager;
pub use broadcast::{BroadcastGroup, BroadcastStats, PeerInfo, RelayFrame, RoomManager};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::{ClientConfig, ConnectionState, SyncClient};
