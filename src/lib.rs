//! Ownership-based state sync for UI fragments embedded in a shared world.
//!
//! Every networked entity has one replicated state and at most one owner.
//! Only the owner mutates; everyone else renders a read-only replica kept
//! current by versioned updates.
//!
//! ```text
//! UiAdapter ─► NetworkedObject ─► StateStore        (local state, views)
//!                   │
//!                   └─► Session ─► OwnershipManager (who may write)
//!                          └────► SyncBridge ─► Transport (wire)
//! ```
//!
//! `Session` is the explicit per-participant context; `client::connect`
//! wires one to a session authority over a websocket.

pub mod adapter;
pub mod bridge;
pub mod client;
pub mod config;
pub mod frame;
pub mod message;
pub mod object;
pub mod ownership;
pub mod provide;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;

pub use adapter::UiAdapter;
pub use bridge::{Received, SyncBridge};
pub use config::SyncConfig;
pub use frame::{ErrorCode, Frame};
pub use message::WireMessage;
pub use object::{Capabilities, NetworkedObject};
pub use ownership::{Arbitration, Ownership, OwnershipManager};
pub use provide::Provider;
pub use session::{Fragment, MountError, Session};
pub use state::{ClaimRequest, EntityId, EntitySnapshot, INITIAL_VERSION, ParticipantId, StateUpdate, Version};
pub use store::{Payload, StateStore, StateView, SyncError};
