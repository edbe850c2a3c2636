//! Teams channel interface for courier.
//!
//! This crate turns inbound channel activities into workflow relays and replies:
//! - **Activities** (`activity`) - typed view over Bot Framework activities, unknown fields kept
//! - **Enrichment** (`enrich`) - thread, file and conversation metadata for the workflow payload
//! - **Messages** (`messages`) - reply builders and Adaptive Cards (feedback, account link)
//! - **Turns** (`turn`) - one message turn: relay, unwrap, reply, feedback prompt
//! - **Events** (`events`) - routes activities by type to handlers
//!
//! # Architecture
//!
//! ```text
//! Activity → EventDispatcher → TurnProcessor → WorkflowRelay
//!                                   ↓
//!                   ActivitySender ← Reply + Cards
//! ```
//!
//! # Key Types
//!
//! - `EventDispatcher` - Routes activities to the registered handler for their type
//! - `TurnProcessor` - Runs a message turn against injected collaborators
//! - `ReplyBuilder` - Constructs outgoing message activities
//! - `WorkflowRelay` / `ActivitySender` - Seams implemented by the HTTP server

pub mod activity;
pub mod enrich;
pub mod events;
pub mod messages;
pub mod turn;

pub use activity::{Activity, ActivityKind};
pub use events::{default_dispatcher, DispatchError, EventContext, EventDispatcher};
pub use turn::{
    AccountLinkProvider, ActivitySender, IdentityLookup, SendError, TurnError, TurnOutcome,
    TurnProcessor, TurnSettings, WorkflowRelay,
};
