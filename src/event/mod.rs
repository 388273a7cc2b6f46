//! # Event Delivery
//!
//! Two delivery paths leave the manager:
//!
//! - **EventBus**: broadcast of registry changes (app added/updated/removed,
//!   launch point changes, termination requests, brick mode) to any number of
//!   collaborators such as a launcher UI.
//! - **TicketRelay**: per-request status streams. A caller obtains a ticket,
//!   subscribes to it, and receives every status the executor produces for
//!   that request, ending with exactly one terminal status.
//!
//! ```text
//! ┌──────────┐ publish ┌──────────┐  broadcast  ┌────────────┐
//! │Reconciler│────────▶│ EventBus │────────────▶│Subscribers │
//! └──────────┘         └──────────┘             └────────────┘
//! ┌──────────┐  relay  ┌───────────┐ ticket + chained upstream ┌──────────┐
//! │ Executor │────────▶│TicketRelay│──────────────────────────▶│Requesters│
//! └──────────┘         └───────────┘                           └──────────┘
//! ```

pub mod event_bus;
pub mod relay;

pub use event_bus::{ErrorEvent, ErrorSeverity, Event, EventBus, EventType, StatusChange, Value};
pub use relay::{Ticket, TicketRelay, TicketStatus};
