//! Core types, collaborator contracts, and configuration shared by every
//! Flowrule crate.
//!
//! The engine treats entity storage, comments, identity, and the event bus as
//! external collaborators. Their contracts live in [`traits`]; in-process
//! implementations used by the server binary and the test suites live in
//! [`memory`].

pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod traits;
pub mod types;

pub use config::*;
pub use error::*;
pub use types::*;

pub use events::{EntityEvent, EventKind, EventOrigin, PropertyChange};
pub use traits::{CommentService, EntityStore, EventPublisher, IdentityService};
