//! Canonical change-event envelope.
//!
//! Every external change feed (business CDC connectors, generic event feeds)
//! is normalized into a [`ChangeEvent`] before it reaches a stream processor.
//!
//! # Module Structure
//!
//! - [`types`]: envelope, feed identifiers, change kinds
//! - [`token`]: resumable, ordered sequence tokens
//! - [`payload`]: typed entity payloads with an opaque fallback

pub mod payload;
pub mod token;
pub mod types;

pub use payload::{CallRecord, ChatMessage, DealRecord, EntityPayload};
pub use token::SequenceToken;
pub use types::{ChangeEvent, ChangeKind, FeedId};
