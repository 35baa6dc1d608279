//! Nostr protocol primitives: the event model, canonical identity,
//! signature verification and subscription filter matching.

pub mod codec;
pub mod filter;
pub mod nip01;
mod tag_parsing;

pub use codec::{InvalidReason, VerifyFailure, derive_id, validate_event, verify_event};
pub use filter::{Filter, FilterMatcher, matches_any};
pub use nip01::{
    Event, EventTemplate, KIND_SHORT_TEXT_NOTE, Nip01Error, UnsignedEvent, get_event_hash,
    serialize_event,
};
#[cfg(feature = "full")]
pub use nip01::{finalize_event, generate_secret_key, get_public_key, get_public_key_hex};
