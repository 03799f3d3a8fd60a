//! `SyncWire` Core -- JSON path utility, version tokens, and wire framing.
//!
//! This crate provides the foundation layer for the `SyncWire` client:
//!
//! - **Path** ([`path`]): dotted/bracket path addressing with a structural
//!   merge whose `Unchanged` outcome doubles as the change-detection signal
//! - **Version** ([`version`]): `"counter-nonce"` tokens with the total
//!   order used for last-write-wins reconciliation
//! - **Message** ([`message`]): topic/action/state enums, frame building,
//!   and multi-frame payload parsing
//! - **Typed** ([`typed`]): prefix codec for primitive wire fields

pub mod message;
pub mod path;
pub mod typed;
pub mod version;

// Message
pub use message::{
    build_message, parse_messages, Action, ConnectionState, Event, FrameError, Message, Topic,
    FIELD_SEPARATOR, MESSAGE_SEPARATOR,
};

// Path
pub use path::{get, patch, set, tokenize, Outcome, PathError, Token};

// Typed
pub use typed::{encode_typed, parse_typed, TypedError};

// Version
pub use version::{fresh_nonce, Version, VersionError};
