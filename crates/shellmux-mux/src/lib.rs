//! Channel multiplexing for shellmux.
//!
//! A [`Multiplexer`] owns one framed connection to one peer and carries any
//! number of named channels over it. Each channel has a direction
//! ([`ChannelMode`]) and a [`Capacity`]; every message is tagged with its
//! channel name and a per-channel sequence number.
//!
//! ```text
//! frame payload:
//! ┌──────┬──────────┬─────────────┬──────────┬──────┬─────────┐
//! │ kind │ seq      │ reply_to    │ name_len │ name │ payload │
//! │ u8   │ u64 LE   │ u64 LE (0)  │ u16 LE   │      │         │
//! └──────┴──────────┴─────────────┴──────────┴──────┴─────────┘
//! ```
//!
//! Inbound messages are rejected if their sequence number does not increase;
//! gaps are logged and accepted.
//!
//! Bounded channels are credit based. Each message the publisher sends spends
//! one of its `n` credits; the receiver hands the credit back in a `Credit`
//! message once the consumer has taken the message out of its buffer. A peer
//! that sends past its credits is disconnected.

pub mod channel;
pub mod error;
pub mod message;
pub mod mux;

pub use channel::{Capacity, Channel, ChannelMode, Subscription};
pub use error::{MuxError, Result};
pub use message::{Message, MessageKind, ENVELOPE_HEADER_SIZE, MAX_CHANNEL_NAME_LEN};
pub use mux::{MuxConfig, Multiplexer};
