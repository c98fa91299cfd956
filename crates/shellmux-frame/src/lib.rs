//! Length-prefixed framing for shellmux.
//!
//! Every frame on the wire is:
//! - a 2-byte magic number ("SM") for stream synchronization
//! - a 4-byte little-endian payload length
//! - the payload
//!
//! Callers always see whole frames; partial reads are buffered here. The
//! blocking [`FrameReader`]/[`FrameWriter`] pair serves short-lived callers,
//! the async [`Transport`] (feature `async`) serves everything else.

pub mod codec;
pub mod error;
pub mod reader;
#[cfg(feature = "async")]
pub mod transport;
pub mod writer;

pub use codec::{decode_frame, encode_frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, MAGIC};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
#[cfg(feature = "async")]
pub use transport::{FrameCodec, Transport, TransportRx, TransportTx};
pub use writer::FrameWriter;
