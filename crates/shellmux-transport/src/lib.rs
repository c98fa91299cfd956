//! Local socket transport for shellmux.
//!
//! The lowest layer of the workspace: filesystem-path Unix domain sockets for
//! controller/peer links and for the single-instance rendezvous point, plus
//! the advisory lock that arbitrates which process owns that rendezvous.
//!
//! Everything above this crate speaks in frames; this crate only moves bytes.

pub mod error;
pub mod lock;
pub mod socket;
pub mod stream;

pub use error::{Result, TransportError};
pub use lock::InstanceLock;
#[cfg(feature = "async")]
pub use socket::{connect_async, AsyncSocketListener};
pub use socket::SocketListener;
pub use stream::LocalStream;
