//! Interpreter shell sessions for shellmux.
//!
//! A [`ShellSession`] spawns an interpreter peer, runs the session protocol
//! over a [`shellmux_mux::Multiplexer`] and tracks the peer's lifecycle. A
//! [`SessionRegistry`] holds a controller's sessions and knows which one is
//! current. [`PeerEndpoint`] is the other end of the connection, for
//! interpreters written in Rust.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shellmux_session::{ProcessSpawner, SessionConfig, SessionRegistry, SpawnSpec};
//!
//! # async fn demo() -> shellmux_session::Result<()> {
//! let (mut registry, _events) =
//!     SessionRegistry::new(Arc::new(ProcessSpawner::new()), SessionConfig::default());
//! let id = registry.create_session(SpawnSpec::new("shellmux-peer")).await?;
//! let session = registry.get(id).expect("just created");
//! let (output, outcome) = session.execute("1 + 1").await?.collect().await;
//! println!("{outcome:?}: {output:?}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod spawn;

#[cfg(test)]
mod testing;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use events::{
    OutputEvent, OutputSource, SessionEvent, SessionEventKind, SessionId, SessionStatus,
};
pub use peer::{PeerEndpoint, PeerEvent};
pub use protocol::{ControlMessage, IntrospectReply, IntrospectRequest, StatusMessage};
pub use registry::{SessionInfo, SessionRegistry};
pub use session::{Execution, ExecutionOutcome, ShellSession};
pub use spawn::{ChildProcess, ProcessHandle, ProcessSpawner, SpawnSpec, SpawnedPeer, Spawner};
