//! Single-instance coordination and multiplexed interpreter sessions.
//!
//! shellmux lets an editor-like process make sure only one instance runs per
//! user, forwarding later launches' command lines to it, and drive any
//! number of interpreter subprocesses over channel-multiplexed local sockets.
//!
//! # Crate Structure
//!
//! - [`transport`] — Unix sockets and the instance lock file
//! - [`frame`] — length-prefixed framing over a byte stream
//! - [`mux`] — named, typed channels over one connection
//! - [`session`] — shell sessions, the session registry and the peer endpoint
//! - [`instance`] — the single-instance command server and client
//! - [`Controller`] — the coordinator task that owns the registry
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shellmux::{Controller, DefaultArgsHandler};
//! use shellmux::session::{ProcessSpawner, SessionConfig, SpawnSpec};
//!
//! # async fn demo() -> shellmux::Result<()> {
//! let (controller, handle, _events) = Controller::new(
//!     Arc::new(ProcessSpawner::new()),
//!     SessionConfig::default(),
//!     DefaultArgsHandler,
//! );
//! tokio::spawn(controller.run(tokio_util::sync::CancellationToken::new()));
//!
//! handle.start_shell(SpawnSpec::new("shellmux-peer")).await?;
//! let (output, outcome) = handle.execute("hello").await?.collect().await;
//! println!("{outcome:?}: {output:?}");
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod echo;
pub mod error;

/// Re-export transport types.
pub mod transport {
    pub use shellmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use shellmux_frame::*;
}

/// Re-export multiplexer types.
pub mod mux {
    pub use shellmux_mux::*;
}

/// Re-export session types.
pub mod session {
    pub use shellmux_session::*;
}

/// Re-export single-instance types.
pub mod instance {
    pub use shellmux_instance::*;
}

pub use controller::{
    Action, ArgsHandler, Controller, ControllerEvent, ControllerHandle, DefaultArgsHandler,
    CONTROLLER_PID_ENV, CONTROLLER_VERSION_ENV,
};
pub use error::{Error, Result};
