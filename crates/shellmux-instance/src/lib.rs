//! Single-instance arbitration for shellmux.
//!
//! Every launch first runs the client: if an instance already listens at the
//! per-user rendezvous socket, the launch forwards its argv and exits.
//! Otherwise it binds a [`CommandServer`], which holds an advisory lock on
//! `<rendezvous>.lock` for as long as it lives, and becomes the instance.
//!
//! ```no_run
//! use shellmux_instance::{handle_cmd_args, CommandServer, InstanceConfig, LocalResult};
//!
//! # async fn demo() -> shellmux_instance::Result<()> {
//! let config = InstanceConfig::new("editor");
//! let argv: Vec<String> = std::env::args().skip(1).collect();
//! match handle_cmd_args(&config, &argv) {
//!     LocalResult::HandledRemotely { .. } => return Ok(()),
//!     LocalResult::BecomeServer { .. } => {
//!         let server = CommandServer::bind(config)?;
//!         server.serve(tokio_util::sync::CancellationToken::new()).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::{forward_command, handle_cmd_args, is_server_running, probe, LocalResult};
pub use config::{default_rendezvous, runtime_dir, InstanceConfig, DEFAULT_MAX_COMMAND_PAYLOAD};
pub use error::{InstanceError, Result};
pub use protocol::{ClientMessage, ForwardedCommand, Greeting};
pub use server::CommandServer;
