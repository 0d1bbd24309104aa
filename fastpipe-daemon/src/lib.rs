//! Filesystem-mediated RPC runtime: mailbox protocol, dispatch server,
//! client proxy and background daemons.

pub mod client;
pub mod endpoint;
mod error;
pub mod lifecycle;
pub mod logging;
pub mod mailbox;
pub mod server;
mod watch;

pub use client::{ClientOptions, ServiceClient};
pub use endpoint::{EndpointError, Factory, FactoryKind, Handler};
pub use error::{FastpipeError, RemoteExecutionError};
pub use lifecycle::{DaemonHandle, DaemonManager, DaemonOptions, DaemonState};
pub use logging::init_tracing;
pub use mailbox::{check_message_id, new_message_id, Mailbox};
pub use server::{ServerOptions, ServiceServer};
