//! FastPIPE core library — records, wire schema, on-disk layout, registry.
//!
//! - [`types`]: `ServiceRecord`, request/response messages, `Arguments`
//! - [`error`]: [`RegistryError`], [`ArgumentError`]
//! - [`paths`]: root resolution and directory layout
//! - [`registry`]: register / unregister / resolve with liveness checks

pub mod error;
pub mod paths;
pub mod registry;
pub mod types;

pub use error::{ArgumentError, NotFoundCause, RegistryError};
pub use types::{
    current_pid, Arguments, RemoteError, RequestKind, RequestMessage, ResponseMessage,
    ResponseStatus, ServiceRecord,
};
