#![forbid(unsafe_code)]
//! blobstore-exec: the adaptive dispatcher and its host wiring.
//!
//! [`Blob`] is the container callers hold. It delegates to one backend built
//! by the [`BackendFactory`] and moves content between backends as the size
//! crosses threshold boundaries. [`runtime`] connects reclamation and usage
//! monitoring to the hosting process.

pub mod dispatcher;
pub mod factory;
pub mod runtime;

pub use blobstore_core::{Error, Result};
pub use dispatcher::{Blob, DispatchChannel};
pub use factory::BackendFactory;
pub use runtime::{install, install_with, Components, Host, PeriodicTask, ShutdownHook, ThreadHost};
