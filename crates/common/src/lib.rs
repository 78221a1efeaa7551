//! Shared error helpers and the process shutdown walk used across all mcphub crates.

pub mod error;
pub mod shutdown;

pub use {
    error::{Error, FromMessage, Result},
    shutdown::{Dispose, ShutdownHooks},
};
