//! Shared types for the session workspace
//!
//! Configuration/I-O error plumbing and the `Secret` wrapper used for every
//! bearer and refresh token that crosses a crate boundary.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
