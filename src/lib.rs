//! Core of a Terraform provider that copies, inspects and deletes
//! container images through the `skopeo` binary.
//!
//! Registry credentials are produced by user-supplied login scripts and
//! can expire at any time, so every registry operation runs through
//! [`login::EndpointSession::with_login`]: try first, and on failure log
//! in under a process-wide lock and try again, with a per-endpoint retry
//! budget bounding the whole sequence.

pub mod endpoint;
pub mod error;
pub mod login;
pub mod provider;
mod providerlog;
pub mod reference;
mod script;
pub mod skopeo;


pub use error::{Error, Result};
pub use provider::{Provider, ProviderConfig};
