//! teleconsole-core: Shared library for the teleconsole data plane.
//!
//! This crate provides:
//! - Identity model and credential handling
//! - Session descriptor wire forms
//! - Geo endpoint selection
//! - Forwarded-port specification parsing
//! - Logging and error types

pub mod constants;
pub mod error;
pub mod forward;
pub mod geo;
pub mod identity;
pub mod logging;
pub mod net;
pub mod session;

pub use error::{Error, Result};
pub use logging::init_logging;
