//! chatrelay - Rate-limited streaming chat proxy
//!
//! This library provides the core functionality for the chatrelay proxy:
//! configuration, admission control, the upstream client with retry, and
//! streaming response translation.

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{Error, Result};
