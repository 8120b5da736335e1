//! Shared configuration, error and logging plumbing for the tsrelay workspace.

pub mod config;
pub mod error;
pub mod logging;

pub use config::Config;
pub use error::{Error, Result};
