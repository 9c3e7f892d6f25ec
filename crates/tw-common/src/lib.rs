//! # tw-common
//!
//! Shared configuration and error types for taskwatch.

pub mod config;
pub mod error;

pub use config::AppConfig;
pub use error::{ClientError, ClientResult, FetchError, TransportError};
