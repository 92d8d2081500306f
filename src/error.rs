/*!
 * # Error Handling Module
 *
 * This module defines the error type shared by both shiplink peers.
 * It provides a unified error type that can be used throughout the
 * application, with conversions from common error types.
 */

use std::io;
use thiserror::Error;

/// Maximum accepted size of a frame header on the uplink, in bytes.
pub const MAX_HEADER_LEN: u32 = 1024 * 1024;

/// Unified error type for the shiplink application
///
/// The codec variants (`LinkClosed`, `MalformedHeader`, `OversizedHeader`)
/// are terminal for the uplink: once one of them is observed the stream can
/// no longer be trusted to be frame-aligned and must be torn down.
#[derive(Debug, Error)]
pub enum Error {
    /// IO errors from the standard library
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// The peer hung up in the middle of a frame
    #[error("link closed by peer mid-frame")]
    LinkClosed,
    /// The frame header was not a valid UTF-8 JSON object
    #[error("malformed frame header: {0}")]
    MalformedHeader(#[from] serde_json::Error),
    /// The declared frame header length exceeds [`MAX_HEADER_LEN`]
    #[error("frame header of {0} bytes exceeds the 1 MiB cap")]
    OversizedHeader(u32),
    /// The outbound HTTP request failed
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
    /// Custom error with a message string
    #[error("{0}")]
    Custom(String),
}

/// Convert from &str to our custom Error type
impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Custom(msg.to_string())
    }
}

/// Convert from String to our custom Error type
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Custom(msg)
    }
}

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;
