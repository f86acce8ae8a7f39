//! Error types for the exit probe
//!
//! This module provides the error taxonomy with:
//! - Detailed error variants for each failure mode
//! - Classification into the recovery classes the probe acts on
//! - Error codes for programmatic handling
//! - User-friendly messages

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Circuit errors (1xx)
    CircuitLaunchRejected = 100,
    CircuitBuildFailed = 101,
    NoRelaysAvailable = 102,
    RetriesExhausted = 103,

    // Connection errors (2xx)
    ConnectionFailed = 200,
    NetworkError = 201,
    HttpError = 202,
    ResponseTooLarge = 203,

    // Binding errors (3xx)
    PortAlreadyBound = 300,
    BindingLost = 301,

    // Configuration errors (4xx)
    ConfigError = 400,
    InvalidRelay = 401,
    InvalidUrl = 402,
    ParseError = 403,

    // Storage errors (5xx)
    StorageError = 500,
}

/// Which recovery path an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Circuit submission or build failure, absorbed by the allocator
    AllocationTransient,
    /// Transport connect or fetch failure, absorbed by the fetch task
    ConnectionTransient,
    /// Stream binding did not match (or never resolved)
    BindingInconsistency,
    /// Anything a retry cannot fix
    Fatal,
}

/// Main error type for the probe
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    // ===== Circuit Errors =====
    #[error("Circuit launch rejected: {0}")]
    CircuitLaunchRejected(String),

    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("No relays available: {0}")]
    NoRelaysAvailable(String),

    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Response exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },

    // ===== Binding Errors =====
    #[error("Local port {0} already has a pending binding")]
    PortAlreadyBound(u16),

    #[error("Binding for local port {0} was dropped before a stream arrived")]
    BindingLost(u16),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid relay: {0}")]
    InvalidRelay(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),
}

impl ProbeError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            ProbeError::CircuitLaunchRejected(_) => ErrorCode::CircuitLaunchRejected,
            ProbeError::CircuitBuildFailed(_) => ErrorCode::CircuitBuildFailed,
            ProbeError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,
            ProbeError::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,

            ProbeError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            ProbeError::Network(_) => ErrorCode::NetworkError,
            ProbeError::Http(_) => ErrorCode::HttpError,
            ProbeError::ResponseTooLarge { .. } => ErrorCode::ResponseTooLarge,

            ProbeError::PortAlreadyBound(_) => ErrorCode::PortAlreadyBound,
            ProbeError::BindingLost(_) => ErrorCode::BindingLost,

            ProbeError::Config(_) => ErrorCode::ConfigError,
            ProbeError::InvalidRelay(_) => ErrorCode::InvalidRelay,
            ProbeError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            ProbeError::ParseError(_) => ErrorCode::ParseError,

            ProbeError::Storage(_) => ErrorCode::StorageError,
        }
    }

    /// Recovery class of this error
    pub fn class(&self) -> FailureClass {
        match self {
            ProbeError::CircuitLaunchRejected(_)
            | ProbeError::CircuitBuildFailed(_)
            | ProbeError::NoRelaysAvailable(_) => FailureClass::AllocationTransient,

            ProbeError::ConnectionFailed(_)
            | ProbeError::Network(_)
            | ProbeError::Http(_)
            | ProbeError::ResponseTooLarge { .. } => FailureClass::ConnectionTransient,

            ProbeError::PortAlreadyBound(_) | ProbeError::BindingLost(_) => {
                FailureClass::BindingInconsistency
            }

            ProbeError::RetriesExhausted { .. }
            | ProbeError::Config(_)
            | ProbeError::InvalidRelay(_)
            | ProbeError::InvalidUrl(_)
            | ProbeError::ParseError(_)
            | ProbeError::Storage(_) => FailureClass::Fatal,
        }
    }

    /// Whether a fetch task may restart from allocation after this error
    ///
    /// Binding errors count as retryable: the attempt is abandoned and a fresh
    /// circuit and port are used on the next pass.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.class(), FailureClass::Fatal)
    }

    /// Get a user-friendly message for display
    pub fn user_message(&self) -> String {
        match self {
            ProbeError::CircuitLaunchRejected(_) | ProbeError::CircuitBuildFailed(_) => {
                "Tor could not build a circuit through the chosen relays. Retrying with a new path."
                    .into()
            }
            ProbeError::NoRelaysAvailable(_) => {
                "No relay fits the path constraints right now. Waiting for pending circuits."
                    .into()
            }
            ProbeError::RetriesExhausted { operation, attempts } => {
                format!("{} failed {} times in a row and was abandoned.", operation, attempts)
            }
            ProbeError::ConnectionFailed(_) | ProbeError::Network(_) => {
                "Could not reach the target through Tor. Retrying on a fresh circuit.".into()
            }
            ProbeError::Http(_) | ProbeError::ResponseTooLarge { .. } => {
                "The target returned an unusable response. Retrying on a fresh circuit.".into()
            }
            ProbeError::PortAlreadyBound(port) => format!(
                "Local port {} is still waiting for its stream. The attempt will be restarted.",
                port
            ),
            ProbeError::BindingLost(_) => {
                "Tor never reported the stream for this connection. The attempt will be restarted."
                    .into()
            }
            ProbeError::Config(_) => "The probe configuration is invalid.".into(),
            ProbeError::InvalidRelay(_) => "The relay directory contains an invalid entry.".into(),
            ProbeError::InvalidUrl(_) => {
                "Invalid target URL. Use an http:// or https:// URL.".into()
            }
            ProbeError::ParseError(_) => "Failed to parse input data.".into(),
            ProbeError::Storage(_) => "Failed to write the results file.".into(),
        }
    }
}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ProbeError {
    fn from(err: serde_json::Error) -> Self {
        ProbeError::ParseError(err.to_string())
    }
}
