//! Error types for pack
//!
//! All modules use `PackResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pack operations
pub type PackResult<T> = Result<T, PackError>;

/// Exit code used when the invocation was interrupted
pub const EXIT_CANCELED: u8 = 130;

/// All errors that can occur in pack
#[derive(Error, Debug)]
pub enum PackError {
    // Configuration errors
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid configuration at {path}: {reason}")]
    ConfigFile { path: PathBuf, reason: String },

    #[error("no builder given and no default builder configured")]
    NoDefaultBuilder,

    #[error("stack mismatch: expected '{expected}', got '{actual}'")]
    StackMismatch { expected: String, actual: String },

    // Distribution errors
    #[error("invalid buildpack: {0}")]
    InvalidBuildpack(String),

    #[error("{0}")]
    InvalidLifecycle(String),

    // Build errors
    #[error("{phase} phase failed with status code {code}")]
    PhaseFailed { phase: String, code: i64 },

    #[error("operation canceled")]
    Canceled,

    // Lookup errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("image '{0}' does not exist on the daemon")]
    ImageNotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("container engine not found: {0}")]
    EngineNotFound(String),

    // Archive errors
    #[error("could not find entry {candidates} in {archive}")]
    EntryNotFound { archive: PathBuf, candidates: String },

    #[error("unsupported tar entry '{path}' of type {kind}")]
    BadTarEntry { path: String, kind: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("download failed: {uri}: {reason}")]
    Download { uri: String, reason: String },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl PackError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a stack mismatch error
    pub fn stack_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::StackMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Canceled => EXIT_CANCELED,
            _ => 1,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::EngineNotFound(_) => {
                Some("Install docker or podman, or set `engine` in the pack config")
            }
            Self::StackMismatch { .. } => {
                Some("Build and run images must carry the same io.buildpacks.stack.id label")
            }
            Self::NoDefaultBuilder => Some(
                "Pass --builder, or run `pack set-default-builder <image>` (see `pack suggest-builders`)",
            ),
            Self::ImageNotFound(_) => Some("Pull the image first or drop --no-pull"),
            Self::Unauthorized(_) => Some("Run: docker login <registry>"),
            _ => None,
        }
    }
}
