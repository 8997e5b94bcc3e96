//! Error types for allocation operations.
//!
//! Errors are categorized so callers can tell apart what should be polled
//! again (transient provider state), what should be retried as a whole
//! (device conflicts), and what will never succeed (validation).

use thiserror::Error;

/// Categories of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Provider timeout, lock held, guest agent not ready
    Transient,
    /// Malformed input (size strings, tags, unknown device paths)
    Validation,
    /// Not enough free PCI devices on the host
    ResourceExhausted,
    /// Provider reported a device already claimed by another VM
    Conflict,
    /// Referenced VM, descriptor or profile does not exist
    NotFound,
    /// Login rejected or ticket expired
    Auth,
    /// Other/unknown errors
    Other,
}

impl ErrorCategory {
    /// Whether re-running the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Conflict)
    }

    /// Whether a poll loop should keep observing after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "Provider not ready",
            Self::Validation => "Invalid input",
            Self::ResourceExhausted => "Not enough free devices",
            Self::Conflict => "Device conflict",
            Self::NotFound => "Not found",
            Self::Auth => "Authentication failed",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Transient => "Wait for the cluster to settle and try again",
            Self::Validation => "Fix the descriptor or machine type definition",
            Self::ResourceExhausted => "Free devices by deleting allocations on this host",
            Self::Conflict => "Another allocation claimed the device first; re-run create",
            Self::NotFound => "Check the name or id against the cluster",
            Self::Auth => "Check the username and password in the config file",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors that can occur while allocating or tearing down VMs.
#[derive(Debug, Error)]
pub enum Error {
    /// Provider is temporarily unable to answer (timeout, lock, agent down)
    #[error("provider not ready: {message}")]
    Transient {
        /// Message reported by the provider or transport
        message: String,
    },

    /// Human-readable size string did not match `<digits><UNIT>`
    #[error("invalid size string: {input:?}")]
    InvalidSize {
        /// The rejected input
        input: String,
    },

    /// Tag key or value cannot be represented in the tag string
    #[error("invalid tag: {message}")]
    InvalidTag {
        /// What was wrong with the tag
        message: String,
    },

    /// Any other input rejected before touching the provider
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the problem
        message: String,
    },

    /// Fewer free devices than requested
    #[error(
        "not enough unattached {class} devices on {host}: have {available}, require {requested}"
    )]
    ResourceExhausted {
        /// Host that was scanned
        host: String,
        /// Device class requested
        class: String,
        /// Number of devices requested
        requested: usize,
        /// Number of free devices found
        available: usize,
    },

    /// Provider refused to attach a device that is already in use
    #[error("conflict: {message}")]
    Conflict {
        /// Provider message naming the device and owner
        message: String,
    },

    /// Referenced entity does not exist
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Authentication with the provider failed
    #[error("authentication failed: {message}")]
    Auth {
        /// Provider message
        message: String,
    },

    /// Provider returned an error we could not classify
    #[error("provider error{}: {message}", status_suffix(.status))]
    Provider {
        /// HTTP status, when the transport has one
        status: Option<u16>,
        /// Provider message
        message: String,
    },

    /// Remote file upload/removal failed
    #[error("file transfer to {host}:{path} failed: {message}")]
    Transfer {
        /// Target host
        host: String,
        /// Remote path
        path: String,
        /// stderr of the transfer command
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Catalog TOML parsing error
    #[error("catalog error: {0}")]
    Catalog(#[from] toml::de::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Transient { .. } => ErrorCategory::Transient,
            Error::InvalidSize { .. } | Error::InvalidTag { .. } | Error::Validation { .. } => {
                ErrorCategory::Validation
            }
            Error::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
            Error::Conflict { .. } => ErrorCategory::Conflict,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Auth { .. } => ErrorCategory::Auth,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether re-running the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Whether a poll loop should keep observing after this error.
    pub fn is_transient(&self) -> bool {
        self.category().is_transient()
    }

    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Create an error from a provider failure.
    ///
    /// Analyzes the message to categorize the error appropriately.
    pub fn from_provider_message(status: Option<u16>, message: &str) -> Self {
        let lower = message.to_lowercase();
        let message = message.trim().to_string();

        if lower.contains("already in use") {
            return Error::Conflict { message };
        }

        if lower.contains("timeout")
            || lower.contains("timed out")
            || lower.contains("can't lock")
            || lower.contains("locked")
            || lower.contains("is not running")
            || lower.contains("no qemu guest agent configured")
            || lower.contains("guest agent is not running")
            || lower.contains("not ready")
        {
            return Error::Transient { message };
        }

        match status {
            Some(401 | 403) => return Error::Auth { message },
            Some(404) => return Error::NotFound { what: message },
            _ => {}
        }

        if lower.contains("does not exist") || lower.contains("no such") {
            return Error::NotFound { what: message };
        }

        Error::Provider { status, message }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => {
                Self::from_provider_message(Some(code), &format!("HTTP {code}"))
            }
            ureq::Error::Timeout(_) | ureq::Error::Io(_) | ureq::Error::ConnectionFailed => {
                Self::Transient {
                    message: err.to_string(),
                }
            }
            other => Self::Provider {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Result type for allocation operations.
pub type Result<T> = std::result::Result<T, Error>;
