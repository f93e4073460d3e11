use std::fmt;
use serde::{Deserialize, Serialize};

/// Main error type for stablebill
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Database errors (SQLx wrapped)
    Database(sqlx::Error),

    /// HTTP/Network errors
    Network(String),

    /// Authentication errors
    Unauthorized(String),

    /// Onchain state disagrees with the request (wrong spender, revoked permission)
    Forbidden(String),

    /// Validation errors
    Validation(String),

    /// Not found errors
    NotFound(String),

    /// Duplicate registration
    Conflict(String),

    /// Payment processing errors (provider charge failures)
    Payment(String),

    /// Provider infrastructure errors (5xx, timeouts)
    Provider(String),

    /// Queue errors
    Queue(String),

    /// Webhook assembly/delivery errors
    Webhook(String),

    /// Serialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Network(msg) => write!(f, "Network error: {}", msg),
            Error::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Error::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::Payment(msg) => write!(f, "Payment error: {}", msg),
            Error::Provider(msg) => write!(f, "Provider error: {}", msg),
            Error::Queue(msg) => write!(f, "Queue error: {}", msg),
            Error::Webhook(msg) => write!(f, "Webhook error: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Database(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Network(error.to_string())
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new unauthorized error
    pub fn unauthorized<T: Into<String>>(msg: T) -> Self {
        Error::Unauthorized(msg.into())
    }

    /// Create a new forbidden error
    pub fn forbidden<T: Into<String>>(msg: T) -> Self {
        Error::Forbidden(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        Error::Conflict(msg.into())
    }

    /// Create a new payment error
    pub fn payment<T: Into<String>>(msg: T) -> Self {
        Error::Payment(msg.into())
    }

    /// Create a new provider error
    pub fn provider<T: Into<String>>(msg: T) -> Self {
        Error::Provider(msg.into())
    }

    /// Create a new queue error
    pub fn queue<T: Into<String>>(msg: T) -> Self {
        Error::Queue(msg.into())
    }

    /// Create a new webhook error
    pub fn webhook<T: Into<String>>(msg: T) -> Self {
        Error::Webhook(msg.into())
    }

    /// Create a new network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        Error::Network(msg.into())
    }
}

impl Error {
    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::Validation(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Payment(_) => 402,
            Error::Config(_) => 500,
            Error::Database(_) => 500,
            Error::Provider(_) => 502,
            Error::Queue(_) => 500,
            Error::Webhook(_) => 500,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Network(_) => 503,
            Error::Other(_) => 500,
        }
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Unauthorized(_) => "auth",
            Error::Forbidden(_) => "forbidden",
            Error::Validation(_) => "validation",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Payment(_) => "payment",
            Error::Provider(_) => "provider",
            Error::Queue(_) => "queue",
            Error::Webhook(_) => "webhook",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Network(_) => "network",
            Error::Other(_) => "other",
        }
    }

    /// Whether the underlying message may be exposed to merchants.
    ///
    /// Payment-class errors travel verbatim in HTTP responses and webhook
    /// payloads; everything else is sanitized before leaving the engine.
    pub fn is_exposable(&self) -> bool {
        matches!(
            self,
            Error::Payment(_)
                | Error::Forbidden(_)
                | Error::Validation(_)
                | Error::Conflict(_)
                | Error::NotFound(_)
        )
    }

    /// Message safe to return to a merchant
    pub fn public_message(&self) -> String {
        if self.is_exposable() {
            match self {
                Error::Payment(msg)
                | Error::Forbidden(msg)
                | Error::Validation(msg)
                | Error::Conflict(msg)
                | Error::NotFound(msg) => msg.clone(),
                _ => unreachable!(),
            }
        } else {
            "An internal error occurred".to_string()
        }
    }
}

/// Validation error struct for detailed field errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: Option<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
            code: None,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_error(self) -> Error {
        Error::Validation(serde_json::to_string(&self).unwrap_or_else(|_| "Validation failed".to_string()))
    }
}

impl Default for ValidationErrors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::conflict("subscription_exists").status_code(), 409);
        assert_eq!(Error::forbidden("subscription_not_active").status_code(), 403);
        assert_eq!(Error::payment("insufficient balance").status_code(), 402);
        assert_eq!(Error::queue("redis down").status_code(), 500);
    }

    #[test]
    fn test_public_message_sanitizes_system_errors() {
        let payment = Error::payment("ERC20: transfer amount exceeds balance");
        assert_eq!(payment.public_message(), "ERC20: transfer amount exceeds balance");

        let internal = Error::queue("connection refused to 10.0.0.5:6379");
        assert_eq!(internal.public_message(), "An internal error occurred");
        assert!(!internal.public_message().contains("10.0.0.5"));
    }
}
