//! Provider error classifier
//!
//! The provider SDK does not expose structured errors, so classification
//! matches substrings of the lowercased message. The order of tests is
//! load-bearing: Terminal precedes RetryablePayment precedes
//! UpstreamTransient precedes Other. The exact substrings are frozen by the
//! fixture test below.

use serde::{Deserialize, Serialize};

/// How the engine reacts to a failed charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Subscription cannot continue; cancel it
    Terminal,
    /// Payer-side, recoverable; enter dunning
    RetryablePayment,
    /// Infrastructure; retry internally, no state change, no webhook
    UpstreamTransient,
    /// Unclassified payment failure
    Other,
}

/// Stable domain code carried in order rows and webhook payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    PermissionRevoked,
    PermissionExpired,
    InsufficientBalance,
    UpstreamServiceError,
    PaymentFailed,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::PermissionRevoked => "permission_revoked",
            FailureCode::PermissionExpired => "permission_expired",
            FailureCode::InsufficientBalance => "insufficient_balance",
            FailureCode::UpstreamServiceError => "upstream_service_error",
            FailureCode::PaymentFailed => "payment_failed",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub code: FailureCode,
}

const RETRYABLE_MARKERS: &[&str] = &[
    "erc20: transfer amount exceeds balance",
    "insufficient balance",
    "not enough",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "error code: 5",
    "timeout",
    "timed out",
    "gateway",
    "unavailable",
    "try again",
    "temporarily",
    "overload",
];

/// Classify a raw provider error message
pub fn classify(raw: &str) -> Classification {
    let message = raw.to_lowercase();

    if message.contains("revoked") {
        return Classification {
            kind: FailureKind::Terminal,
            code: FailureCode::PermissionRevoked,
        };
    }

    if message.contains("expired") {
        return Classification {
            kind: FailureKind::Terminal,
            code: FailureCode::PermissionExpired,
        };
    }

    if RETRYABLE_MARKERS.iter().any(|m| message.contains(m)) {
        return Classification {
            kind: FailureKind::RetryablePayment,
            code: FailureCode::InsufficientBalance,
        };
    }

    if TRANSIENT_MARKERS.iter().any(|m| message.contains(m)) {
        return Classification {
            kind: FailureKind::UpstreamTransient,
            code: FailureCode::UpstreamServiceError,
        };
    }

    Classification {
        kind: FailureKind::Other,
        code: FailureCode::PaymentFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Canonical fixture: every branch pinned. Editing a substring above
    // must break one of these rows.
    const FIXTURE: &[(&str, FailureKind, FailureCode)] = &[
        (
            "permission revoked",
            FailureKind::Terminal,
            FailureCode::PermissionRevoked,
        ),
        (
            "Spend permission has been REVOKED by owner",
            FailureKind::Terminal,
            FailureCode::PermissionRevoked,
        ),
        (
            "permission expired at block 1289",
            FailureKind::Terminal,
            FailureCode::PermissionExpired,
        ),
        (
            "ERC20: transfer amount exceeds balance",
            FailureKind::RetryablePayment,
            FailureCode::InsufficientBalance,
        ),
        (
            "insufficient balance for transfer",
            FailureKind::RetryablePayment,
            FailureCode::InsufficientBalance,
        ),
        (
            "not enough USDC in wallet",
            FailureKind::RetryablePayment,
            FailureCode::InsufficientBalance,
        ),
        (
            "error code: 502",
            FailureKind::UpstreamTransient,
            FailureCode::UpstreamServiceError,
        ),
        (
            "request timeout",
            FailureKind::UpstreamTransient,
            FailureCode::UpstreamServiceError,
        ),
        (
            "connection timed out after 30s",
            FailureKind::UpstreamTransient,
            FailureCode::UpstreamServiceError,
        ),
        (
            "bad gateway",
            FailureKind::UpstreamTransient,
            FailureCode::UpstreamServiceError,
        ),
        (
            "service unavailable",
            FailureKind::UpstreamTransient,
            FailureCode::UpstreamServiceError,
        ),
        (
            "please try again later",
            FailureKind::UpstreamTransient,
            FailureCode::UpstreamServiceError,
        ),
        (
            "temporarily out of capacity",
            FailureKind::UpstreamTransient,
            FailureCode::UpstreamServiceError,
        ),
        (
            "server overloaded",
            FailureKind::UpstreamTransient,
            FailureCode::UpstreamServiceError,
        ),
        (
            "execution reverted",
            FailureKind::Other,
            FailureCode::PaymentFailed,
        ),
        ("", FailureKind::Other, FailureCode::PaymentFailed),
    ];

    #[test]
    fn test_classifier_fixture() {
        for (message, kind, code) in FIXTURE {
            let result = classify(message);
            assert_eq!(result.kind, *kind, "kind mismatch for {:?}", message);
            assert_eq!(result.code, *code, "code mismatch for {:?}", message);
        }
    }

    #[test]
    fn test_terminal_wins_over_retryable() {
        // a message matching several branches takes the first
        let result = classify("permission revoked: insufficient balance");
        assert_eq!(result.kind, FailureKind::Terminal);
        assert_eq!(result.code, FailureCode::PermissionRevoked);
    }

    #[test]
    fn test_retryable_wins_over_transient() {
        let result = classify("insufficient balance, try again");
        assert_eq!(result.kind, FailureKind::RetryablePayment);
    }

    #[test]
    fn test_classification_is_case_insensitive() {
        let result = classify("INSUFFICIENT BALANCE");
        assert_eq!(result.code, FailureCode::InsufficientBalance);
    }
}
