//! Outcome of a rate limit check.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, WardenError};

/// The verdict for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RateLimitDecision {
    /// The request may proceed
    Allowed,
    /// The identifier is blocked until `expires_at`
    Blocked {
        reason: String,
        expires_at: DateTime<Utc>,
    },
    /// The window for this identifier and action is full
    LimitExceeded,
}

impl RateLimitDecision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }

    /// Convert a rejection into the error callers surface as HTTP 429.
    pub fn into_result(self, identifier: &str, action: &str) -> Result<()> {
        match self {
            RateLimitDecision::Allowed => Ok(()),
            RateLimitDecision::Blocked { reason, expires_at } => {
                Err(WardenError::TooManyRequests(format!(
                    "{} is blocked until {}: {}",
                    identifier,
                    expires_at.to_rfc3339(),
                    reason
                )))
            }
            RateLimitDecision::LimitExceeded => Err(WardenError::TooManyRequests(format!(
                "rate limit exceeded for {} on {}",
                identifier, action
            ))),
        }
    }
}
