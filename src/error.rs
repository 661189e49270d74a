//! Protocol-level rejection reasons.
//!
//! These travel inside negative replies, so they are serializable. Transport
//! and storage failures are reported through `anyhow` instead.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AndnaError {
    /// The request signature does not verify against its embedded key.
    InvalidSignature,
    /// The contacted peer is not responsible for the hash and cannot relay.
    WrongResponsibleNode,
    /// The independent counter peer refused the registration.
    CounterCheckFailed,
    /// Every queue slot for the hostname is taken.
    QueueFull,
    /// The registrant already holds the maximum number of hostnames.
    TooManyHostnames,
    /// The stored update counter is ahead of the request's.
    UpdateCounterMismatch,
    /// The minimum interval between updates has not elapsed.
    TooEarly,
    /// The hostname is unknown.
    NoSuchHostname,
    /// The request is structurally invalid.
    MalformedRequest,
    /// A peer did not answer in time.
    NetworkTimeout,
    /// Too many registrations are already being processed.
    TooManyConcurrentRegistrations,
    /// The local address is being re-negotiated.
    AddressUnstable,
}

impl AndnaError {
    /// Whether the requester should retry later rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AndnaError::NetworkTimeout
                | AndnaError::AddressUnstable
                | AndnaError::TooManyConcurrentRegistrations
        )
    }
}

impl std::fmt::Display for AndnaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "invalid signature"),
            Self::WrongResponsibleNode => write!(f, "peer is not responsible for this hostname"),
            Self::CounterCheckFailed => write!(f, "counter node rejected the registration"),
            Self::QueueFull => write!(f, "hostname queue is full"),
            Self::TooManyHostnames => write!(f, "too many hostnames registered by this key"),
            Self::UpdateCounterMismatch => write!(f, "update counter is behind the stored one"),
            Self::TooEarly => write!(f, "minimum update interval has not elapsed"),
            Self::NoSuchHostname => write!(f, "no such hostname"),
            Self::MalformedRequest => write!(f, "malformed request"),
            Self::NetworkTimeout => write!(f, "network timeout"),
            Self::TooManyConcurrentRegistrations => write!(f, "too many concurrent registrations"),
            Self::AddressUnstable => write!(f, "local address is unstable"),
        }
    }
}

impl std::error::Error for AndnaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(AndnaError::QueueFull.to_string(), "hostname queue is full");
        assert_eq!(AndnaError::TooEarly.to_string(), "minimum update interval has not elapsed");
        assert_eq!(AndnaError::NoSuchHostname.to_string(), "no such hostname");
    }

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(AndnaError::NetworkTimeout.is_retryable());
        assert!(AndnaError::AddressUnstable.is_retryable());
        assert!(!AndnaError::InvalidSignature.is_retryable());
        assert!(!AndnaError::UpdateCounterMismatch.is_retryable());
        assert!(!AndnaError::QueueFull.is_retryable());
    }
}
