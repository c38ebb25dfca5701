use crate::models::Platform;
use thiserror::Error;
use uuid::Uuid;

/// Engine-level failure taxonomy. Adapters translate platform-native errors
/// into these kinds so nothing upstream branches on marketplace strings.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no active {platform} account for this seller")]
    NoActiveAccount { platform: Platform },
    #[error("{platform} account has no refresh token; seller must reconnect")]
    NoRefreshToken { platform: Platform },
    #[error("{platform} rejected the token refresh: {detail}")]
    RefreshFailed { platform: Platform, detail: String },
    #[error("{platform} request failed: {detail}")]
    PlatformRequestFailed { platform: Platform, detail: String },
    #[error("listing data invalid: {detail}")]
    ValidationFailed { detail: String },
    #[error("sync already running for listing {listing_id}")]
    SyncInProgress { listing_id: Uuid },
    #[error("conflict cancellation failed on {platform}: {detail}")]
    ConflictUnresolved { platform: Platform, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoActiveAccount,
    NoRefreshToken,
    RefreshFailed,
    PlatformRequestFailed,
    ValidationFailed,
    SyncInProgress,
    ConflictUnresolved,
}

impl ErrorKind {
    /// Stable machine-readable code, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoActiveAccount => "no_active_account",
            ErrorKind::NoRefreshToken => "no_refresh_token",
            ErrorKind::RefreshFailed => "refresh_failed",
            ErrorKind::PlatformRequestFailed => "platform_request_failed",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::SyncInProgress => "sync_in_progress",
            ErrorKind::ConflictUnresolved => "conflict_unresolved",
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NoActiveAccount { .. } => ErrorKind::NoActiveAccount,
            SyncError::NoRefreshToken { .. } => ErrorKind::NoRefreshToken,
            SyncError::RefreshFailed { .. } => ErrorKind::RefreshFailed,
            SyncError::PlatformRequestFailed { .. } => ErrorKind::PlatformRequestFailed,
            SyncError::ValidationFailed { .. } => ErrorKind::ValidationFailed,
            SyncError::SyncInProgress { .. } => ErrorKind::SyncInProgress,
            SyncError::ConflictUnresolved { .. } => ErrorKind::ConflictUnresolved,
        }
    }

    /// Whether a later orchestration pass may succeed without seller action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PlatformRequestFailed | ErrorKind::SyncInProgress
        )
    }

    /// Short remediation hint surfaced alongside failures.
    pub fn remediation(&self) -> &'static str {
        match self.kind() {
            ErrorKind::NoActiveAccount | ErrorKind::NoRefreshToken | ErrorKind::RefreshFailed => {
                "reconnect the marketplace account"
            }
            ErrorKind::ValidationFailed => "fix the listing data and sync again",
            ErrorKind::PlatformRequestFailed | ErrorKind::SyncInProgress => "retry later",
            ErrorKind::ConflictUnresolved => "end the listing manually on the marketplace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_failures_are_retryable() {
        let err = SyncError::PlatformRequestFailed {
            platform: Platform::Ebay,
            detail: "HTTP 503".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::PlatformRequestFailed);
    }

    #[test]
    fn token_failures_are_fatal() {
        let err = SyncError::NoRefreshToken {
            platform: Platform::Mercari,
        };
        assert!(!err.is_retryable());
        assert_eq!(err.remediation(), "reconnect the marketplace account");
    }

    #[test]
    fn validation_is_never_retryable() {
        let err = SyncError::ValidationFailed {
            detail: "no photos".into(),
        };
        assert!(!err.is_retryable());
    }
}
