use crate::models::Target;
use std::fmt;
use thiserror::Error;

/// Stable error codes reported alongside access-control failures
pub mod codes {
    pub const ACCESS_DENIED: &str = "AUTHZ_3001";
    pub const INSUFFICIENT_PRIVILEGE: &str = "AUTHZ_3002";
    pub const INVALID_PRIVILEGE: &str = "AUTHZ_3003";
    pub const LAST_OWNER: &str = "AUTHZ_3004";
    pub const DUPLICATE_REQUEST: &str = "AUTHZ_3005";
    pub const NOT_FOUND: &str = "AUTHZ_3006";
    pub const STORAGE_FAILURE: &str = "DB_4002";
    pub const CONFIGURATION: &str = "CONFIG_5001";
    pub const INTERNAL: &str = "SYS_9001";
}

/// Why an actor was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenialReason {
    /// The acting (or receiving) user account is deactivated
    InactiveUser,
    /// The actor does not hold enough privilege over the target
    InsufficientPrivilege,
    /// The target does not allow non-owners to share it
    NotShareable,
    /// The group involved has been deactivated
    InactiveGroup,
    /// The resource is published or immutable
    ImmutableResource,
    /// The group requires an explanation with membership requests
    ExplanationRequired,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenialReason::InactiveUser => "user is not active",
            DenialReason::InsufficientPrivilege => "insufficient privilege",
            DenialReason::NotShareable => "target is not shareable",
            DenialReason::InactiveGroup => "group is not active",
            DenialReason::ImmutableResource => "resource is immutable",
            DenialReason::ExplanationRequired => "an explanation is required to join this group",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("Access denied: {0}")]
    AccessDenied(DenialReason),

    #[error("Invalid privilege: {0}")]
    InvalidPrivilege(String),

    #[error("Cannot remove the last owner of {0}")]
    LastOwner(Target),

    #[error("Duplicate membership request: {0}")]
    DuplicateRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl AccessError {
    pub fn denied(reason: DenialReason) -> Self {
        AccessError::AccessDenied(reason)
    }

    /// The denial reason, if this is an `AccessDenied`
    pub fn denial_reason(&self) -> Option<DenialReason> {
        match self {
            AccessError::AccessDenied(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AccessError::AccessDenied(DenialReason::InsufficientPrivilege) => {
                codes::INSUFFICIENT_PRIVILEGE
            }
            AccessError::AccessDenied(_) => codes::ACCESS_DENIED,
            AccessError::InvalidPrivilege(_) => codes::INVALID_PRIVILEGE,
            AccessError::LastOwner(_) => codes::LAST_OWNER,
            AccessError::DuplicateRequest(_) => codes::DUPLICATE_REQUEST,
            AccessError::NotFound(_) => codes::NOT_FOUND,
            AccessError::StorageError(_) => codes::STORAGE_FAILURE,
            AccessError::ConfigError(_) => codes::CONFIGURATION,
            AccessError::InternalError(_) => codes::INTERNAL,
        }
    }
}

impl From<sqlx::Error> for AccessError {
    fn from(err: sqlx::Error) -> Self {
        AccessError::StorageError(err.to_string())
    }
}

impl From<config::ConfigError> for AccessError {
    fn from(err: config::ConfigError) -> Self {
        AccessError::ConfigError(err.to_string())
    }
}
