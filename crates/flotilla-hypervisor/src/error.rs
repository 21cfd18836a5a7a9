// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the flotilla hypervisor agent.

use thiserror::Error;

use crate::bus::BusError;
use crate::driver::DriverError;
use crate::worker::MigrationState;

/// Hypervisor errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested display name is already used by a registered VM.
    #[error("Name conflict: a virtual machine named {0:?} already exists")]
    NameConflict(String),

    /// The VM is migrating and cannot be freed through the normal path.
    #[error("Virtual machine {identity} is in use ({state})")]
    InUse {
        /// Identity of the VM.
        identity: String,
        /// Migration state that blocked the operation.
        state: MigrationState,
    },

    /// The VM's domain is not in a state that allows the operation.
    #[error("Invalid state for {identity}: {reason}")]
    InvalidState {
        /// Identity of the VM.
        identity: String,
        /// Why the operation was rejected.
        reason: String,
    },

    /// Identifier does not resolve to a registered VM.
    #[error("Virtual machine not found: {0}")]
    NotFound(String),

    /// Caller lacks the required grant.
    #[error("Permission denied: {user} lacks {permission:?}")]
    PermissionDenied {
        /// Caller identity.
        user: String,
        /// Permission that was checked.
        permission: String,
    },

    /// The virtualization driver reported a failure.
    #[error("Virtualization error: {0}")]
    Virtualization(#[from] DriverError),

    /// The messaging substrate reported a failure.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A domain descriptor is missing or carries malformed metadata.
    #[error("Invalid domain metadata: {0}")]
    InvalidMetadata(String),

    /// A callback was registered on a hook point that does not exist.
    #[error("Unknown hook point: {0}")]
    UnknownHook(String),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Anything else.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::NameConflict(_) => "NAME_CONFLICT",
            Error::InUse { .. } => "IN_USE",
            Error::InvalidState { .. } => "INVALID_STATE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::PermissionDenied { .. } => "PERMISSION_DENIED",
            Error::Virtualization(_) => "VIRTUALIZATION_ERROR",
            Error::Bus(_) => "BUS_ERROR",
            Error::Database(_) | Error::Migrate(_) => "DATABASE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::InvalidMetadata(_) => "INVALID_METADATA",
            Error::UnknownHook(_) => "UNKNOWN_HOOK",
            Error::InvalidRequest(_) => "INVALID_REQUEST",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type using the hypervisor Error.
pub type Result<T> = std::result::Result<T, Error>;
