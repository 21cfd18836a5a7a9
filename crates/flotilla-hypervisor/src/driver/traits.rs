// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtualization driver trait definitions.
//!
//! Defines the contract the hypervisor needs from the virtualization layer:
//! domain lifecycle primitives, descriptor access, and a lifecycle event
//! stream.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from driver operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DriverError {
    /// The virtualization layer reported an error with its own code.
    #[error("[{code}] {message}")]
    Virt {
        /// Driver-specific error code.
        code: i32,
        /// Driver message.
        message: String,
    },

    /// No domain with this name or uuid.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// The driver cannot deliver lifecycle events.
    #[error("Lifecycle events unsupported: {0}")]
    EventsUnsupported(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Code reported to callers. Mirrors libvirt's `VIR_ERR_NO_DOMAIN` for
    /// missing domains.
    pub fn code(&self) -> i32 {
        match self {
            DriverError::Virt { code, .. } => *code,
            DriverError::DomainNotFound(_) => 42,
            DriverError::EventsUnsupported(_) => 3,
            DriverError::Io(_) => 38,
        }
    }
}

/// Result type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Runtime state of a defined domain, numbered like libvirt's
/// `virDomainState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    /// No state.
    NoState = 0,
    /// Running.
    Running = 1,
    /// Blocked on a resource.
    Blocked = 2,
    /// Paused by the user.
    Paused = 3,
    /// Being shut down.
    Shutdown = 4,
    /// Shut off.
    Shutoff = 5,
    /// Crashed.
    Crashed = 6,
    /// Suspended by guest power management.
    PmSuspended = 7,
}

impl DomainState {
    /// Whether the domain must be destroyed before it can be undefined.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DomainState::Running | DomainState::Blocked | DomainState::Paused
        )
    }

    /// Whether the domain is stopped (shut off or shutting down).
    pub fn is_stopped(&self) -> bool {
        matches!(self, DomainState::Shutoff | DomainState::Shutdown)
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainState::NoState => "no state",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shut off",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pmsuspended",
        };
        f.write_str(s)
    }
}

/// Why a domain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppedReason {
    /// Normal shutdown.
    Shutdown,
    /// Forced off.
    Destroyed,
    /// Guest crashed.
    Crashed,
    /// Migrated to another host.
    Migrated,
    /// Saved to a file.
    Saved,
    /// Host emulator failed.
    Failed,
    /// Offline snapshot loaded.
    FromSnapshot,
}

/// Why a domain resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumedReason {
    /// Unpaused by the user.
    Unpaused,
    /// Resumed at the end of an incoming migration.
    Migrated,
    /// Resumed from a snapshot.
    FromSnapshot,
}

/// Lifecycle event kinds the driver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Domain was defined.
    Defined,
    /// Domain was undefined.
    Undefined,
    /// Domain started.
    Started,
    /// Domain was suspended.
    Suspended,
    /// Domain resumed.
    Resumed(ResumedReason),
    /// Domain stopped.
    Stopped(StoppedReason),
    /// Guest initiated shutdown.
    Shutdown,
    /// Guest crashed.
    Crashed,
    /// Guest power management suspended.
    PmSuspended,
}

/// A lifecycle notification for one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
    /// Domain name or uuid as reported by the driver.
    pub domain: String,
    /// Descriptor captured with the event, when the driver provides it.
    pub xml: Option<String>,
    /// What happened.
    pub event: LifecycleEvent,
}

/// Virtualization driver.
#[async_trait]
pub trait VirtDriver: Send + Sync {
    /// Short name of this driver, used in logs.
    fn driver_type(&self) -> &'static str;

    /// URI of the virtualization layer this driver talks to.
    fn uri(&self) -> &str;

    /// Host capabilities document.
    async fn capabilities(&self) -> Result<String>;

    /// State of the domain named by `domain` (uuid or name), `None` when not defined.
    async fn lookup(&self, domain: &str) -> Result<Option<DomainState>>;

    /// Define (or redefine) a domain from its descriptor.
    async fn define(&self, xml: &str) -> Result<()>;

    /// Start a defined domain.
    async fn start(&self, domain: &str) -> Result<()>;

    /// Ask the guest to shut down.
    async fn shutdown(&self, domain: &str) -> Result<()>;

    /// Force the domain off.
    async fn destroy(&self, domain: &str) -> Result<()>;

    /// Remove the domain definition.
    async fn undefine(&self, domain: &str) -> Result<()>;

    /// Current descriptor.
    async fn xml_desc(&self, domain: &str) -> Result<String>;

    /// Live-migrate a running domain to `destination_uri`.
    async fn migrate(&self, domain: &str, destination_uri: &str) -> Result<()>;

    /// Subscribe to lifecycle events for every domain.
    ///
    /// Returns [`DriverError::EventsUnsupported`] when the layer cannot
    /// deliver events. Called once at startup.
    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<DomainEvent>>;
}
